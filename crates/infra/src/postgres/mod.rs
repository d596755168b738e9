//! Postgres adapters: pool setup, schema and the stores built on them.

mod ledger;
mod statistics;
mod unit_of_work;

pub use ledger::PostgresStatusLedger;
pub use statistics::PostgresStatisticStore;
pub use unit_of_work::PgUnitOfWork;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

const SCHEMA: &str = include_str!("../../migrations/0001_job_status.sql");

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Create the tables if missing. Safe to run on every start.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("job status schema ready");
    Ok(())
}

/// Render a SQLx error with the operation that hit it.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!("database error {code} in {operation}: {}", db_err.message()),
            None => format!("database error in {operation}: {}", db_err.message()),
        },
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        sqlx::Error::RowNotFound => format!("unexpected row not found in {operation}"),
        other => format!("sqlx error in {operation}: {other}"),
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_name_the_operation() {
        assert_eq!(
            map_sqlx_error("merge_status", sqlx::Error::PoolClosed),
            "connection pool closed in merge_status"
        );
        assert!(map_sqlx_error("load_status", sqlx::Error::RowNotFound).contains("load_status"));
        assert!(!is_unique_violation(&sqlx::Error::PoolClosed));
    }

    #[test]
    fn schema_defines_both_tables() {
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS job_status"));
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS job_statistics"));
    }
}
