//! Postgres-backed job status ledger.
//!
//! One row per job key in `job_status`. Transitions run in a transaction
//! that locks the row (`SELECT ... FOR UPDATE`), applies the state change
//! with the same rules as the in-memory ledger, and writes it back.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | LedgerError | Scenario |
//! |------------|----------------------|-------------|----------|
//! | Database (unique violation) | `23505` | `AlreadyExists` | `create` raced another registration of the same key |
//! | Database (check constraint violation) | `23514` | `Storage` | Unknown state or negative attempt count |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | Other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! ## Runtime
//!
//! [`StatusLedger`] is synchronous. Calls go through a [`PgUnitOfWork`],
//! which drives them with `Handle::block_on` inside the calling thread's
//! open transaction if there is one. They must come from threads that are
//! not themselves running async tasks (the executor's worker threads, for
//! instance).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Connection, FromRow, PgConnection, Row};
use tracing::debug;

use jobwright_core::TenantKey;
use jobwright_jobs::{
    JobKey, JobState, JobStatus, LedgerError, LedgerStats, StatusLedger, StatusQuery, StatusUpdate,
};

use super::unit_of_work::PgUnitOfWork;
use super::{is_unique_violation, map_sqlx_error};

#[derive(Debug, Clone)]
pub struct PostgresStatusLedger {
    session: Arc<PgUnitOfWork>,
}

impl PostgresStatusLedger {
    pub fn new(session: Arc<PgUnitOfWork>) -> Self {
        Self { session }
    }

    fn run<T>(&self, op: impl AsyncFnOnce(&mut PgConnection) -> Result<T, LedgerError>) -> Result<T, LedgerError> {
        self.session
            .run(op)
            .map_err(|e| ledger_error("acquire_connection", e))?
    }
}

async fn create_status(conn: &mut PgConnection, status: &JobStatus) -> Result<(), LedgerError> {
    let attempts = attempts_column(status.attempts)?;
    sqlx::query(
        r#"
        INSERT INTO job_status (
            id, kind, state, triggered, owner_id, result, attempts,
            created_at, updated_at, started_at, finished_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(status.id.as_str())
    .bind(&status.kind)
    .bind(status.state.as_str())
    .bind(status.triggered)
    .bind(status.owner_id.as_ref().map(TenantKey::as_str))
    .bind(status.result.as_deref())
    .bind(attempts)
    .bind(status.created_at)
    .bind(status.updated_at)
    .bind(status.started_at)
    .bind(status.finished_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            LedgerError::AlreadyExists(status.id.clone())
        } else {
            ledger_error("create_status", e)
        }
    })?;

    debug!(job_id = %status.id, state = %status.state, "status row created");
    Ok(())
}

async fn load_status(conn: &mut PgConnection, key: &JobKey) -> Result<Option<JobStatus>, LedgerError> {
    let row = sqlx::query(
        r#"
        SELECT id, kind, state, triggered, owner_id, result, attempts,
               created_at, updated_at, started_at, finished_at
        FROM job_status
        WHERE id = $1
        "#,
    )
    .bind(key.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ledger_error("load_status", e))?;

    row.map(|row| decode(&row)).transpose()
}

/// Upsert keeping `created_at`. Cancelled rows are returned unchanged.
async fn merge_status(conn: &mut PgConnection, status: &JobStatus) -> Result<JobStatus, LedgerError> {
    let attempts = attempts_column(status.attempts)?;
    let row = sqlx::query(
        r#"
        INSERT INTO job_status (
            id, kind, state, triggered, owner_id, result, attempts,
            created_at, updated_at, started_at, finished_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO UPDATE SET
            kind = EXCLUDED.kind,
            state = EXCLUDED.state,
            triggered = EXCLUDED.triggered,
            owner_id = EXCLUDED.owner_id,
            result = EXCLUDED.result,
            attempts = EXCLUDED.attempts,
            updated_at = NOW(),
            started_at = EXCLUDED.started_at,
            finished_at = EXCLUDED.finished_at
        WHERE job_status.state <> 'cancelled'
        RETURNING id, kind, state, triggered, owner_id, result, attempts,
                  created_at, updated_at, started_at, finished_at
        "#,
    )
    .bind(status.id.as_str())
    .bind(&status.kind)
    .bind(status.state.as_str())
    .bind(status.triggered)
    .bind(status.owner_id.as_ref().map(TenantKey::as_str))
    .bind(status.result.as_deref())
    .bind(attempts)
    .bind(status.created_at)
    .bind(status.updated_at)
    .bind(status.started_at)
    .bind(status.finished_at)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| ledger_error("merge_status", e))?;

    match row {
        Some(row) => decode(&row),
        // The conflict guard skipped a cancelled row.
        None => load_status(conn, &status.id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(status.id.clone())),
    }
}

async fn transition_status(
    conn: &mut PgConnection,
    key: &JobKey,
    update: StatusUpdate,
) -> Result<JobStatus, LedgerError> {
    let mut tx = conn
        .begin()
        .await
        .map_err(|e| ledger_error("begin_transaction", e))?;

    let row = sqlx::query(
        r#"
        SELECT id, kind, state, triggered, owner_id, result, attempts,
               created_at, updated_at, started_at, finished_at
        FROM job_status
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(key.as_str())
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| ledger_error("lock_status", e))?;

    let mut status = match row {
        Some(row) => decode(&row)?,
        None => {
            tx.rollback().await.map_err(|e| ledger_error("rollback", e))?;
            return Err(LedgerError::NotFound(key.clone()));
        }
    };

    if let Err(e) = update.apply(&mut status) {
        tx.rollback().await.map_err(|e| ledger_error("rollback", e))?;
        return Err(e);
    }
    status.updated_at = Utc::now();

    sqlx::query(
        r#"
        UPDATE job_status
        SET state = $2,
            result = $3,
            attempts = $4,
            updated_at = $5,
            started_at = $6,
            finished_at = $7
        WHERE id = $1
        "#,
    )
    .bind(status.id.as_str())
    .bind(status.state.as_str())
    .bind(status.result.as_deref())
    .bind(attempts_column(status.attempts)?)
    .bind(status.updated_at)
    .bind(status.started_at)
    .bind(status.finished_at)
    .execute(&mut *tx)
    .await
    .map_err(|e| ledger_error("update_status", e))?;

    tx.commit().await.map_err(|e| ledger_error("commit_transaction", e))?;

    debug!(job_id = %key, state = %status.state, attempts = status.attempts, "status row updated");
    Ok(status)
}

async fn list_statuses(conn: &mut PgConnection, query: &StatusQuery) -> Result<Vec<JobStatus>, LedgerError> {
    let limit = query.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
    let rows = sqlx::query(
        r#"
        SELECT id, kind, state, triggered, owner_id, result, attempts,
               created_at, updated_at, started_at, finished_at
        FROM job_status
        WHERE ($1::text IS NULL OR owner_id = $1)
            AND ($2::text IS NULL OR state = $2)
            AND ($3::text IS NULL OR kind = $3)
        ORDER BY created_at ASC, id ASC
        LIMIT $4
        "#,
    )
    .bind(query.owner.as_ref().map(TenantKey::as_str))
    .bind(query.state.map(|s| s.as_str()))
    .bind(query.kind.as_deref())
    .bind(limit)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| ledger_error("list_statuses", e))?;

    rows.iter().map(decode).collect()
}

async fn count_by_state(conn: &mut PgConnection, owner: Option<&TenantKey>) -> Result<LedgerStats, LedgerError> {
    let rows = sqlx::query(
        r#"
        SELECT state, COUNT(*) AS total
        FROM job_status
        WHERE ($1::text IS NULL OR owner_id = $1)
        GROUP BY state
        "#,
    )
    .bind(owner.map(TenantKey::as_str))
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| ledger_error("count_by_state", e))?;

    let mut stats = LedgerStats::default();
    for row in rows {
        let state: String = row.try_get("state").map_err(|e| ledger_error("read_state", e))?;
        let total: i64 = row.try_get("total").map_err(|e| ledger_error("read_total", e))?;
        let state: JobState = state.parse().map_err(LedgerError::Storage)?;
        stats.add(state, usize::try_from(total).unwrap_or(0));
    }
    Ok(stats)
}

impl StatusLedger for PostgresStatusLedger {
    fn create(&self, status: &JobStatus) -> Result<(), LedgerError> {
        self.run(async |conn: &mut PgConnection| create_status(conn, status).await)
    }

    fn get(&self, key: &JobKey) -> Result<Option<JobStatus>, LedgerError> {
        self.run(async |conn: &mut PgConnection| load_status(conn, key).await)
    }

    fn merge(&self, status: &JobStatus) -> Result<JobStatus, LedgerError> {
        self.run(async |conn: &mut PgConnection| merge_status(conn, status).await)
    }

    fn transition(&self, key: &JobKey, update: StatusUpdate) -> Result<JobStatus, LedgerError> {
        self.run(async move |conn: &mut PgConnection| transition_status(conn, key, update).await)
    }

    fn list(&self, query: &StatusQuery) -> Result<Vec<JobStatus>, LedgerError> {
        self.run(async |conn: &mut PgConnection| list_statuses(conn, query).await)
    }

    fn stats(&self, owner: Option<&TenantKey>) -> Result<LedgerStats, LedgerError> {
        self.run(async |conn: &mut PgConnection| count_by_state(conn, owner).await)
    }
}

fn ledger_error(operation: &str, err: sqlx::Error) -> LedgerError {
    LedgerError::Storage(map_sqlx_error(operation, err))
}

fn attempts_column(attempts: u32) -> Result<i32, LedgerError> {
    i32::try_from(attempts).map_err(|_| LedgerError::Storage(format!("attempt count {attempts} out of range")))
}

fn decode(row: &PgRow) -> Result<JobStatus, LedgerError> {
    StatusRow::from_row(row)
        .map_err(|e| LedgerError::Storage(format!("failed to deserialize status row: {e}")))?
        .try_into()
}

// SQLx row types

#[derive(Debug, Clone)]
struct StatusRow {
    id: String,
    kind: String,
    state: String,
    triggered: bool,
    owner_id: Option<String>,
    result: Option<String>,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for StatusRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StatusRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            state: row.try_get("state")?,
            triggered: row.try_get("triggered")?,
            owner_id: row.try_get("owner_id")?,
            result: row.try_get("result")?,
            attempts: row.try_get("attempts")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

impl TryFrom<StatusRow> for JobStatus {
    type Error = LedgerError;

    fn try_from(row: StatusRow) -> Result<Self, Self::Error> {
        let id = JobKey::new(row.id).map_err(|e| LedgerError::Storage(format!("invalid job key: {e}")))?;
        let state = row.state.parse().map_err(LedgerError::Storage)?;
        let owner_id = row
            .owner_id
            .map(TenantKey::new)
            .transpose()
            .map_err(|e| LedgerError::Storage(format!("invalid owner id: {e}")))?;
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| LedgerError::Storage(format!("negative attempt count {}", row.attempts)))?;

        Ok(JobStatus {
            id,
            kind: row.kind,
            state,
            triggered: row.triggered,
            owner_id,
            result: row.result,
            attempts,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use jobwright_jobs::JobDefinition;

    use super::*;
    use crate::postgres::connect;

    fn row() -> StatusRow {
        let now = Utc::now();
        StatusRow {
            id: "pools.refresh-1".to_string(),
            kind: "pools.refresh".to_string(),
            state: "running".to_string(),
            triggered: true,
            owner_id: Some("acme".to_string()),
            result: None,
            attempts: 2,
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            finished_at: None,
        }
    }

    #[test]
    fn row_converts_to_status() {
        let status = JobStatus::try_from(row()).unwrap();
        assert_eq!(status.id.as_str(), "pools.refresh-1");
        assert_eq!(status.state, JobState::Running);
        assert_eq!(status.owner_id.as_ref().map(TenantKey::as_str), Some("acme"));
        assert_eq!(status.attempts, 2);
    }

    #[test]
    fn unknown_state_is_a_storage_error() {
        let bad = StatusRow {
            state: "paused".to_string(),
            ..row()
        };
        assert!(matches!(JobStatus::try_from(bad), Err(LedgerError::Storage(_))));
    }

    #[test]
    fn negative_attempts_are_rejected() {
        let bad = StatusRow { attempts: -1, ..row() };
        assert!(matches!(JobStatus::try_from(bad), Err(LedgerError::Storage(_))));
        assert!(attempts_column(u32::MAX).is_err());
    }

    /// Runs against a live database when `DATABASE_URL` is set.
    #[test]
    fn round_trip_against_postgres() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let pool = runtime.block_on(connect(&url, 2)).unwrap();
        let ledger = PostgresStatusLedger::new(Arc::new(PgUnitOfWork::new(pool, runtime.handle().clone())));

        let acme = TenantKey::new("acme").unwrap();
        let definition = JobDefinition::new("pools.refresh").with_owner(&acme);
        let status = JobStatus::new(&definition, true);

        ledger.create(&status).unwrap();
        assert!(matches!(ledger.create(&status), Err(LedgerError::AlreadyExists(_))));

        let running = ledger.transition(&status.id, StatusUpdate::running(1)).unwrap();
        assert_eq!(running.state, JobState::Running);
        assert_eq!(running.attempts, 1);

        let listed = ledger
            .list(&StatusQuery::for_owner(acme.clone()).in_state(JobState::Running).of_kind("pools.refresh"))
            .unwrap();
        assert!(listed.iter().any(|s| s.id == status.id));

        ledger.cancel(&status.id).unwrap();
        let merged = ledger.merge(&status).unwrap();
        assert_eq!(merged.state, JobState::Cancelled);
        assert!(matches!(
            ledger.transition(&status.id, StatusUpdate::running(2)),
            Err(LedgerError::InvalidTransition { .. })
        ));
        assert!(ledger.stats(Some(&acme)).unwrap().cancelled >= 1);
    }
}
