//! Postgres-backed statistic history (`job_statistics`).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, Row};

use jobwright_core::TenantKey;
use jobwright_tasks::{EntryType, Statistic, StatisticStore, StatisticStoreError};

use super::unit_of_work::PgUnitOfWork;
use super::{is_unique_violation, map_sqlx_error};

#[derive(Debug, Clone)]
pub struct PostgresStatisticStore {
    session: Arc<PgUnitOfWork>,
}

impl PostgresStatisticStore {
    pub fn new(session: Arc<PgUnitOfWork>) -> Self {
        Self { session }
    }
}

async fn insert(conn: &mut PgConnection, statistic: &Statistic) -> Result<(), StatisticStoreError> {
    sqlx::query(
        r#"
        INSERT INTO job_statistics (id, entry_type, value_type, owner_id, value, recorded_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(statistic.id)
    .bind(statistic.entry_type.as_str())
    .bind(statistic.value_type.as_str())
    .bind(statistic.owner.as_ref().map(TenantKey::as_str))
    .bind(statistic.value)
    .bind(statistic.recorded_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StatisticStoreError::Conflict(map_sqlx_error("insert_statistic", e))
        } else {
            StatisticStoreError::Storage(map_sqlx_error("insert_statistic", e))
        }
    })?;
    Ok(())
}

async fn load_history(
    conn: &mut PgConnection,
    entry: EntryType,
    owner: Option<&TenantKey>,
    limit: usize,
) -> Result<Vec<Statistic>, StatisticStoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id, entry_type, value_type, owner_id, value, recorded_at
        FROM job_statistics
        WHERE entry_type = $1 AND owner_id IS NOT DISTINCT FROM $2
        ORDER BY recorded_at DESC
        LIMIT $3
        "#,
    )
    .bind(entry.as_str())
    .bind(owner.map(TenantKey::as_str))
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| StatisticStoreError::Storage(map_sqlx_error("load_history", e)))?;

    rows.iter()
        .map(|row| {
            StatisticRow::from_row(row)
                .map_err(|e| StatisticStoreError::Storage(format!("failed to deserialize statistic row: {e}")))?
                .try_into()
        })
        .collect()
}

/// Writes join the calling thread's unit of work, so a recorded statistic
/// is rolled back with a failed run.
impl StatisticStore for PostgresStatisticStore {
    fn record(&self, statistic: &Statistic) -> Result<(), StatisticStoreError> {
        self.session
            .run(async |conn: &mut PgConnection| insert(conn, statistic).await)
            .map_err(|e| StatisticStoreError::Storage(map_sqlx_error("acquire_connection", e)))?
    }

    fn history(
        &self,
        entry: EntryType,
        owner: Option<&TenantKey>,
        limit: usize,
    ) -> Result<Vec<Statistic>, StatisticStoreError> {
        self.session
            .run(async |conn: &mut PgConnection| load_history(conn, entry, owner, limit).await)
            .map_err(|e| StatisticStoreError::Storage(map_sqlx_error("acquire_connection", e)))?
    }
}

#[derive(Debug)]
struct StatisticRow {
    id: uuid::Uuid,
    entry_type: String,
    value_type: String,
    owner_id: Option<String>,
    value: i64,
    recorded_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for StatisticRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StatisticRow {
            id: row.try_get("id")?,
            entry_type: row.try_get("entry_type")?,
            value_type: row.try_get("value_type")?,
            owner_id: row.try_get("owner_id")?,
            value: row.try_get("value")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

impl TryFrom<StatisticRow> for Statistic {
    type Error = StatisticStoreError;

    fn try_from(row: StatisticRow) -> Result<Self, Self::Error> {
        Ok(Statistic {
            id: row.id,
            entry_type: row.entry_type.parse().map_err(StatisticStoreError::Storage)?,
            value_type: row.value_type.parse().map_err(StatisticStoreError::Storage)?,
            owner: row
                .owner_id
                .map(TenantKey::new)
                .transpose()
                .map_err(|e| StatisticStoreError::Storage(format!("invalid owner id: {e}")))?,
            value: row.value,
            recorded_at: row.recorded_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use jobwright_tasks::ValueType;

    use super::*;

    #[test]
    fn row_converts_to_statistic() {
        let row = StatisticRow {
            id: uuid::Uuid::now_v7(),
            entry_type: "failed_jobs".to_string(),
            value_type: "raw".to_string(),
            owner_id: None,
            value: 4,
            recorded_at: Utc::now(),
        };
        let statistic = Statistic::try_from(row).unwrap();
        assert_eq!(statistic.entry_type, EntryType::FailedJobs);
        assert_eq!(statistic.value_type, ValueType::Raw);
        assert_eq!(statistic.value, 4);
    }

    #[test]
    fn unknown_entry_type_is_rejected() {
        let row = StatisticRow {
            id: uuid::Uuid::now_v7(),
            entry_type: "revenue".to_string(),
            value_type: "raw".to_string(),
            owner_id: None,
            value: 0,
            recorded_at: Utc::now(),
        };
        assert!(matches!(Statistic::try_from(row), Err(StatisticStoreError::Storage(_))));
    }
}
