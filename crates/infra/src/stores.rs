use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;

use jobwright_jobs::{InMemoryStatusLedger, StatusLedger, ThreadUnitOfWork, UnitOfWork};
use jobwright_tasks::{InMemoryStatisticStore, StatisticStore};

use crate::config::{StoreBackend, StoreConfig};
use crate::postgres::{self, PgUnitOfWork, PostgresStatisticStore, PostgresStatusLedger};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to connect to postgres: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("failed to prepare schema: {0}")]
    Schema(#[source] sqlx::Error),
}

/// The ledger and statistic store the worker runs on, plus the unit of
/// work their writes join during a job run.
#[derive(Clone)]
pub struct Stores {
    pub ledger: Arc<dyn StatusLedger>,
    pub statistics: Arc<dyn StatisticStore>,
    pub unit_of_work: Arc<dyn UnitOfWork>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            ledger: Arc::new(InMemoryStatusLedger::new()),
            statistics: Arc::new(InMemoryStatisticStore::new()),
            unit_of_work: Arc::new(ThreadUnitOfWork::new()),
        }
    }

    /// Open the configured backend. Postgres stores keep `handle` to drive
    /// their queries, so this must not be called from an async task.
    pub fn open(config: &StoreConfig, handle: &Handle) -> Result<Self, StoreError> {
        match &config.backend {
            StoreBackend::InMemory => {
                info!("using in-memory stores");
                Ok(Self::in_memory())
            }
            StoreBackend::Postgres { database_url } => {
                let pool = handle
                    .block_on(postgres::connect(database_url, config.max_connections))
                    .map_err(StoreError::Connect)?;
                handle.block_on(postgres::ensure_schema(&pool)).map_err(StoreError::Schema)?;
                info!(max_connections = config.max_connections, "using postgres stores");
                let session = Arc::new(PgUnitOfWork::new(pool, handle.clone()));
                Ok(Self {
                    ledger: Arc::new(PostgresStatusLedger::new(session.clone())),
                    statistics: Arc::new(PostgresStatisticStore::new(session.clone())),
                    unit_of_work: session,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use jobwright_jobs::{JobDefinition, JobStatus, UnitOfWorkError};

    use super::*;

    #[test]
    fn in_memory_backend_needs_no_runtime_work() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let stores = Stores::open(&StoreConfig::default(), runtime.handle()).unwrap();

        let status = JobStatus::new(&JobDefinition::new("statistics.history"), false);
        stores.ledger.create(&status).unwrap();
        assert_eq!(stores.ledger.stats(None).unwrap().created, 1);
    }

    #[test]
    fn in_memory_unit_of_work_is_per_thread_and_single_open() {
        let stores = Stores::in_memory();

        stores.unit_of_work.begin().unwrap();
        assert_eq!(stores.unit_of_work.begin(), Err(UnitOfWorkError::AlreadyActive));
        stores.unit_of_work.end().unwrap();
        assert_eq!(stores.unit_of_work.end(), Err(UnitOfWorkError::NotActive));
    }
}
