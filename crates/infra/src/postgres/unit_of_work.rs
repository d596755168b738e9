//! Postgres unit of work: one open transaction per worker thread.
//!
//! `begin` takes a connection from the pool and starts a transaction for the
//! calling thread. Until `end` (commit) or `abort` (rollback), every store
//! call made on that thread runs inside it. Calls from threads without an
//! open unit run on their own pooled connection, as before.
//!
//! Stores nest their own transactions (e.g. the ledger's row lock) inside
//! the open one, which Postgres turns into savepoints.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tokio::runtime::Handle;
use tracing::debug;

use jobwright_jobs::{UnitOfWork, UnitOfWorkError};

use super::map_sqlx_error;

type OpenTransactions = HashMap<ThreadId, Transaction<'static, Postgres>>;

pub struct PgUnitOfWork {
    pool: Arc<PgPool>,
    handle: Handle,
    open: Mutex<OpenTransactions>,
}

impl std::fmt::Debug for PgUnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgUnitOfWork")
            .field("open", &self.transactions().len())
            .finish_non_exhaustive()
    }
}

impl PgUnitOfWork {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the calling thread has an open transaction.
    pub fn is_active(&self) -> bool {
        self.transactions().contains_key(&thread::current().id())
    }

    /// Run `op` on the calling thread's open transaction, or on a pooled
    /// connection when there is none. The outer error is a failure to get a
    /// connection.
    pub(crate) fn run<T>(&self, op: impl AsyncFnOnce(&mut PgConnection) -> T) -> Result<T, sqlx::Error> {
        let id = thread::current().id();
        // Taken out so the map is not locked across the query.
        let taken = self.transactions().remove(&id);
        match taken {
            Some(mut tx) => {
                let result = self.handle.block_on(op(&mut *tx));
                self.transactions().insert(id, tx);
                Ok(result)
            }
            None => self.handle.block_on(async move {
                let mut conn = self.pool.acquire().await?;
                Ok(op(&mut *conn).await)
            }),
        }
    }

    fn transactions(&self) -> MutexGuard<'_, OpenTransactions> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_current(&self) -> Result<Transaction<'static, Postgres>, UnitOfWorkError> {
        self.transactions()
            .remove(&thread::current().id())
            .ok_or(UnitOfWorkError::NotActive)
    }
}

impl UnitOfWork for PgUnitOfWork {
    fn begin(&self) -> Result<(), UnitOfWorkError> {
        if self.is_active() {
            return Err(UnitOfWorkError::AlreadyActive);
        }
        let tx = self
            .handle
            .block_on(self.pool.begin())
            .map_err(|e| UnitOfWorkError::Backend(map_sqlx_error("begin_unit_of_work", e)))?;
        self.transactions().insert(thread::current().id(), tx);
        debug!("unit of work opened");
        Ok(())
    }

    fn end(&self) -> Result<(), UnitOfWorkError> {
        let tx = self.take_current()?;
        self.handle
            .block_on(tx.commit())
            .map_err(|e| UnitOfWorkError::Backend(map_sqlx_error("commit_unit_of_work", e)))?;
        debug!("unit of work committed");
        Ok(())
    }

    fn abort(&self) -> Result<(), UnitOfWorkError> {
        let tx = self.take_current()?;
        self.handle
            .block_on(tx.rollback())
            .map_err(|e| UnitOfWorkError::Backend(map_sqlx_error("rollback_unit_of_work", e)))?;
        debug!("unit of work rolled back");
        Ok(())
    }
}
