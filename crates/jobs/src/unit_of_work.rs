//! Unit-of-work scoping for a job run.
//!
//! A unit of work is the persistence session a job body writes through. It
//! may already be open when a run starts (e.g. the caller opened it); in that
//! case the run joins it and must leave closing it to the opener.
//!
//! The opener closes it one of two ways: [`UnitOfWork::end`] keeps the work
//! (a database commit), [`UnitOfWork::abort`] discards it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitOfWorkError {
    #[error("unit of work already active")]
    AlreadyActive,
    #[error("no active unit of work")]
    NotActive,
    /// The backing store failed to open or close the session.
    #[error("unit of work backend error: {0}")]
    Backend(String),
}

/// A persistence session that can be opened and closed.
pub trait UnitOfWork: Send + Sync {
    fn begin(&self) -> Result<(), UnitOfWorkError>;

    /// Close the session, keeping its work.
    fn end(&self) -> Result<(), UnitOfWorkError>;

    /// Close the session, discarding its work. Sessions with nothing to
    /// undo just close.
    fn abort(&self) -> Result<(), UnitOfWorkError> {
        self.end()
    }
}

/// One unit of work per thread, tracked in-process.
///
/// Holds no resources. Used by the in-memory stores, whose writes are
/// visible immediately, and by tests that count opens and closes.
#[derive(Debug, Default)]
pub struct ThreadUnitOfWork {
    active: Mutex<HashSet<ThreadId>>,
    opened: AtomicU64,
    closed: AtomicU64,
    aborted: AtomicU64,
}

impl ThreadUnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.contains(&thread::current().id())
    }

    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    /// How many of the closes were aborts.
    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }
}

impl UnitOfWork for ThreadUnitOfWork {
    fn begin(&self) -> Result<(), UnitOfWorkError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(thread::current().id()) {
            return Err(UnitOfWorkError::AlreadyActive);
        }
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn end(&self) -> Result<(), UnitOfWorkError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.remove(&thread::current().id()) {
            return Err(UnitOfWorkError::NotActive);
        }
        self.closed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn abort(&self) -> Result<(), UnitOfWorkError> {
        self.end()?;
        self.aborted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// The harness's view of the unit of work. May be disabled entirely.
#[derive(Clone, Default)]
pub struct UnitOfWorkScope {
    uow: Option<Arc<dyn UnitOfWork>>,
}

impl std::fmt::Debug for UnitOfWorkScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWorkScope")
            .field("enabled", &self.uow.is_some())
            .finish()
    }
}

impl UnitOfWorkScope {
    pub fn new(uow: Arc<dyn UnitOfWork>) -> Self {
        Self { uow: Some(uow) }
    }

    pub fn disabled() -> Self {
        Self { uow: None }
    }

    /// Open a unit of work. Returns whether this call opened it (and so must
    /// close it); joining an active one is not an error.
    pub fn begin(&self) -> bool {
        let Some(uow) = &self.uow else {
            return false;
        };
        match uow.begin() {
            Ok(()) => true,
            Err(UnitOfWorkError::AlreadyActive) => {
                debug!("joining existing unit of work");
                false
            }
            Err(e) => {
                warn!(error = %e, "could not open unit of work, running without one");
                false
            }
        }
    }

    /// Close the unit of work opened by [`Self::begin`], keeping its work.
    ///
    /// Only a backend failure is an error; closing an already closed unit is
    /// tolerated.
    pub fn end(&self) -> Result<(), UnitOfWorkError> {
        let Some(uow) = &self.uow else {
            return Ok(());
        };
        match uow.end() {
            Err(UnitOfWorkError::NotActive) => {
                debug!("unit of work already closed");
                Ok(())
            }
            other => other,
        }
    }

    /// Close the unit of work opened by [`Self::begin`], discarding its work.
    pub fn abort(&self) {
        if let Some(uow) = &self.uow {
            match uow.abort() {
                Ok(()) => {}
                Err(UnitOfWorkError::NotActive) => debug!("unit of work already closed"),
                Err(e) => warn!(error = %e, "failed to abort unit of work"),
            }
        }
    }
}
