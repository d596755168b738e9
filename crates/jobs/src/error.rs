//! Job failures and dispatch outcomes.

use std::time::Duration;

use crate::types::JobKey;

/// How a job failure is treated by the retry policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Optimistic-lock or uniqueness conflict while persisting.
    PersistenceConflict,
    /// The job body asked to be run again.
    ExplicitRetry,
    /// Anything else.
    Fatal,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Fatal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::PersistenceConflict => "persistence_conflict",
            FailureKind::ExplicitRetry => "explicit_retry",
            FailureKind::Fatal => "fatal",
        }
    }
}

/// Error returned by a job body.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("persistence conflict: {0}")]
    PersistenceConflict(String),
    #[error("retry requested: {0}")]
    Retry(String),
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl JobError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::PersistenceConflict(msg.into())
    }

    pub fn retry(msg: impl Into<String>) -> Self {
        Self::Retry(msg.into())
    }

    pub fn fatal(msg: impl std::fmt::Display) -> Self {
        Self::Fatal(anyhow::anyhow!("{msg}"))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::PersistenceConflict(_) => FailureKind::PersistenceConflict,
            JobError::Retry(_) => FailureKind::ExplicitRetry,
            JobError::Fatal(_) => FailureKind::Fatal,
        }
    }
}

/// Failed dispatch, as reported to the scheduler.
///
/// `Refire` asks the scheduler to run the same job key again; the other two
/// variants end the logical run.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("job {key} attempt {attempt} failed, refire requested: {cause}")]
    Refire {
        key: JobKey,
        attempt: u32,
        delay: Duration,
        #[source]
        cause: JobError,
    },
    #[error("job {key} gave up after attempt {attempt}: {cause}")]
    RetriesExhausted {
        key: JobKey,
        attempt: u32,
        #[source]
        cause: JobError,
    },
    #[error("job {key} attempt {attempt} failed: {cause}")]
    Fatal {
        key: JobKey,
        attempt: u32,
        #[source]
        cause: JobError,
    },
}

impl DispatchError {
    pub fn refire_requested(&self) -> bool {
        matches!(self, DispatchError::Refire { .. })
    }

    pub fn key(&self) -> &JobKey {
        match self {
            DispatchError::Refire { key, .. }
            | DispatchError::RetriesExhausted { key, .. }
            | DispatchError::Fatal { key, .. } => key,
        }
    }

    pub fn attempt(&self) -> u32 {
        match self {
            DispatchError::Refire { attempt, .. }
            | DispatchError::RetriesExhausted { attempt, .. }
            | DispatchError::Fatal { attempt, .. } => *attempt,
        }
    }

    pub fn cause(&self) -> &JobError {
        match self {
            DispatchError::Refire { cause, .. }
            | DispatchError::RetriesExhausted { cause, .. }
            | DispatchError::Fatal { cause, .. } => cause,
        }
    }

    /// Delay before the refire, if one was requested.
    pub fn refire_delay(&self) -> Option<Duration> {
        match self {
            DispatchError::Refire { delay, .. } => Some(*delay),
            _ => None,
        }
    }
}
