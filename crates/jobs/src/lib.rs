//! `jobwright-jobs` — transactional job harness.
//!
//! A [`Job`] supplies only its body. The [`JobHarness`] wraps every attempt
//! in an execution-context span, a unit of work and an event buffer, turns
//! failures into refire decisions, and guarantees cleanup. Registration
//! ([`schedule_job`]) keeps one [`JobStatus`] row per job key in a
//! [`StatusLedger`], and the [`LocalScheduler`] plus [`JobExecutor`] run
//! registered jobs in-process.

pub mod config;
pub mod error;
pub mod executor;
pub mod harness;
pub mod job;
pub mod ledger;
pub mod listener;
pub mod registration;
pub mod retry;
pub mod scheduler;
pub mod status;
pub mod types;
pub mod unit_of_work;

pub use config::{DEFAULT_MAX_RETRIES, HarnessConfig, MAX_RETRIES_ENV};
pub use error::{DispatchError, FailureKind, JobError};
pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle};
pub use harness::{JobHarness, RequestScope, ScopeEntry};
pub use job::{Job, JobContext};
pub use ledger::{InMemoryStatusLedger, LedgerError, LedgerStats, StatusLedger, StatusQuery, StatusUpdate};
pub use listener::{JobListener, LedgerListener, STATUS_LISTENER, Verdict};
pub use registration::{RegistrationError, schedule_job, submit_now};
pub use retry::{Backoff, BackoffStrategy, RetryDecision, RetryPolicy};
pub use scheduler::{FireOutcome, FireReport, JobRegistry, LocalScheduler, Scheduler, SchedulerError};
pub use status::{JobState, JobStatus};
pub use types::{FireContext, JobDefinition, JobKey, JobRun, Schedule, Trigger, TriggerData};
pub use unit_of_work::{ThreadUnitOfWork, UnitOfWork, UnitOfWorkError, UnitOfWorkScope};
