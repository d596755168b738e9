//! Registering job definitions with a scheduler and the status ledger.

use tracing::{error, info, warn};

use crate::job::Job;
use crate::ledger::{LedgerError, StatusLedger, StatusUpdate};
use crate::listener::STATUS_LISTENER;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::status::JobStatus;
use crate::types::{JobDefinition, JobKey, Trigger, TriggerData};

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("scheduling job {key} failed: {source}")]
    Scheduler {
        key: JobKey,
        #[source]
        source: SchedulerError,
    },
    #[error("recording status of job {key} failed: {source}")]
    Ledger {
        key: JobKey,
        #[source]
        source: LedgerError,
    },
    #[error("job {0} is not schedulable at this time")]
    NotSchedulable(JobKey),
}

impl RegistrationError {
    pub fn key(&self) -> &JobKey {
        match self {
            RegistrationError::Scheduler { key, .. }
            | RegistrationError::Ledger { key, .. }
            | RegistrationError::NotSchedulable(key) => key,
        }
    }
}

/// Register `definition` with the scheduler and record its status.
///
/// With a trigger the job is scheduled and its status starts `Pending`;
/// without one it is stored for manual runs and starts `Created`.
///
/// Registering a key that already has a status row is not an error: the
/// existing row is merged back and returned, and the scheduler is left as
/// it is. Any scheduler failure after the row was created marks the row
/// `Failed` before the error is returned.
pub fn schedule_job<L, S>(
    ledger: &L,
    scheduler: &S,
    definition: &JobDefinition,
    trigger: Option<&Trigger>,
) -> Result<JobStatus, RegistrationError>
where
    L: StatusLedger + ?Sized,
    S: Scheduler + ?Sized,
{
    let key = &definition.key;
    scheduler
        .add_listener_matcher(STATUS_LISTENER, key)
        .map_err(|source| RegistrationError::Scheduler {
            key: key.clone(),
            source,
        })?;

    let status = JobStatus::new(definition, trigger.is_some());
    match ledger.create(&status) {
        Ok(()) => {}
        Err(LedgerError::AlreadyExists(_)) => return adopt_existing(ledger, key),
        Err(source) => {
            return Err(RegistrationError::Ledger {
                key: key.clone(),
                source,
            });
        }
    }

    let attached = match trigger {
        Some(trigger) => scheduler.schedule_job(definition, trigger),
        None => scheduler.add_job(definition, false),
    };
    if let Err(source) = attached {
        fail_status(ledger, key, &source);
        return Err(RegistrationError::Scheduler {
            key: key.clone(),
            source,
        });
    }

    info!(job_id = %key, kind = %definition.kind, triggered = trigger.is_some(), "job registered");
    Ok(status)
}

/// Register `definition` without a trigger and fire it once right away.
///
/// The job's [`Job::is_schedulable`] check runs first; a refusal leaves no
/// trace in the ledger.
pub fn submit_now<L, S>(
    ledger: &L,
    scheduler: &S,
    job: &dyn Job,
    definition: &JobDefinition,
) -> Result<JobStatus, RegistrationError>
where
    L: StatusLedger,
    S: Scheduler + ?Sized,
{
    let candidate = JobStatus::new(definition, false);
    if !job.is_schedulable(ledger, &candidate) {
        info!(job_id = %definition.key, kind = %definition.kind, "job not schedulable, skipping");
        return Err(RegistrationError::NotSchedulable(definition.key.clone()));
    }

    let status = schedule_job(ledger, scheduler, definition, None)?;
    if let Err(source) = scheduler.trigger_now(&definition.key, TriggerData::new()) {
        fail_status(ledger, &definition.key, &source);
        return Err(RegistrationError::Scheduler {
            key: definition.key.clone(),
            source,
        });
    }
    Ok(status)
}

fn adopt_existing<L>(ledger: &L, key: &JobKey) -> Result<JobStatus, RegistrationError>
where
    L: StatusLedger + ?Sized,
{
    let to_ledger_error = |source: LedgerError| RegistrationError::Ledger {
        key: key.clone(),
        source,
    };
    let existing = ledger
        .get(key)
        .map_err(to_ledger_error)?
        .ok_or_else(|| to_ledger_error(LedgerError::NotFound(key.clone())))?;
    let merged = ledger.merge(&existing).map_err(to_ledger_error)?;
    warn!(job_id = %key, state = %merged.state, "job already registered, keeping existing status");
    Ok(merged)
}

fn fail_status<L>(ledger: &L, key: &JobKey, cause: &SchedulerError)
where
    L: StatusLedger + ?Sized,
{
    error!(job_id = %key, error = %cause, "job registration failed");
    if let Err(e) = ledger.transition(key, StatusUpdate::failed(cause.to_string())) {
        warn!(job_id = %key, error = %e, "could not mark job status failed");
    }
}
