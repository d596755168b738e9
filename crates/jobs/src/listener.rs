//! Scheduler listeners.
//!
//! A listener sees every fire of the job keys it is matched to, before and
//! after the harness runs it. [`LedgerListener`] is the one registration
//! attaches: it mirrors each attempt into the status ledger.

use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::ledger::{LedgerError, StatusLedger, StatusUpdate};
use crate::status::JobState;
use crate::types::FireContext;

/// Name [`LedgerListener`] is registered under.
pub const STATUS_LISTENER: &str = "job-status";

/// Whether a fire may proceed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Veto,
}

pub trait JobListener: Send + Sync {
    fn name(&self) -> &str;

    fn job_to_be_executed(&self, fire: &FireContext) -> Verdict;

    fn job_was_executed(&self, fire: &FireContext, outcome: &Result<(), DispatchError>);
}

/// Tracks attempts in a [`StatusLedger`].
#[derive(Debug)]
pub struct LedgerListener<L> {
    ledger: L,
}

impl<L: StatusLedger> LedgerListener<L> {
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }
}

impl<L: StatusLedger> JobListener for LedgerListener<L> {
    fn name(&self) -> &str {
        STATUS_LISTENER
    }

    fn job_to_be_executed(&self, fire: &FireContext) -> Verdict {
        match self.ledger.transition(fire.key(), StatusUpdate::running(fire.refire_count)) {
            Ok(_) => Verdict::Proceed,
            Err(LedgerError::InvalidTransition { from, .. }) if from == JobState::Cancelled => {
                debug!(job_id = %fire.key(), state = %from, "skipping fire of inactive job");
                Verdict::Veto
            }
            Err(e) => {
                warn!(job_id = %fire.key(), error = %e, "could not mark job running");
                Verdict::Proceed
            }
        }
    }

    fn job_was_executed(&self, fire: &FireContext, outcome: &Result<(), DispatchError>) {
        let update = match outcome {
            Ok(()) => StatusUpdate::finished(),
            Err(e) if e.refire_requested() => StatusUpdate::refire(e.cause().to_string()),
            Err(e) => StatusUpdate::failed(e.cause().to_string()),
        };
        if let Err(e) = self.ledger.transition(fire.key(), update) {
            warn!(job_id = %fire.key(), error = %e, "could not record job outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::error::JobError;
    use crate::ledger::InMemoryStatusLedger;
    use crate::status::JobStatus;
    use crate::types::{JobDefinition, TriggerData};

    fn setup() -> (LedgerListener<Arc<InMemoryStatusLedger>>, FireContext) {
        let ledger = InMemoryStatusLedger::arc();
        let definition = JobDefinition::new("stats");
        ledger.create(&JobStatus::new(&definition, true)).unwrap();
        let fire = FireContext::new(definition, &TriggerData::new(), 1);
        (LedgerListener::new(ledger), fire)
    }

    fn state_of(listener: &LedgerListener<Arc<InMemoryStatusLedger>>, fire: &FireContext) -> JobStatus {
        listener.ledger().get(fire.key()).unwrap().unwrap()
    }

    #[test]
    fn success_marks_finished() {
        let (listener, fire) = setup();
        assert_eq!(listener.job_to_be_executed(&fire), Verdict::Proceed);
        assert_eq!(state_of(&listener, &fire).attempts, 1);

        listener.job_was_executed(&fire, &Ok(()));
        assert_eq!(state_of(&listener, &fire).state, JobState::Finished);
    }

    #[test]
    fn refire_goes_back_to_pending() {
        let (listener, fire) = setup();
        listener.job_to_be_executed(&fire);
        let outcome = Err(DispatchError::Refire {
            key: fire.key().clone(),
            attempt: 1,
            delay: Duration::ZERO,
            cause: JobError::conflict("stale"),
        });

        listener.job_was_executed(&fire, &outcome);
        let status = state_of(&listener, &fire);
        assert_eq!(status.state, JobState::Pending);
        assert!(!status.state.is_terminal());
        assert!(status.result.unwrap().contains("stale"));
    }

    #[test]
    fn fatal_marks_failed() {
        let (listener, fire) = setup();
        listener.job_to_be_executed(&fire);
        let outcome = Err(DispatchError::Fatal {
            key: fire.key().clone(),
            attempt: 1,
            cause: JobError::fatal("boom"),
        });

        listener.job_was_executed(&fire, &outcome);
        let status = state_of(&listener, &fire);
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.result.as_deref(), Some("boom"));
    }

    #[test]
    fn cancelled_job_is_vetoed() {
        let (listener, fire) = setup();
        listener.ledger().cancel(fire.key()).unwrap();
        assert_eq!(listener.job_to_be_executed(&fire), Verdict::Veto);
    }

    #[test]
    fn missing_row_does_not_block_the_fire() {
        let listener = LedgerListener::new(InMemoryStatusLedger::arc());
        let fire = FireContext::new(JobDefinition::new("stats"), &TriggerData::new(), 0);
        assert_eq!(listener.job_to_be_executed(&fire), Verdict::Proceed);
    }
}
