//! The job contract.

use jobwright_events::{EventQueue, OutboundEvent};
use jobwright_observability::ExecutionContext;

use crate::error::{FailureKind, JobError};
use crate::ledger::StatusLedger;
use crate::status::JobStatus;
use crate::types::{JobRun, TriggerData};

/// A unit of background work run by the harness.
///
/// Implementors only supply [`Job::execute`]; logging context, unit of work,
/// event buffering and refire decisions are handled around it.
pub trait Job: Send + Sync {
    /// Name used in logs and for handler routing.
    fn name(&self) -> &str;

    fn execute(&self, ctx: &mut JobContext<'_>) -> Result<(), JobError>;

    /// Whether the harness logs start and elapsed time for each run.
    fn log_execution_time(&self) -> bool {
        true
    }

    /// Map a failure to its retry classification.
    fn classify(&self, error: &JobError) -> FailureKind {
        error.kind()
    }

    /// Checked before a one-shot submission. `status` is the row about to be
    /// created for this submission.
    fn is_schedulable(&self, ledger: &dyn StatusLedger, status: &JobStatus) -> bool {
        let _ = (ledger, status);
        true
    }
}

/// What a job body sees during a run.
pub struct JobContext<'a> {
    run: &'a JobRun,
    data: &'a TriggerData,
    context: &'a ExecutionContext,
    events: &'a mut dyn EventQueue,
}

impl<'a> JobContext<'a> {
    pub fn new(
        run: &'a JobRun,
        data: &'a TriggerData,
        context: &'a ExecutionContext,
        events: &'a mut dyn EventQueue,
    ) -> Self {
        Self {
            run,
            data,
            context,
            events,
        }
    }

    pub fn run(&self) -> &JobRun {
        self.run
    }

    /// Job data merged with the firing trigger's data.
    pub fn data(&self) -> &TriggerData {
        self.data
    }

    pub fn context(&self) -> &ExecutionContext {
        self.context
    }

    pub fn attempt(&self) -> u32 {
        self.run.attempt
    }

    /// Queue an event for emission once the run succeeds.
    ///
    /// Events without a tenant are attributed to the run's owner.
    pub fn emit(&mut self, event: OutboundEvent) {
        let event = match (event.tenant(), &self.run.tenant) {
            (None, Some(owner)) => event.for_tenant(owner.clone()),
            _ => event,
        };
        self.events.queue(event);
    }
}

impl std::fmt::Debug for JobContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("run", &self.run)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use jobwright_core::TenantKey;

    use super::*;
    use crate::types::{FireContext, JobDefinition};

    #[derive(Default)]
    struct Collected(Vec<OutboundEvent>);

    impl EventQueue for Collected {
        fn queue(&mut self, event: OutboundEvent) {
            self.0.push(event);
        }
    }

    #[test]
    fn emitted_events_inherit_run_owner() {
        let acme = TenantKey::new("acme").unwrap();
        let fire = FireContext::new(JobDefinition::new("stats").with_owner(&acme), &TriggerData::new(), 0);
        let run = JobRun::begin(&fire);
        let exec = ExecutionContext::for_job(run.key.as_str(), run.run_id);
        let mut sink = Collected::default();

        {
            let mut ctx = JobContext::new(&run, &fire.data, &exec, &mut sink);
            ctx.emit(OutboundEvent::new("stats.recorded", "pool-1", serde_json::json!({})));
            ctx.emit(
                OutboundEvent::new("stats.recorded", "pool-2", serde_json::json!({}))
                    .for_tenant(TenantKey::new("other").unwrap()),
            );
        }

        assert_eq!(sink.0[0].tenant(), Some(&acme));
        assert_eq!(sink.0[1].tenant().unwrap().as_str(), "other");
    }
}
