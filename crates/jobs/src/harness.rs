//! Transactional run wrapper.
//!
//! [`JobHarness::run`] executes one attempt of a job inside:
//!
//! - a request scope (if one is configured) and a `job_run` tracing span
//!   carrying the run's execution context
//! - a unit of work, joined if one is already active. A unit the run opened
//!   is committed before events are flushed and aborted on failure
//! - an event buffer that is flushed only when the body succeeds
//!
//! A failure is classified and handed to the retry policy, and the outcome
//! comes back as a [`DispatchError`] the scheduler understands. Scope exit,
//! unit-of-work close and elapsed-time logging happen on every path,
//! including a panicking job body.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};

use jobwright_events::{EventBuffer, EventBus, EventSink, OutboundEvent};
use jobwright_observability::ExecutionContext;

use crate::config::HarnessConfig;
use crate::error::{DispatchError, JobError};
use crate::job::{Job, JobContext};
use crate::retry::RetryPolicy;
use crate::types::{FireContext, JobRun};
use crate::unit_of_work::{UnitOfWorkError, UnitOfWorkScope};

/// Ambient per-request state (e.g. request-scoped caches) bracketing a run.
pub trait RequestScope: Send + Sync {
    fn enter(&self, context: &ExecutionContext);
    fn exit(&self);
}

/// Whether a run actually entered a request scope.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScopeEntry {
    Entered,
    /// No scope configured; exit is a no-op.
    Unavailable,
}

pub struct JobHarness<B> {
    policy: RetryPolicy,
    bus: B,
    unit_of_work: UnitOfWorkScope,
    request_scope: Option<Arc<dyn RequestScope>>,
}

impl<B> std::fmt::Debug for JobHarness<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHarness")
            .field("policy", &self.policy)
            .field("unit_of_work", &self.unit_of_work)
            .field("request_scope", &self.request_scope.is_some())
            .finish_non_exhaustive()
    }
}

impl<B> JobHarness<B>
where
    B: EventBus<OutboundEvent>,
{
    pub fn new(config: &HarnessConfig, bus: B) -> Self {
        Self {
            policy: config.retry_policy(),
            bus,
            unit_of_work: UnitOfWorkScope::disabled(),
            request_scope: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_unit_of_work(mut self, unit_of_work: UnitOfWorkScope) -> Self {
        self.unit_of_work = unit_of_work;
        self
    }

    pub fn with_request_scope(mut self, scope: Arc<dyn RequestScope>) -> Self {
        self.request_scope = Some(scope);
        self
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one attempt of `job` for the given fire.
    pub fn run(&self, job: &dyn Job, fire: &FireContext) -> Result<(), DispatchError> {
        let mut run = JobRun::begin(fire);
        let context = ExecutionContext::for_job(run.key.as_str(), run.run_id)
            .with_tenant(run.tenant.clone())
            .with_log_level(run.log_level);

        let entry = self.enter_scope(&context);
        let span = context.span();
        let _entered = span.enter();

        // Declared after the span guard so it drops first, while the span is
        // still entered.
        let mut guard = RunGuard {
            scope: self.request_scope.as_deref().filter(|_| entry == ScopeEntry::Entered),
            unit_of_work: &self.unit_of_work,
            owns_unit_of_work: false,
            started: Instant::now(),
            log_time: job.log_execution_time(),
        };

        if guard.log_time {
            info!(job = job.name(), attempt = run.attempt, "starting job");
        }
        debug!(scheduled_for = %fire.scheduled_for, fired_at = %fire.fired_at, "job fired");

        guard.owns_unit_of_work = self.unit_of_work.begin();

        let mut events = EventBuffer::new(&self.bus);
        let outcome = {
            let mut ctx = JobContext::new(&run, &fire.data, &context, &mut events);
            panic::catch_unwind(AssertUnwindSafe(|| job.execute(&mut ctx)))
                .unwrap_or_else(|payload| Err(JobError::fatal(format!("job panicked: {}", panic_message(&*payload)))))
        };
        run.finish();

        match outcome {
            // Persistence commits before any event leaves, so a failed commit
            // discards both.
            Ok(()) => match guard.commit() {
                Err(e) => {
                    events.rollback();
                    self.on_failure(job, run, JobError::retry(format!("unit of work commit failed: {e}")))
                }
                Ok(()) => self.flush(events, run),
            },
            Err(cause) => {
                events.rollback();
                self.on_failure(job, run, cause)
            }
        }
    }

    fn flush(&self, mut events: EventBuffer<'_, B>, run: JobRun) -> Result<(), DispatchError> {
        match events.send_events() {
            Ok(sent) => {
                debug!(sent, "job completed");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "job completed but its events could not be sent");
                Err(DispatchError::Fatal {
                    key: run.key,
                    attempt: run.attempt,
                    cause: JobError::Fatal(anyhow::Error::new(e)),
                })
            }
        }
    }

    fn on_failure(&self, job: &dyn Job, run: JobRun, cause: JobError) -> Result<(), DispatchError> {
        let kind = job.classify(&cause);
        if !kind.is_retryable() {
            error!(attempt = run.attempt, error = %cause, "job failed");
            return Err(DispatchError::Fatal {
                key: run.key,
                attempt: run.attempt,
                cause,
            });
        }

        let decision = self.policy.should_retry(run.attempt, kind, &cause);
        if decision.retry {
            Err(DispatchError::Refire {
                key: run.key,
                attempt: run.attempt,
                delay: decision.delay,
                cause,
            })
        } else {
            Err(DispatchError::RetriesExhausted {
                key: run.key,
                attempt: run.attempt,
                cause,
            })
        }
    }

    fn enter_scope(&self, context: &ExecutionContext) -> ScopeEntry {
        match &self.request_scope {
            Some(scope) => {
                scope.enter(context);
                ScopeEntry::Entered
            }
            None => ScopeEntry::Unavailable,
        }
    }
}

/// Cleanup that must run however the attempt ends.
struct RunGuard<'a> {
    scope: Option<&'a dyn RequestScope>,
    unit_of_work: &'a UnitOfWorkScope,
    owns_unit_of_work: bool,
    started: Instant,
    log_time: bool,
}

impl RunGuard<'_> {
    /// Commit the unit of work this run opened. Afterwards the guard no
    /// longer closes it.
    fn commit(&mut self) -> Result<(), UnitOfWorkError> {
        if !std::mem::take(&mut self.owns_unit_of_work) {
            return Ok(());
        }
        self.unit_of_work.end()
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Some(scope) = self.scope {
            scope.exit();
        }
        // Still owned here means the run failed or panicked.
        if self.owns_unit_of_work {
            self.unit_of_work.abort();
        }
        if self.log_time {
            let elapsed_ms = self.started.elapsed().as_millis() as u64;
            info!(elapsed_ms, "job execution time");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use jobwright_events::InMemoryEventBus;
    use tracing_subscriber::EnvFilter;

    use super::*;
    use crate::error::FailureKind;
    use crate::types::{JobDefinition, TriggerData};
    use crate::unit_of_work::{ThreadUnitOfWork, UnitOfWork};

    struct FnJob<F>(F);

    impl<F> Job for FnJob<F>
    where
        F: Fn(&mut JobContext<'_>) -> Result<(), JobError> + Send + Sync,
    {
        fn name(&self) -> &str {
            "fn-job"
        }

        fn execute(&self, ctx: &mut JobContext<'_>) -> Result<(), JobError> {
            (self.0)(ctx)
        }
    }

    #[derive(Default)]
    struct RecordingScope {
        entered: Mutex<Vec<String>>,
        exits: AtomicUsize,
    }

    impl RequestScope for RecordingScope {
        fn enter(&self, context: &ExecutionContext) {
            self.entered.lock().unwrap().push(context.job_id().to_string());
        }

        fn exit(&self) {
            self.exits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fire(refire_count: u32) -> FireContext {
        FireContext::new(JobDefinition::new("test"), &TriggerData::new(), refire_count)
    }

    fn harness(max_retries: i32) -> JobHarness<InMemoryEventBus<OutboundEvent>> {
        JobHarness::new(&HarnessConfig::default().with_max_retries(max_retries), InMemoryEventBus::new())
    }

    #[test]
    fn success_flushes_events() {
        let harness = harness(3);
        let job = FnJob(|ctx: &mut JobContext<'_>| {
            ctx.emit(OutboundEvent::new("pool.modified", "p1", serde_json::json!({})));
            Ok(())
        });

        assert!(harness.run(&job, &fire(0)).is_ok());
        assert_eq!(harness.bus().published_count(), 1);
    }

    #[test]
    fn failure_discards_events() {
        let harness = harness(3);
        let job = FnJob(|ctx: &mut JobContext<'_>| {
            ctx.emit(OutboundEvent::new("pool.modified", "p1", serde_json::json!({})));
            Err(JobError::conflict("stale"))
        });

        let err = harness.run(&job, &fire(0)).unwrap_err();
        assert!(err.refire_requested());
        assert_eq!(harness.bus().published_count(), 0);
    }

    #[test]
    fn fatal_error_is_not_refired() {
        let harness = harness(-1);
        let job = FnJob(|_: &mut JobContext<'_>| Err(JobError::fatal("bad input")));

        let err = harness.run(&job, &fire(0)).unwrap_err();
        assert!(matches!(err, DispatchError::Fatal { .. }));
    }

    #[test]
    fn exhausted_retries_stop_refiring() {
        let harness = harness(2);
        let job = FnJob(|_: &mut JobContext<'_>| Err(JobError::retry("busy")));

        let err = harness.run(&job, &fire(2)).unwrap_err();
        assert!(matches!(err, DispatchError::RetriesExhausted { attempt: 2, .. }));
    }

    #[test]
    fn panic_becomes_fatal_and_cleans_up() {
        let scope = Arc::new(RecordingScope::default());
        let uow = Arc::new(ThreadUnitOfWork::new());
        let harness = harness(3)
            .with_request_scope(scope.clone())
            .with_unit_of_work(UnitOfWorkScope::new(uow.clone()));
        let job = FnJob(|_: &mut JobContext<'_>| -> Result<(), JobError> { panic!("kaboom") });

        let err = harness.run(&job, &fire(0)).unwrap_err();
        assert_eq!(err.cause().kind(), FailureKind::Fatal);
        assert!(err.cause().to_string().contains("kaboom"));
        assert_eq!(scope.exits.load(Ordering::SeqCst), 1);
        assert!(!uow.is_active());
        assert_eq!(uow.aborted(), 1);
    }

    #[test]
    fn success_commits_and_failure_aborts_the_unit_of_work() {
        let uow = Arc::new(ThreadUnitOfWork::new());
        let harness = harness(3).with_unit_of_work(UnitOfWorkScope::new(uow.clone()));

        harness.run(&FnJob(|_: &mut JobContext<'_>| Ok(())), &fire(0)).unwrap();
        assert_eq!((uow.closed(), uow.aborted()), (1, 0));

        let failing = FnJob(|_: &mut JobContext<'_>| Err(JobError::conflict("stale")));
        assert!(harness.run(&failing, &fire(0)).is_err());
        assert_eq!((uow.closed(), uow.aborted()), (2, 1));
        assert!(!uow.is_active());
    }

    #[test]
    fn failed_commit_withholds_events_and_refires() {
        struct CommitFails;

        impl crate::unit_of_work::UnitOfWork for CommitFails {
            fn begin(&self) -> Result<(), UnitOfWorkError> {
                Ok(())
            }

            fn end(&self) -> Result<(), UnitOfWorkError> {
                Err(UnitOfWorkError::Backend("serialization failure".to_string()))
            }
        }

        let harness = harness(3).with_unit_of_work(UnitOfWorkScope::new(Arc::new(CommitFails)));
        let job = FnJob(|ctx: &mut JobContext<'_>| {
            ctx.emit(OutboundEvent::new("pool.modified", "p1", serde_json::json!({})));
            Ok(())
        });

        let err = harness.run(&job, &fire(0)).unwrap_err();
        assert!(err.refire_requested());
        assert!(err.cause().to_string().contains("serialization failure"));
        assert_eq!(harness.bus().published_count(), 0);
    }

    #[test]
    fn joined_unit_of_work_is_left_open() {
        let uow = Arc::new(ThreadUnitOfWork::new());
        uow.begin().unwrap();
        let harness = harness(3).with_unit_of_work(UnitOfWorkScope::new(uow.clone()));
        let job = FnJob(|_: &mut JobContext<'_>| Ok(()));

        harness.run(&job, &fire(0)).unwrap();
        assert!(uow.is_active());
        assert_eq!(uow.closed(), 0);
    }

    #[test]
    fn scope_sees_job_key() {
        let scope = Arc::new(RecordingScope::default());
        let harness = harness(3).with_request_scope(scope.clone());
        let fire = fire(0);
        let job = FnJob(|_: &mut JobContext<'_>| Ok(()));

        harness.run(&job, &fire).unwrap();
        assert_eq!(scope.entered.lock().unwrap().as_slice(), &[fire.key().to_string()]);
    }

    #[test]
    fn classify_override_controls_retry() {
        struct NeverRetry;

        impl Job for NeverRetry {
            fn name(&self) -> &str {
                "never-retry"
            }

            fn execute(&self, _: &mut JobContext<'_>) -> Result<(), JobError> {
                Err(JobError::conflict("stale"))
            }

            fn classify(&self, _: &JobError) -> FailureKind {
                FailureKind::Fatal
            }
        }

        let err = harness(3).run(&NeverRetry, &fire(0)).unwrap_err();
        assert!(matches!(err, DispatchError::Fatal { .. }));
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn captured_logs(f: impl FnOnce()) -> String {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("info"))
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        String::from_utf8(out.0.lock().unwrap().clone()).unwrap()
    }

    struct QuietJob {
        fail: bool,
    }

    impl Job for QuietJob {
        fn name(&self) -> &str {
            "quiet"
        }

        fn execute(&self, _: &mut JobContext<'_>) -> Result<(), JobError> {
            if self.fail { Err(JobError::retry("busy")) } else { Ok(()) }
        }

        fn log_execution_time(&self) -> bool {
            false
        }
    }

    #[test]
    fn timing_lines_logged_by_default() {
        let ok = captured_logs(|| {
            harness(3).run(&FnJob(|_: &mut JobContext<'_>| Ok(())), &fire(0)).unwrap();
        });
        assert!(ok.contains("starting job"));
        assert!(ok.contains("job execution time"));
        assert!(ok.contains("elapsed_ms"));

        let failed = captured_logs(|| {
            let job = FnJob(|_: &mut JobContext<'_>| Err(JobError::retry("busy")));
            assert!(harness(3).run(&job, &fire(0)).is_err());
        });
        assert!(failed.contains("starting job"));
        assert!(failed.contains("job execution time"));
    }

    #[test]
    fn opted_out_job_skips_timing_lines() {
        for fail in [false, true] {
            let text = captured_logs(|| {
                let _ = harness(3).run(&QuietJob { fail }, &fire(0));
            });
            assert!(!text.contains("starting job"), "fail={fail}: {text}");
            assert!(!text.contains("job execution time"), "fail={fail}: {text}");
        }
    }
}
