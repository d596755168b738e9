//! Scheduler abstraction and an in-process implementation.
//!
//! The [`Scheduler`] trait is the narrow surface registration needs. The
//! [`LocalScheduler`] keeps definitions and due fires in memory, routes each
//! fire to a registered [`Job`] through the [`JobHarness`], and requeues the
//! key when the harness asks for a refire.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use jobwright_events::{EventBus, OutboundEvent};

use crate::error::DispatchError;
use crate::harness::JobHarness;
use crate::job::Job;
use crate::listener::{JobListener, Verdict};
use crate::types::{FireContext, JobDefinition, JobKey, Schedule, Trigger, TriggerData};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown listener: {0}")]
    UnknownListener(String),
    #[error("no job registered for kind: {0}")]
    NoHandler(String),
    #[error("job already scheduled: {0}")]
    AlreadyScheduled(JobKey),
    #[error("job not found: {0}")]
    JobNotFound(JobKey),
}

/// What registration needs from a scheduler.
pub trait Scheduler: Send + Sync {
    /// Route fires of `key` to the listener registered as `listener`.
    fn add_listener_matcher(&self, listener: &str, key: &JobKey) -> Result<(), SchedulerError>;

    /// Store the definition and attach its trigger.
    fn schedule_job(&self, definition: &JobDefinition, trigger: &Trigger) -> Result<(), SchedulerError>;

    /// Store the definition without a trigger.
    fn add_job(&self, definition: &JobDefinition, replace: bool) -> Result<(), SchedulerError>;

    /// Fire a stored definition once, as soon as possible.
    fn trigger_now(&self, key: &JobKey, data: TriggerData) -> Result<(), SchedulerError>;

    /// Remove a definition and its pending fires. Returns whether it existed.
    fn delete_job(&self, key: &JobKey) -> Result<bool, SchedulerError>;
}

impl<S> Scheduler for Arc<S>
where
    S: Scheduler + ?Sized,
{
    fn add_listener_matcher(&self, listener: &str, key: &JobKey) -> Result<(), SchedulerError> {
        (**self).add_listener_matcher(listener, key)
    }

    fn schedule_job(&self, definition: &JobDefinition, trigger: &Trigger) -> Result<(), SchedulerError> {
        (**self).schedule_job(definition, trigger)
    }

    fn add_job(&self, definition: &JobDefinition, replace: bool) -> Result<(), SchedulerError> {
        (**self).add_job(definition, replace)
    }

    fn trigger_now(&self, key: &JobKey, data: TriggerData) -> Result<(), SchedulerError> {
        (**self).trigger_now(key, data)
    }

    fn delete_job(&self, key: &JobKey) -> Result<bool, SchedulerError> {
        (**self).delete_job(key)
    }
}

/// Job bodies by kind.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn Job>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job body for a kind pattern: an exact kind, a category
    /// such as `"pools.*"`, or `"*"`.
    pub fn register(&mut self, pattern: impl Into<String>, job: impl Job + 'static) {
        self.register_arc(pattern, Arc::new(job));
    }

    pub fn register_arc(&mut self, pattern: impl Into<String>, job: Arc<dyn Job>) {
        self.handlers.insert(pattern.into(), job);
    }

    pub fn resolve(&self, kind: &str) -> Option<Arc<dyn Job>> {
        if let Some(job) = self.handlers.get(kind) {
            return Some(job.clone());
        }

        // Category match: "pools.*" matches "pools.refresh"
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, job)| {
                let prefix = pattern.strip_suffix(".*")?;
                kind.strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'))
                    .then_some((prefix.len(), job))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, job)) = category {
            return Some(job.clone());
        }

        self.handlers.get("*").cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FireOrigin {
    Trigger,
    Manual,
}

#[derive(Debug, Clone)]
struct PendingFire {
    key: JobKey,
    refire_count: u32,
    trigger_data: TriggerData,
    scheduled_for: DateTime<Utc>,
    origin: FireOrigin,
}

#[derive(Debug, Clone)]
struct StoredJob {
    definition: JobDefinition,
    trigger: Option<Trigger>,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<JobKey, StoredJob>,
    /// Due fires ordered by (due time, insertion sequence).
    queue: BTreeMap<(DateTime<Utc>, u64), PendingFire>,
    seq: u64,
    listeners: Vec<Arc<dyn JobListener>>,
    /// Listener name -> keys it observes.
    matchers: HashMap<String, HashSet<JobKey>>,
}

impl SchedulerState {
    fn enqueue(&mut self, due: DateTime<Utc>, fire: PendingFire) {
        self.seq += 1;
        self.queue.insert((due, self.seq), fire);
    }

    fn listeners_for(&self, key: &JobKey) -> Vec<Arc<dyn JobListener>> {
        self.listeners
            .iter()
            .filter(|l| self.matchers.get(l.name()).is_some_and(|keys| keys.contains(key)))
            .cloned()
            .collect()
    }
}

/// Result of one fire.
#[derive(Debug)]
pub enum FireOutcome {
    /// The harness ran the job.
    Dispatched(Result<(), DispatchError>),
    /// A listener refused the fire.
    Vetoed,
    /// No job body is registered for the definition's kind.
    NoHandler,
}

#[derive(Debug)]
pub struct FireReport {
    pub key: JobKey,
    pub attempt: u32,
    pub outcome: FireOutcome,
}

impl FireReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, FireOutcome::Dispatched(Ok(())))
    }

    pub fn refired(&self) -> bool {
        matches!(&self.outcome, FireOutcome::Dispatched(Err(e)) if e.refire_requested())
    }
}

/// In-process scheduler.
pub struct LocalScheduler<B> {
    harness: JobHarness<B>,
    registry: JobRegistry,
    state: Mutex<SchedulerState>,
}

impl<B> std::fmt::Debug for LocalScheduler<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalScheduler")
            .field("harness", &self.harness)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<B> LocalScheduler<B>
where
    B: EventBus<OutboundEvent>,
{
    pub fn new(harness: JobHarness<B>, registry: JobRegistry) -> Self {
        Self {
            harness,
            registry,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn harness(&self) -> &JobHarness<B> {
        &self.harness
    }

    /// Register a listener. Replaces any listener with the same name.
    pub fn add_listener(&self, listener: Arc<dyn JobListener>) {
        let mut state = self.lock();
        state.listeners.retain(|l| l.name() != listener.name());
        state.listeners.push(listener);
    }

    pub fn contains(&self, key: &JobKey) -> bool {
        self.lock().jobs.contains_key(key)
    }

    /// Due time of the earliest pending fire.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.lock().queue.keys().next().map(|(due, _)| *due)
    }

    pub fn pending_fires(&self) -> usize {
        self.lock().queue.len()
    }

    /// Fire the earliest pending fire if it is due.
    pub fn fire_next(&self) -> Option<FireReport> {
        let now = Utc::now();
        let (pending, stored, listeners) = {
            let mut state = self.lock();
            let (due, _) = *state.queue.keys().next()?;
            if due > now {
                return None;
            }
            let (_, pending) = state.queue.pop_first()?;
            let stored = state.jobs.get(&pending.key)?.clone();
            let listeners = state.listeners_for(&pending.key);
            (pending, stored, listeners)
        };

        let fire = FireContext::new(stored.definition.clone(), &pending.trigger_data, pending.refire_count)
            .scheduled_for(pending.scheduled_for);
        let outcome = self.dispatch(&fire, &listeners);

        self.after_fire(&pending, stored.trigger.as_ref(), &outcome);

        Some(FireReport {
            key: pending.key,
            attempt: pending.refire_count,
            outcome,
        })
    }

    /// Fire everything currently due, up to `max` fires.
    pub fn run_due(&self, max: usize) -> Vec<FireReport> {
        let mut reports = Vec::new();
        while reports.len() < max {
            match self.fire_next() {
                Some(report) => reports.push(report),
                None => break,
            }
        }
        reports
    }

    fn dispatch(&self, fire: &FireContext, listeners: &[Arc<dyn JobListener>]) -> FireOutcome {
        let Some(job) = self.registry.resolve(&fire.definition.kind) else {
            error!(job_id = %fire.key(), kind = %fire.definition.kind, "no job registered for kind");
            return FireOutcome::NoHandler;
        };

        if let Some(listener) = listeners
            .iter()
            .find(|l| l.job_to_be_executed(fire) == Verdict::Veto)
        {
            info!(job_id = %fire.key(), listener = listener.name(), "fire vetoed");
            return FireOutcome::Vetoed;
        }

        let result = self.harness.run(job.as_ref(), fire);
        for listener in listeners {
            listener.job_was_executed(fire, &result);
        }
        FireOutcome::Dispatched(result)
    }

    fn after_fire(&self, pending: &PendingFire, trigger: Option<&Trigger>, outcome: &FireOutcome) {
        let mut state = self.lock();
        if !state.jobs.contains_key(&pending.key) {
            return;
        }

        if let FireOutcome::Dispatched(Err(e)) = outcome {
            if let Some(delay) = e.refire_delay() {
                let due = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                debug!(job_id = %pending.key, attempt = pending.refire_count + 1, %due, "refire queued");
                state.enqueue(
                    due,
                    PendingFire {
                        refire_count: pending.refire_count + 1,
                        ..pending.clone()
                    },
                );
                return;
            }
        }

        if matches!(outcome, FireOutcome::Vetoed) || pending.origin != FireOrigin::Trigger {
            return;
        }

        if let Some(trigger) = trigger.filter(|t| matches!(t.schedule, Schedule::Every { .. })) {
            if let Some(next) = trigger.schedule.next_fire_after(pending.scheduled_for, Utc::now()) {
                state.enqueue(
                    next,
                    PendingFire {
                        key: pending.key.clone(),
                        refire_count: 0,
                        trigger_data: trigger.data.clone(),
                        scheduled_for: next,
                        origin: FireOrigin::Trigger,
                    },
                );
            }
        }
    }

    fn ensure_handler(&self, definition: &JobDefinition) -> Result<(), SchedulerError> {
        match self.registry.resolve(&definition.kind) {
            Some(_) => Ok(()),
            None => Err(SchedulerError::NoHandler(definition.kind.clone())),
        }
    }
}

impl<B> Scheduler for LocalScheduler<B>
where
    B: EventBus<OutboundEvent>,
{
    fn add_listener_matcher(&self, listener: &str, key: &JobKey) -> Result<(), SchedulerError> {
        let mut state = self.lock();
        if !state.listeners.iter().any(|l| l.name() == listener) {
            return Err(SchedulerError::UnknownListener(listener.to_string()));
        }
        state
            .matchers
            .entry(listener.to_string())
            .or_default()
            .insert(key.clone());
        Ok(())
    }

    fn schedule_job(&self, definition: &JobDefinition, trigger: &Trigger) -> Result<(), SchedulerError> {
        self.ensure_handler(definition)?;
        let mut state = self.lock();
        if state.jobs.contains_key(&definition.key) {
            return Err(SchedulerError::AlreadyScheduled(definition.key.clone()));
        }

        let first = trigger.schedule.first_fire();
        state.jobs.insert(
            definition.key.clone(),
            StoredJob {
                definition: definition.clone(),
                trigger: Some(trigger.clone()),
            },
        );
        state.enqueue(
            first,
            PendingFire {
                key: definition.key.clone(),
                refire_count: 0,
                trigger_data: trigger.data.clone(),
                scheduled_for: first,
                origin: FireOrigin::Trigger,
            },
        );
        debug!(job_id = %definition.key, first_fire = %first, "job scheduled");
        Ok(())
    }

    fn add_job(&self, definition: &JobDefinition, replace: bool) -> Result<(), SchedulerError> {
        self.ensure_handler(definition)?;
        let mut state = self.lock();
        match state.jobs.get_mut(&definition.key) {
            Some(stored) if replace => stored.definition = definition.clone(),
            Some(_) => return Err(SchedulerError::AlreadyScheduled(definition.key.clone())),
            None => {
                state.jobs.insert(
                    definition.key.clone(),
                    StoredJob {
                        definition: definition.clone(),
                        trigger: None,
                    },
                );
            }
        }
        Ok(())
    }

    fn trigger_now(&self, key: &JobKey, data: TriggerData) -> Result<(), SchedulerError> {
        let mut state = self.lock();
        if !state.jobs.contains_key(key) {
            return Err(SchedulerError::JobNotFound(key.clone()));
        }
        let now = Utc::now();
        state.enqueue(
            now,
            PendingFire {
                key: key.clone(),
                refire_count: 0,
                trigger_data: data,
                scheduled_for: now,
                origin: FireOrigin::Manual,
            },
        );
        Ok(())
    }

    fn delete_job(&self, key: &JobKey) -> Result<bool, SchedulerError> {
        let mut state = self.lock();
        let existed = state.jobs.remove(key).is_some();
        state.queue.retain(|_, fire| &fire.key != key);
        for keys in state.matchers.values_mut() {
            keys.remove(key);
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use jobwright_events::InMemoryEventBus;

    use super::*;
    use crate::config::HarnessConfig;
    use crate::error::JobError;
    use crate::job::JobContext;

    struct Counting {
        calls: Arc<AtomicU32>,
        fail_with_conflict: bool,
    }

    impl Job for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn execute(&self, _: &mut JobContext<'_>) -> Result<(), JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_with_conflict {
                Err(JobError::conflict("row version changed"))
            } else {
                Ok(())
            }
        }
    }

    struct VetoAll;

    impl JobListener for VetoAll {
        fn name(&self) -> &str {
            "veto-all"
        }

        fn job_to_be_executed(&self, _: &FireContext) -> Verdict {
            Verdict::Veto
        }

        fn job_was_executed(&self, _: &FireContext, _: &Result<(), DispatchError>) {}
    }

    fn scheduler(max_retries: i32, fail: bool) -> (LocalScheduler<InMemoryEventBus<OutboundEvent>>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = JobRegistry::new();
        registry.register(
            "stats",
            Counting {
                calls: calls.clone(),
                fail_with_conflict: fail,
            },
        );
        let harness = JobHarness::new(
            &HarnessConfig::default().with_max_retries(max_retries),
            InMemoryEventBus::new(),
        );
        (LocalScheduler::new(harness, registry), calls)
    }

    #[test]
    fn once_trigger_fires_exactly_once() {
        let (scheduler, calls) = scheduler(3, false);
        scheduler.schedule_job(&JobDefinition::new("stats"), &Trigger::now()).unwrap();

        let reports = scheduler.run_due(10);
        assert_eq!(reports.len(), 1);
        assert!(reports[0].succeeded());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_fires(), 0);
    }

    #[test]
    fn conflicts_refire_until_retries_run_out() {
        let (scheduler, calls) = scheduler(2, true);
        scheduler.schedule_job(&JobDefinition::new("stats"), &Trigger::now()).unwrap();

        let reports = scheduler.run_due(10);
        let attempts: Vec<u32> = reports.iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![0, 1, 2]);
        assert!(reports[0].refired());
        assert!(matches!(
            reports[2].outcome,
            FireOutcome::Dispatched(Err(DispatchError::RetriesExhausted { .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn interval_trigger_is_rearmed() {
        let (scheduler, _) = scheduler(3, false);
        let trigger = Trigger::every(Duration::from_secs(60));
        scheduler.schedule_job(&JobDefinition::new("stats"), &trigger).unwrap();

        assert_eq!(scheduler.run_due(10).len(), 1);
        assert_eq!(scheduler.pending_fires(), 1);
        assert!(scheduler.next_due().unwrap() > Utc::now());
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let (scheduler, _) = scheduler(3, false);
        let definition = JobDefinition::new("stats");
        scheduler.schedule_job(&definition, &Trigger::now()).unwrap();
        assert_eq!(
            scheduler.schedule_job(&definition, &Trigger::now()),
            Err(SchedulerError::AlreadyScheduled(definition.key.clone()))
        );
    }

    #[test]
    fn unknown_kind_cannot_be_scheduled() {
        let (scheduler, _) = scheduler(3, false);
        assert_eq!(
            scheduler.add_job(&JobDefinition::new("unknown"), false),
            Err(SchedulerError::NoHandler("unknown".to_string()))
        );
    }

    #[test]
    fn vetoed_fire_does_not_run() {
        let (scheduler, calls) = scheduler(3, false);
        scheduler.add_listener(Arc::new(VetoAll));
        let definition = JobDefinition::new("stats");
        assert_eq!(
            scheduler.add_listener_matcher("nobody", &definition.key),
            Err(SchedulerError::UnknownListener("nobody".to_string()))
        );

        scheduler.schedule_job(&definition, &Trigger::now()).unwrap();
        scheduler.add_listener_matcher("veto-all", &definition.key).unwrap();

        let reports = scheduler.run_due(10);
        assert!(matches!(reports[0].outcome, FireOutcome::Vetoed));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn trigger_now_requires_stored_job() {
        let (scheduler, calls) = scheduler(3, false);
        let definition = JobDefinition::new("stats");
        assert!(scheduler.trigger_now(&definition.key, TriggerData::new()).is_err());

        scheduler.add_job(&definition, false).unwrap();
        scheduler.trigger_now(&definition.key, TriggerData::new()).unwrap();
        scheduler.run_due(10);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delete_drops_pending_fires() {
        let (scheduler, _) = scheduler(3, false);
        let definition = JobDefinition::new("stats");
        scheduler.schedule_job(&definition, &Trigger::now()).unwrap();

        assert!(scheduler.delete_job(&definition.key).unwrap());
        assert_eq!(scheduler.pending_fires(), 0);
        assert!(!scheduler.contains(&definition.key));
    }

    #[test]
    fn registry_prefers_exact_then_category_then_wildcard() {
        struct Named(&'static str);

        impl Job for Named {
            fn name(&self) -> &str {
                self.0
            }

            fn execute(&self, _: &mut JobContext<'_>) -> Result<(), JobError> {
                Ok(())
            }
        }

        let mut registry = JobRegistry::new();
        registry.register("pools.refresh", Named("exact"));
        registry.register("pools.*", Named("category"));
        registry.register("*", Named("wildcard"));

        let name = |kind: &str| registry.resolve(kind).map(|job| job.name().to_string());
        assert_eq!(name("pools.refresh").as_deref(), Some("exact"));
        assert_eq!(name("pools.rebuild").as_deref(), Some("category"));
        assert_eq!(name("poolside").as_deref(), Some("wildcard"));
        assert!(JobRegistry::new().resolve("pools.refresh").is_none());
    }
}
