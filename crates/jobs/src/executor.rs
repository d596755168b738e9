//! Worker pool driving a [`LocalScheduler`].

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use jobwright_events::{EventBus, OutboundEvent};

use crate::config::parse_or_default;
use crate::scheduler::{FireOutcome, FireReport, LocalScheduler};

pub const WORKERS_ENV: &str = "JOBWRIGHT_WORKERS";
pub const POLL_INTERVAL_ENV: &str = "JOBWRIGHT_POLL_INTERVAL_MS";

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Longest a worker sleeps when nothing is due
    pub poll_interval: Duration,
    /// Number of worker threads
    pub workers: usize,
    /// Thread name prefix and log tag
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            workers: 4,
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let poll_ms = parse_or_default(&lookup, POLL_INTERVAL_ENV, defaults.poll_interval.as_millis() as u64);
        let workers = parse_or_default(&lookup, WORKERS_ENV, defaults.workers);
        Self {
            poll_interval: Duration::from_millis(poll_ms),
            workers: workers.max(1),
            ..defaults
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub fires_processed: u64,
    pub fires_succeeded: u64,
    pub fires_refired: u64,
    pub fires_failed: u64,
    pub fires_vetoed: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, report: &FireReport) {
        self.fires_processed += 1;
        match &report.outcome {
            FireOutcome::Dispatched(Ok(())) => self.fires_succeeded += 1,
            FireOutcome::Dispatched(Err(e)) if e.refire_requested() => self.fires_refired += 1,
            FireOutcome::Dispatched(Err(_)) | FireOutcome::NoHandler => self.fires_failed += 1,
            FireOutcome::Vetoed => self.fires_vetoed += 1,
        }
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for in-flight fires to finish.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Background executor: a fixed pool of threads firing due jobs.
pub struct JobExecutor;

impl JobExecutor {
    pub fn spawn<B>(scheduler: Arc<LocalScheduler<B>>, config: JobExecutorConfig) -> io::Result<JobExecutorHandle>
    where
        B: EventBus<OutboundEvent> + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let scheduler = scheduler.clone();
            let shutdown_flag = shutdown.clone();
            let stats = stats.clone();
            let config = config.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", config.name))
                .spawn(move || worker_loop(&scheduler, &config, index, &shutdown_flag, &stats));
            match spawned {
                Ok(join) => workers.push(join),
                Err(e) => {
                    shutdown.store(true, Ordering::SeqCst);
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(e);
                }
            }
        }

        info!(executor = %config.name, workers = config.workers, "job executor started");
        Ok(JobExecutorHandle {
            shutdown,
            workers,
            stats,
            started: Instant::now(),
        })
    }
}

fn worker_loop<B>(
    scheduler: &LocalScheduler<B>,
    config: &JobExecutorConfig,
    index: usize,
    shutdown: &AtomicBool,
    stats: &Mutex<ExecutorStats>,
) where
    B: EventBus<OutboundEvent>,
{
    debug!(executor = %config.name, worker = index, "worker started");

    while !shutdown.load(Ordering::SeqCst) {
        {
            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
            s.current_running += 1;
        }
        let report = scheduler.fire_next();
        {
            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
            s.current_running = s.current_running.saturating_sub(1);
            if let Some(report) = &report {
                s.record(report);
            }
        }

        if report.is_none() {
            thread::sleep(idle_sleep(scheduler.next_due(), config.poll_interval));
        }
    }

    debug!(executor = %config.name, worker = index, "worker stopped");
}

/// Sleep until the next fire is due, but never longer than `poll`.
fn idle_sleep(next_due: Option<chrono::DateTime<Utc>>, poll: Duration) -> Duration {
    match next_due {
        Some(due) => (due - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(poll),
        None => poll,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    use jobwright_events::InMemoryEventBus;

    use super::*;
    use crate::config::HarnessConfig;
    use crate::error::JobError;
    use crate::harness::JobHarness;
    use crate::job::{Job, JobContext};
    use crate::scheduler::{JobRegistry, Scheduler};
    use crate::types::{JobDefinition, Trigger};

    struct Tick(Arc<AtomicU32>);

    impl Job for Tick {
        fn name(&self) -> &str {
            "tick"
        }

        fn execute(&self, _: &mut JobContext<'_>) -> Result<(), JobError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn config_reads_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([(WORKERS_ENV, "2"), (POLL_INTERVAL_ENV, "oops")]);
        let config = JobExecutorConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.workers, 2);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn idle_sleep_is_bounded_by_poll_interval() {
        let poll = Duration::from_millis(50);
        assert_eq!(idle_sleep(None, poll), poll);
        assert_eq!(idle_sleep(Some(Utc::now() + chrono::Duration::hours(1)), poll), poll);
        assert_eq!(idle_sleep(Some(Utc::now() - chrono::Duration::seconds(1)), poll), Duration::ZERO);
    }

    #[test]
    fn executes_due_jobs_and_shuts_down() {
        let ticks = Arc::new(AtomicU32::new(0));
        let mut registry = JobRegistry::new();
        registry.register("tick", Tick(ticks.clone()));
        let scheduler = Arc::new(LocalScheduler::new(
            JobHarness::new(&HarnessConfig::default(), InMemoryEventBus::new()),
            registry,
        ));
        scheduler.schedule_job(&JobDefinition::new("tick"), &Trigger::now()).unwrap();
        scheduler.schedule_job(&JobDefinition::new("tick"), &Trigger::now()).unwrap();

        let handle = JobExecutor::spawn(
            scheduler.clone(),
            JobExecutorConfig::default()
                .with_workers(2)
                .with_poll_interval(Duration::from_millis(5)),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().fires_processed < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert_eq!(stats.fires_succeeded, 2);
        assert_eq!(scheduler.pending_fires(), 0);
    }
}
