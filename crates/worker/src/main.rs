//! Job worker: registers the built-in jobs and runs them on a local worker
//! pool until Ctrl-C.

use std::sync::Arc;
use std::thread;

use anyhow::Context;
use tracing::{info, warn};

use jobwright_core::TenantKey;
use jobwright_events::{EventBus, InMemoryEventBus, OutboundEvent};
use jobwright_infra::{StoreConfig, Stores};
use jobwright_jobs::{
    HarnessConfig, JobDefinition, JobExecutor, JobExecutorConfig, JobHarness, JobKey, JobRegistry, LedgerListener,
    LocalScheduler, RegistrationError, Scheduler, Trigger, UnitOfWorkScope, schedule_job, submit_now,
};
use jobwright_observability::LogFormat;
use jobwright_tasks::{
    InMemoryPools, LedgerStatistics, REFRESH_POOLS_KIND, RefreshPoolsJob, STATISTIC_HISTORY_KIND, StatisticHistoryJob,
    refresh_definition,
};

/// Comma-separated owners whose pools are refreshed once at startup.
const REFRESH_OWNERS_ENV: &str = "JOBWRIGHT_REFRESH_OWNERS";
const EVENT_HISTORY: usize = 1024;

type Bus = Arc<InMemoryEventBus<OutboundEvent>>;

fn main() -> anyhow::Result<()> {
    jobwright_observability::init_with(LogFormat::from_env());

    // Built by hand: the Postgres stores block on this runtime from the
    // executor's plain worker threads.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("jobwright-io")
        .build()
        .context("failed to build tokio runtime")?;

    let harness_config = HarnessConfig::from_env();
    let stores = Stores::open(&StoreConfig::from_env(), runtime.handle())?;

    let bus: Bus = Arc::new(InMemoryEventBus::new().with_history_limit(EVENT_HISTORY));
    let relay = spawn_event_relay(&bus)?;

    let refresh = Arc::new(RefreshPoolsJob::new(InMemoryPools::new()));
    let mut registry = JobRegistry::new();
    registry.register(
        STATISTIC_HISTORY_KIND,
        StatisticHistoryJob::new(LedgerStatistics::new(stores.ledger.clone()), stores.statistics.clone()),
    );
    registry.register_arc(REFRESH_POOLS_KIND, refresh.clone());

    let harness = JobHarness::new(&harness_config, bus.clone())
        .with_unit_of_work(UnitOfWorkScope::new(stores.unit_of_work.clone()));
    let scheduler = Arc::new(LocalScheduler::new(harness, registry));
    scheduler.add_listener(Arc::new(LedgerListener::new(stores.ledger.clone())));

    register_statistics(&stores, &scheduler)?;

    for owner in refresh_owners() {
        match submit_now(&stores.ledger, &*scheduler, refresh.as_ref(), &refresh_definition(&owner, true)) {
            Ok(status) => info!(job_id = %status.id, owner = %owner, "pool refresh submitted"),
            Err(RegistrationError::NotSchedulable(key)) => {
                info!(job_id = %key, owner = %owner, "pool refresh already running")
            }
            Err(e) => warn!(owner = %owner, error = %e, "could not submit pool refresh"),
        }
    }

    let executor = JobExecutor::spawn(scheduler.clone(), JobExecutorConfig::from_env())
        .context("failed to start job executor")?;

    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    let stats = executor.stats();
    executor.shutdown();
    info!(
        fires = stats.fires_processed,
        succeeded = stats.fires_succeeded,
        refired = stats.fires_refired,
        failed = stats.fires_failed,
        vetoed = stats.fires_vetoed,
        uptime_secs = stats.uptime_secs,
        "job executor stopped"
    );

    // Dropping the last bus handle closes the relay's subscription.
    drop(scheduler);
    drop(bus);
    if relay.join().is_err() {
        warn!("event relay panicked");
    }
    Ok(())
}

/// Register the daily statistics snapshot under a fixed key.
///
/// A key already in the ledger keeps its row; the trigger is attached here
/// because the local scheduler starts empty on every boot.
fn register_statistics(stores: &Stores, scheduler: &LocalScheduler<Bus>) -> anyhow::Result<()> {
    let definition = JobDefinition::new(STATISTIC_HISTORY_KIND).with_key(JobKey::new(STATISTIC_HISTORY_KIND)?);
    let trigger = Trigger::every(jobwright_tasks::statistics::DEFAULT_INTERVAL);

    let status = schedule_job(&stores.ledger, scheduler, &definition, Some(&trigger))?;
    if !scheduler.contains(&definition.key) {
        scheduler.schedule_job(&definition, &trigger)?;
    }
    info!(job_id = %status.id, state = %status.state, "statistics history scheduled");
    Ok(())
}

fn refresh_owners() -> Vec<TenantKey> {
    let Ok(raw) = std::env::var(REFRESH_OWNERS_ENV) else {
        return Vec::new();
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match TenantKey::new(s) {
            Ok(owner) => Some(owner),
            Err(e) => {
                warn!(value = s, error = %e, "ignoring malformed owner in {REFRESH_OWNERS_ENV}");
                None
            }
        })
        .collect()
}

/// Logs every event the harness flushes.
fn spawn_event_relay(bus: &Bus) -> std::io::Result<thread::JoinHandle<()>> {
    let subscription = bus.subscribe();
    thread::Builder::new().name("event-relay".to_string()).spawn(move || {
        while let Ok(event) = subscription.recv() {
            info!(
                event_id = %event.event_id(),
                event_type = event.event_type(),
                target = event.target(),
                tenant = event.tenant().map(TenantKey::as_str),
                "event published"
            );
        }
    })
}
