//! Per-owner pool refresh.
//!
//! Reconciles an owner's pools against the upstream set. Concurrent
//! refreshes of the same owner are detected through a generation counter:
//! the loser gets [`RefreshError::AlreadyAdvanced`], which the harness turns
//! into a refire.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::{info, warn};

use jobwright_core::TenantKey;
use jobwright_events::OutboundEvent;
use jobwright_jobs::{Job, JobContext, JobDefinition, JobError, JobState, JobStatus, StatusLedger, StatusQuery};

pub const REFRESH_POOLS_KIND: &str = "pools.refresh";

/// Trigger data key. `"false"` regenerates every kept pool.
pub const LAZY_REGEN: &str = "lazy_regen";

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("pools of {0} were refreshed concurrently")]
    AlreadyAdvanced(TenantKey),
    #[error("pool conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<RefreshError> for JobError {
    fn from(e: RefreshError) -> Self {
        match e {
            RefreshError::AlreadyAdvanced(_) => JobError::retry(e.to_string()),
            RefreshError::Conflict(msg) => JobError::conflict(msg),
            RefreshError::Other(inner) => JobError::Fatal(inner),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshOutcome {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl RefreshOutcome {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

pub trait PoolRefresher: Send + Sync {
    fn refresh_pools(&self, owner: &TenantKey, lazy_regen: bool) -> Result<RefreshOutcome, RefreshError>;
}

impl<T> PoolRefresher for std::sync::Arc<T>
where
    T: PoolRefresher + ?Sized,
{
    fn refresh_pools(&self, owner: &TenantKey, lazy_regen: bool) -> Result<RefreshOutcome, RefreshError> {
        (**self).refresh_pools(owner, lazy_regen)
    }
}

/// Definition for a refresh of one owner's pools.
pub fn refresh_definition(owner: &TenantKey, lazy_regen: bool) -> JobDefinition {
    JobDefinition::new(REFRESH_POOLS_KIND)
        .with_owner(owner)
        .with_data(LAZY_REGEN, lazy_regen.to_string())
}

pub struct RefreshPoolsJob<R> {
    refresher: R,
}

impl<R: PoolRefresher> RefreshPoolsJob<R> {
    pub fn new(refresher: R) -> Self {
        Self { refresher }
    }
}

impl<R: PoolRefresher> Job for RefreshPoolsJob<R> {
    fn name(&self) -> &str {
        REFRESH_POOLS_KIND
    }

    fn execute(&self, ctx: &mut JobContext<'_>) -> Result<(), JobError> {
        let owner = ctx
            .run()
            .tenant
            .clone()
            .ok_or_else(|| JobError::fatal("pool refresh requires an owner id"))?;
        let lazy_regen = ctx.data().get(LAZY_REGEN).is_none_or(|v| v != "false");

        info!(owner = %owner.as_str(), lazy_regen, "refreshing pools");
        let outcome = self.refresher.refresh_pools(&owner, lazy_regen)?;

        for (event_type, ids) in [
            ("pool.created", &outcome.created),
            ("pool.modified", &outcome.updated),
            ("pool.deleted", &outcome.deleted),
        ] {
            for id in ids {
                ctx.emit(OutboundEvent::new(
                    event_type,
                    id.clone(),
                    serde_json::json!({ "owner_id": owner.as_str(), "pool_id": id }),
                ));
            }
        }
        Ok(())
    }

    fn log_execution_time(&self) -> bool {
        false
    }

    /// One running refresh per owner.
    fn is_schedulable(&self, ledger: &dyn StatusLedger, status: &JobStatus) -> bool {
        let Some(owner) = status.owner_id.clone() else {
            return true;
        };
        let query = StatusQuery::for_owner(owner)
            .in_state(JobState::Running)
            .of_kind(REFRESH_POOLS_KIND)
            .limit(1);
        match ledger.list(&query) {
            Ok(running) => running.is_empty(),
            Err(e) => {
                warn!(job = %status.id, error = %e, "could not check for running refresh");
                true
            }
        }
    }
}

#[derive(Debug, Default)]
struct OwnerPools {
    generation: u64,
    /// pool id -> version
    pools: BTreeMap<String, u64>,
}

/// In-memory pools with an upstream set per owner.
#[derive(Debug, Default)]
pub struct InMemoryPools {
    upstream: Mutex<HashMap<TenantKey, BTreeSet<String>>>,
    owners: Mutex<HashMap<TenantKey, OwnerPools>>,
}

impl InMemoryPools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_upstream(&self, owner: &TenantKey, pool_ids: impl IntoIterator<Item = impl Into<String>>) {
        let mut upstream = self.upstream.lock().unwrap_or_else(PoisonError::into_inner);
        upstream.insert(owner.clone(), pool_ids.into_iter().map(Into::into).collect());
    }

    pub fn pools(&self, owner: &TenantKey) -> BTreeMap<String, u64> {
        let owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        owners.get(owner).map(|o| o.pools.clone()).unwrap_or_default()
    }

    pub fn generation(&self, owner: &TenantKey) -> u64 {
        let owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        owners.get(owner).map_or(0, |o| o.generation)
    }

    /// Bump the generation as if another refresh had committed.
    pub fn advance(&self, owner: &TenantKey) {
        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        owners.entry(owner.clone()).or_default().generation += 1;
    }

    fn snapshot(&self, owner: &TenantKey) -> (u64, BTreeSet<String>) {
        let owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        owners
            .get(owner)
            .map(|o| (o.generation, o.pools.keys().cloned().collect()))
            .unwrap_or_default()
    }
}

impl PoolRefresher for InMemoryPools {
    fn refresh_pools(&self, owner: &TenantKey, lazy_regen: bool) -> Result<RefreshOutcome, RefreshError> {
        let (generation, current) = self.snapshot(owner);
        let wanted = {
            let upstream = self.upstream.lock().unwrap_or_else(PoisonError::into_inner);
            upstream.get(owner).cloned().unwrap_or_default()
        };

        let outcome = RefreshOutcome {
            created: wanted.difference(&current).cloned().collect(),
            updated: if lazy_regen {
                Vec::new()
            } else {
                wanted.intersection(&current).cloned().collect()
            },
            deleted: current.difference(&wanted).cloned().collect(),
        };

        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = owners.entry(owner.clone()).or_default();
        if entry.generation != generation {
            return Err(RefreshError::AlreadyAdvanced(owner.clone()));
        }
        for id in &outcome.deleted {
            entry.pools.remove(id);
        }
        for id in &outcome.created {
            entry.pools.insert(id.clone(), 0);
        }
        for id in &outcome.updated {
            if let Some(version) = entry.pools.get_mut(id) {
                *version += 1;
            }
        }
        entry.generation += 1;
        Ok(outcome)
    }
}
