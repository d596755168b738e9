//! Periodic statistics snapshot.
//!
//! Counts a set of totals through a [`StatisticSource`], stores one
//! [`Statistic`] per total and announces each one with an event.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use jobwright_core::TenantKey;
use jobwright_events::OutboundEvent;
use jobwright_jobs::{Job, JobContext, JobError, StatusLedger};

pub const STATISTIC_HISTORY_KIND: &str = "statistics.history";

/// Once a day.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    TotalJobs,
    ActiveJobs,
    FailedJobs,
}

impl EntryType {
    pub const ALL: [EntryType; 3] = [EntryType::TotalJobs, EntryType::ActiveJobs, EntryType::FailedJobs];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::TotalJobs => "total_jobs",
            EntryType::ActiveJobs => "active_jobs",
            EntryType::FailedJobs => "failed_jobs",
        }
    }
}

impl std::str::FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryType::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| format!("unknown statistic entry type: {s}"))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Raw,
    Percentage,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Raw => "raw",
            ValueType::Percentage => "percentage",
        }
    }
}

impl std::str::FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(ValueType::Raw),
            "percentage" => Ok(ValueType::Percentage),
            other => Err(format!("unknown statistic value type: {other}")),
        }
    }
}

/// One recorded value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistic {
    pub id: Uuid,
    pub entry_type: EntryType,
    pub value_type: ValueType,
    pub owner: Option<TenantKey>,
    pub value: i64,
    pub recorded_at: DateTime<Utc>,
}

impl Statistic {
    pub fn raw(entry_type: EntryType, owner: Option<TenantKey>, value: i64) -> Self {
        Self {
            id: Uuid::now_v7(),
            entry_type,
            value_type: ValueType::Raw,
            owner,
            value,
            recorded_at: Utc::now(),
        }
    }
}

/// Where the counted totals come from.
pub trait StatisticSource: Send + Sync {
    fn count(&self, entry: EntryType, owner: Option<&TenantKey>) -> anyhow::Result<u64>;
}

/// Counts job statuses in a ledger.
#[derive(Debug)]
pub struct LedgerStatistics<L> {
    ledger: L,
}

impl<L: StatusLedger> LedgerStatistics<L> {
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }
}

impl<L: StatusLedger> StatisticSource for LedgerStatistics<L> {
    fn count(&self, entry: EntryType, owner: Option<&TenantKey>) -> anyhow::Result<u64> {
        let stats = self.ledger.stats(owner)?;
        let count = match entry {
            EntryType::TotalJobs => stats.total(),
            EntryType::ActiveJobs => stats.pending + stats.running,
            EntryType::FailedJobs => stats.failed,
        };
        Ok(count as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatisticStoreError {
    #[error("statistic already recorded: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StatisticStoreError> for JobError {
    fn from(e: StatisticStoreError) -> Self {
        JobError::conflict(e.to_string())
    }
}

pub trait StatisticStore: Send + Sync {
    fn record(&self, statistic: &Statistic) -> Result<(), StatisticStoreError>;

    /// Most recent first.
    fn history(
        &self,
        entry: EntryType,
        owner: Option<&TenantKey>,
        limit: usize,
    ) -> Result<Vec<Statistic>, StatisticStoreError>;
}

impl<T> StatisticStore for Arc<T>
where
    T: StatisticStore + ?Sized,
{
    fn record(&self, statistic: &Statistic) -> Result<(), StatisticStoreError> {
        (**self).record(statistic)
    }

    fn history(
        &self,
        entry: EntryType,
        owner: Option<&TenantKey>,
        limit: usize,
    ) -> Result<Vec<Statistic>, StatisticStoreError> {
        (**self).history(entry, owner, limit)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStatisticStore {
    rows: RwLock<Vec<Statistic>>,
}

impl InMemoryStatisticStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StatisticStore for InMemoryStatisticStore {
    fn record(&self, statistic: &Statistic) -> Result<(), StatisticStoreError> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| StatisticStoreError::Storage("statistic store lock poisoned".to_string()))?;
        if rows.iter().any(|s| s.id == statistic.id) {
            return Err(StatisticStoreError::Conflict(statistic.id.to_string()));
        }
        rows.push(statistic.clone());
        Ok(())
    }

    fn history(
        &self,
        entry: EntryType,
        owner: Option<&TenantKey>,
        limit: usize,
    ) -> Result<Vec<Statistic>, StatisticStoreError> {
        let rows = self
            .rows
            .read()
            .map_err(|_| StatisticStoreError::Storage("statistic store lock poisoned".to_string()))?;
        Ok(rows
            .iter()
            .rev()
            .filter(|s| s.entry_type == entry && s.owner.as_ref() == owner)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Records one statistic per configured entry type.
///
/// Statistics are scoped to the run's owner when the job data names one.
pub struct StatisticHistoryJob<S, T> {
    source: S,
    store: T,
    entries: Vec<EntryType>,
}

impl<S, T> StatisticHistoryJob<S, T>
where
    S: StatisticSource,
    T: StatisticStore,
{
    pub fn new(source: S, store: T) -> Self {
        Self {
            source,
            store,
            entries: EntryType::ALL.to_vec(),
        }
    }

    pub fn with_entries(mut self, entries: impl IntoIterator<Item = EntryType>) -> Self {
        self.entries = entries.into_iter().collect();
        self
    }
}

impl<S, T> Job for StatisticHistoryJob<S, T>
where
    S: StatisticSource,
    T: StatisticStore,
{
    fn name(&self) -> &str {
        STATISTIC_HISTORY_KIND
    }

    fn execute(&self, ctx: &mut JobContext<'_>) -> Result<(), JobError> {
        info!("executing statistic history job");
        let owner = ctx.run().tenant.clone();

        for entry in &self.entries {
            let count = self.source.count(*entry, owner.as_ref())?;
            let value = i64::try_from(count).map_err(|e| JobError::Fatal(e.into()))?;
            let statistic = Statistic::raw(*entry, owner.clone(), value);
            self.store.record(&statistic)?;

            ctx.emit(OutboundEvent::new(
                "statistic.recorded",
                entry.as_str(),
                serde_json::json!({
                    "statistic_id": statistic.id,
                    "value_type": statistic.value_type.as_str(),
                    "value": value,
                }),
            ));
        }
        Ok(())
    }
}
