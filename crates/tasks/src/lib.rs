//! `jobwright-tasks` — concrete jobs run by the worker.

pub mod refresh_pools;
pub mod statistics;

pub use refresh_pools::{
    InMemoryPools, LAZY_REGEN, PoolRefresher, REFRESH_POOLS_KIND, RefreshError, RefreshOutcome, RefreshPoolsJob,
    refresh_definition,
};
pub use statistics::{
    EntryType, InMemoryStatisticStore, LedgerStatistics, STATISTIC_HISTORY_KIND, Statistic, StatisticHistoryJob,
    StatisticSource, StatisticStore, StatisticStoreError, ValueType,
};
