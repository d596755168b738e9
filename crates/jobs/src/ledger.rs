//! Job status ledger.
//!
//! One persisted [`JobStatus`] per job key. The ledger is the authority on
//! whether a key exists: creation with a duplicate key is rejected and the
//! caller decides whether to merge instead.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::Serialize;

use jobwright_core::TenantKey;

use crate::error::JobError;
use crate::status::{JobState, JobStatus};
use crate::types::JobKey;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("job status already exists: {0}")]
    AlreadyExists(JobKey),
    #[error("job status not found: {0}")]
    NotFound(JobKey),
    #[error("job {key}: cannot move from {from} to {to}")]
    InvalidTransition {
        key: JobKey,
        from: JobState,
        to: JobState,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<LedgerError> for JobError {
    /// Duplicate keys and storage hiccups are worth a refire; the rest is a bug.
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::AlreadyExists(_) | LedgerError::Storage(_) => {
                JobError::PersistenceConflict(e.to_string())
            }
            other => JobError::Fatal(anyhow::Error::new(other)),
        }
    }
}

/// A state change reported for a job key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub state: JobState,
    pub result: Option<String>,
    /// Refire count of the attempt this update describes.
    pub attempt: Option<u32>,
}

impl StatusUpdate {
    pub fn running(attempt: u32) -> Self {
        Self {
            state: JobState::Running,
            result: None,
            attempt: Some(attempt),
        }
    }

    pub fn finished() -> Self {
        Self {
            state: JobState::Finished,
            result: None,
            attempt: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            result: Some(message.into()),
            attempt: None,
        }
    }

    /// Back to pending, waiting for the scheduler to refire.
    pub fn refire(message: impl Into<String>) -> Self {
        Self {
            state: JobState::Pending,
            result: Some(message.into()),
            attempt: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            state: JobState::Cancelled,
            result: None,
            attempt: None,
        }
    }

    /// Apply to a row in place.
    pub fn apply(&self, status: &mut JobStatus) -> Result<(), LedgerError> {
        status
            .transition(self.state)
            .map_err(|(from, to)| LedgerError::InvalidTransition {
                key: status.id.clone(),
                from,
                to,
            })?;
        if self.state != JobState::Cancelled {
            status.result = self.result.clone();
        }
        if let Some(attempt) = self.attempt {
            status.attempts = attempt;
        }
        Ok(())
    }
}

/// Filter for [`StatusLedger::list`].
#[derive(Debug, Clone, Default)]
pub struct StatusQuery {
    pub owner: Option<TenantKey>,
    pub state: Option<JobState>,
    pub kind: Option<String>,
    pub limit: Option<usize>,
}

impl StatusQuery {
    pub fn for_owner(owner: TenantKey) -> Self {
        Self {
            owner: Some(owner),
            ..Default::default()
        }
    }

    pub fn in_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn of_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, status: &JobStatus) -> bool {
        self.owner.as_ref().is_none_or(|o| status.owner_id.as_ref() == Some(o))
            && self.state.is_none_or(|s| status.state == s)
            && self.kind.as_deref().is_none_or(|k| status.kind == k)
    }
}

/// Row counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub created: usize,
    pub pending: usize,
    pub running: usize,
    pub finished: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl LedgerStats {
    pub fn count(&mut self, state: JobState) {
        self.add(state, 1);
    }

    pub fn add(&mut self, state: JobState, n: usize) {
        let slot = match state {
            JobState::Created => &mut self.created,
            JobState::Pending => &mut self.pending,
            JobState::Running => &mut self.running,
            JobState::Finished => &mut self.finished,
            JobState::Failed => &mut self.failed,
            JobState::Cancelled => &mut self.cancelled,
        };
        *slot += n;
    }

    pub fn total(&self) -> usize {
        self.created + self.pending + self.running + self.finished + self.failed + self.cancelled
    }
}

/// Persistent store of job statuses.
pub trait StatusLedger: Send + Sync {
    /// Insert a new row. Fails with `AlreadyExists` on a duplicate key.
    fn create(&self, status: &JobStatus) -> Result<(), LedgerError>;

    fn get(&self, key: &JobKey) -> Result<Option<JobStatus>, LedgerError>;

    /// Upsert: insert when absent, otherwise overwrite everything but
    /// `created_at`. A cancelled row is left untouched.
    fn merge(&self, status: &JobStatus) -> Result<JobStatus, LedgerError>;

    fn transition(&self, key: &JobKey, update: StatusUpdate) -> Result<JobStatus, LedgerError>;

    fn cancel(&self, key: &JobKey) -> Result<JobStatus, LedgerError> {
        self.transition(key, StatusUpdate::cancelled())
    }

    fn list(&self, query: &StatusQuery) -> Result<Vec<JobStatus>, LedgerError>;

    fn stats(&self, owner: Option<&TenantKey>) -> Result<LedgerStats, LedgerError>;
}

impl<L> StatusLedger for Arc<L>
where
    L: StatusLedger + ?Sized,
{
    fn create(&self, status: &JobStatus) -> Result<(), LedgerError> {
        (**self).create(status)
    }

    fn get(&self, key: &JobKey) -> Result<Option<JobStatus>, LedgerError> {
        (**self).get(key)
    }

    fn merge(&self, status: &JobStatus) -> Result<JobStatus, LedgerError> {
        (**self).merge(status)
    }

    fn transition(&self, key: &JobKey, update: StatusUpdate) -> Result<JobStatus, LedgerError> {
        (**self).transition(key, update)
    }

    fn cancel(&self, key: &JobKey) -> Result<JobStatus, LedgerError> {
        (**self).cancel(key)
    }

    fn list(&self, query: &StatusQuery) -> Result<Vec<JobStatus>, LedgerError> {
        (**self).list(query)
    }

    fn stats(&self, owner: Option<&TenantKey>) -> Result<LedgerStats, LedgerError> {
        (**self).stats(owner)
    }
}

/// In-memory ledger for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryStatusLedger {
    rows: RwLock<HashMap<JobKey, JobStatus>>,
}

fn poisoned<T>(_: T) -> LedgerError {
    LedgerError::Storage("ledger lock poisoned".to_string())
}

impl InMemoryStatusLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StatusLedger for InMemoryStatusLedger {
    fn create(&self, status: &JobStatus) -> Result<(), LedgerError> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        if rows.contains_key(&status.id) {
            return Err(LedgerError::AlreadyExists(status.id.clone()));
        }
        rows.insert(status.id.clone(), status.clone());
        Ok(())
    }

    fn get(&self, key: &JobKey) -> Result<Option<JobStatus>, LedgerError> {
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows.get(key).cloned())
    }

    fn merge(&self, status: &JobStatus) -> Result<JobStatus, LedgerError> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        let merged = match rows.get(&status.id) {
            Some(existing) if existing.state == JobState::Cancelled => existing.clone(),
            Some(existing) => JobStatus {
                created_at: existing.created_at,
                updated_at: Utc::now(),
                ..status.clone()
            },
            None => status.clone(),
        };
        rows.insert(merged.id.clone(), merged.clone());
        Ok(merged)
    }

    fn transition(&self, key: &JobKey, update: StatusUpdate) -> Result<JobStatus, LedgerError> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        let row = rows
            .get_mut(key)
            .ok_or_else(|| LedgerError::NotFound(key.clone()))?;
        update.apply(row)?;
        Ok(row.clone())
    }

    fn list(&self, query: &StatusQuery) -> Result<Vec<JobStatus>, LedgerError> {
        let rows = self.rows.read().map_err(poisoned)?;
        let mut matching: Vec<JobStatus> = rows.values().filter(|s| query.matches(s)).cloned().collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    fn stats(&self, owner: Option<&TenantKey>) -> Result<LedgerStats, LedgerError> {
        let rows = self.rows.read().map_err(poisoned)?;
        let mut stats = LedgerStats::default();
        for status in rows.values() {
            if owner.is_none_or(|o| status.owner_id.as_ref() == Some(o)) {
                stats.count(status.state);
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::types::JobDefinition;

    fn status(kind: &str, triggered: bool) -> JobStatus {
        JobStatus::new(&JobDefinition::new(kind), triggered)
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let ledger = InMemoryStatusLedger::new();
        let row = status("stats", true);

        ledger.create(&row).unwrap();
        assert_eq!(ledger.create(&row), Err(LedgerError::AlreadyExists(row.id.clone())));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn merge_keeps_creation_time() {
        let ledger = InMemoryStatusLedger::new();
        let original = status("stats", false);
        ledger.create(&original).unwrap();

        let mut replacement = original.clone();
        replacement.created_at = Utc::now() + chrono::Duration::hours(1);
        replacement.state = JobState::Pending;
        replacement.triggered = true;

        let merged = ledger.merge(&replacement).unwrap();
        assert_eq!(merged.created_at, original.created_at);
        assert_eq!(merged.state, JobState::Pending);
        assert!(merged.triggered);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn merge_does_not_revive_cancelled_rows() {
        let ledger = InMemoryStatusLedger::new();
        let row = status("stats", true);
        ledger.create(&row).unwrap();
        ledger.cancel(&row.id).unwrap();

        let merged = ledger.merge(&row).unwrap();
        assert_eq!(merged.state, JobState::Cancelled);
    }

    #[test]
    fn transition_records_attempt_and_result() {
        let ledger = InMemoryStatusLedger::new();
        let row = status("stats", true);
        ledger.create(&row).unwrap();

        let running = ledger.transition(&row.id, StatusUpdate::running(2)).unwrap();
        assert_eq!(running.attempts, 2);

        let failed = ledger.transition(&row.id, StatusUpdate::failed("boom")).unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.result.as_deref(), Some("boom"));
        assert_eq!(failed.attempts, 2);
    }

    #[test]
    fn unknown_key_is_not_found() {
        let ledger = InMemoryStatusLedger::new();
        let key = JobKey::new("missing").unwrap();
        assert_eq!(
            ledger.transition(&key, StatusUpdate::finished()),
            Err(LedgerError::NotFound(key))
        );
    }

    #[test]
    fn list_and_stats_filter_by_owner() {
        let ledger = InMemoryStatusLedger::new();
        let acme = TenantKey::new("acme").unwrap();
        let owned = JobStatus::new(&JobDefinition::new("stats").with_owner(&acme), true);
        ledger.create(&owned).unwrap();
        ledger.create(&status("stats", false)).unwrap();

        let listed = ledger.list(&StatusQuery::for_owner(acme.clone())).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, owned.id);

        let stats = ledger.stats(Some(&acme)).unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total(), 1);
        assert_eq!(ledger.stats(None).unwrap().total(), 2);
    }

    #[test]
    fn ledger_conflicts_are_retryable_job_errors() {
        let key = JobKey::new("stats-1").unwrap();
        let err: JobError = LedgerError::AlreadyExists(key.clone()).into();
        assert_eq!(err.kind(), FailureKind::PersistenceConflict);

        let err: JobError = LedgerError::NotFound(key).into();
        assert_eq!(err.kind(), FailureKind::Fatal);
    }
}
