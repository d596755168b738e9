//! Persistent job status and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobwright_core::TenantKey;

use crate::types::{JobDefinition, JobKey};

/// Lifecycle state of a job definition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Registered without a trigger, waiting for a manual run
    Created,
    /// Trigger attached (or refire requested), waiting for the next fire
    Pending,
    /// Currently being executed
    Running,
    /// Last run completed successfully
    Finished,
    /// Last run failed permanently
    Failed,
    /// Cancelled externally; never dispatched again
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Created,
        JobState::Pending,
        JobState::Running,
        JobState::Finished,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed | JobState::Cancelled)
    }

    /// Whether the ledger accepts moving a row from `self` to `to`.
    ///
    /// `Cancelled` is absorbing and `Created` is only ever an initial state.
    /// Everything else is permitted because concurrent attempts for the same
    /// key may report out of order; a row must not have finished without
    /// having run.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        match (self, to) {
            (JobState::Cancelled, _) => false,
            (_, JobState::Created) => false,
            (JobState::Created, JobState::Finished) => false,
            _ => true,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {s}"))
    }
}

/// Persisted record of a job definition's lifecycle. One per job key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobKey,
    pub kind: String,
    pub state: JobState,
    /// Created with an active trigger (vs. a one-shot manual run).
    pub triggered: bool,
    pub owner_id: Option<TenantKey>,
    /// Outcome message of the last run (error text on failure).
    pub result: Option<String>,
    /// Refire count of the most recent attempt.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn new(definition: &JobDefinition, triggered: bool) -> Self {
        let now = Utc::now();
        Self {
            id: definition.key.clone(),
            kind: definition.kind.clone(),
            state: if triggered {
                JobState::Pending
            } else {
                JobState::Created
            },
            triggered,
            owner_id: definition.data.owner(),
            result: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Apply a state change, stamping the lifecycle timestamps.
    ///
    /// Returns the previous state, or the rejected pair if not allowed.
    pub fn transition(&mut self, to: JobState) -> Result<JobState, (JobState, JobState)> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err((from, to));
        }

        let now = Utc::now();
        match to {
            JobState::Running => {
                self.started_at = Some(now);
                self.finished_at = None;
            }
            JobState::Finished | JobState::Failed | JobState::Cancelled => {
                self.finished_at = Some(now);
            }
            JobState::Created | JobState::Pending => {}
        }
        self.state = to;
        self.updated_at = now;
        Ok(from)
    }
}
