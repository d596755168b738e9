//! Job definitions, triggers and per-run data.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use jobwright_core::{CoreError, RunId, TenantKey};
use jobwright_observability::LogLevel;

/// Stable key of a job definition.
///
/// One key maps to exactly one `JobStatus` row and stays the same across
/// refires of the job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn new(key: impl Into<String>) -> Result<Self, CoreError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(CoreError::invalid_id("JobKey: empty key"));
        }
        Ok(Self(key))
    }

    /// Generate a unique key with a readable prefix, e.g. `refresh_pools-0190...`.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// String-keyed options attached to a job or a trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerData(BTreeMap<String, String>);

impl TriggerData {
    /// Key of the owning tenant.
    pub const OWNER_ID: &'static str = "ownerId";
    /// Log level override for runs of this tenant's jobs.
    pub const OWNER_LOG_LEVEL: &'static str = "ownerLogLevel";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Owning tenant, if present and well-formed.
    pub fn owner(&self) -> Option<TenantKey> {
        let raw = self.get(Self::OWNER_ID)?;
        match TenantKey::new(raw) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(value = raw, error = %e, "ignoring malformed owner id");
                None
            }
        }
    }

    /// Log level override, if present and recognised.
    pub fn owner_log_level(&self) -> Option<LogLevel> {
        let raw = self.get(Self::OWNER_LOG_LEVEL)?;
        match raw.parse() {
            Ok(level) => Some(level),
            Err(e) => {
                warn!(value = raw, error = %e, "ignoring unknown owner log level");
                None
            }
        }
    }

    /// Job-level data overlaid with trigger-level data (trigger wins).
    pub fn merged(&self, overrides: &TriggerData) -> TriggerData {
        let mut merged = self.clone();
        for (k, v) in &overrides.0 {
            merged.0.insert(k.clone(), v.clone());
        }
        merged
    }
}

/// When a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fire once at the given instant.
    Once { at: DateTime<Utc> },
    /// Fire at `start_at` and every `interval` after it.
    Every {
        interval: Duration,
        start_at: DateTime<Utc>,
    },
}

impl Schedule {
    pub fn first_fire(&self) -> DateTime<Utc> {
        match self {
            Schedule::Once { at } => *at,
            Schedule::Every { start_at, .. } => *start_at,
        }
    }

    /// Next fire strictly after `previous`, skipping slots already in the past.
    pub fn next_fire_after(&self, previous: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once { .. } => None,
            Schedule::Every { interval, .. } => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                if step <= chrono::Duration::zero() {
                    return None;
                }
                let next = previous.checked_add_signed(step)?;
                if next > now {
                    return Some(next);
                }
                // Jump straight to the first slot after `now`. Nanosecond
                // precision keeps sub-millisecond intervals exact.
                let step_ns = total_nanos(step);
                let slots = total_nanos(now - previous) / step_ns + 1;
                let offset = step_ns.checked_mul(slots)?;
                previous.checked_add_signed(delta_from_nanos(offset)?)
            }
        }
    }
}

const NANOS_PER_SEC: i128 = 1_000_000_000;

fn total_nanos(delta: chrono::Duration) -> i128 {
    i128::from(delta.num_seconds()) * NANOS_PER_SEC + i128::from(delta.subsec_nanos())
}

/// `None` when the value is out of range for a `chrono::Duration`.
fn delta_from_nanos(nanos: i128) -> Option<chrono::Duration> {
    let secs = i64::try_from(nanos.div_euclid(NANOS_PER_SEC)).ok()?;
    let subsec = u32::try_from(nanos.rem_euclid(NANOS_PER_SEC)).ok()?;
    chrono::Duration::new(secs, subsec)
}

/// Firing rule plus trigger-level data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub schedule: Schedule,
    pub data: TriggerData,
}

impl Trigger {
    pub fn once(at: DateTime<Utc>) -> Self {
        Self {
            schedule: Schedule::Once { at },
            data: TriggerData::new(),
        }
    }

    pub fn now() -> Self {
        Self::once(Utc::now())
    }

    pub fn every(interval: Duration) -> Self {
        Self::every_from(interval, Utc::now())
    }

    pub fn every_from(interval: Duration, start_at: DateTime<Utc>) -> Self {
        Self {
            schedule: Schedule::Every { interval, start_at },
            data: TriggerData::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key, value);
        self
    }
}

/// A schedulable unit: key, routing kind and job-level data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub key: JobKey,
    /// Routes the definition to a registered job body.
    pub kind: String,
    pub data: TriggerData,
}

impl JobDefinition {
    /// New definition with a generated key prefixed by the kind.
    pub fn new(kind: impl Into<String>) -> Self {
        let kind = kind.into();
        Self {
            key: JobKey::generate(&kind),
            kind,
            data: TriggerData::new(),
        }
    }

    pub fn with_key(mut self, key: JobKey) -> Self {
        self.key = key;
        self
    }

    pub fn with_owner(mut self, owner: &TenantKey) -> Self {
        self.data.insert(TriggerData::OWNER_ID, owner.as_str());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key, value);
        self
    }
}

/// Everything the scheduler hands the harness for one fire.
#[derive(Debug, Clone)]
pub struct FireContext {
    pub definition: JobDefinition,
    /// Job data merged with the firing trigger's data.
    pub data: TriggerData,
    /// How many times this logical run has already been refired.
    pub refire_count: u32,
    pub scheduled_for: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
}

impl FireContext {
    pub fn new(definition: JobDefinition, trigger_data: &TriggerData, refire_count: u32) -> Self {
        let data = definition.data.merged(trigger_data);
        let now = Utc::now();
        Self {
            definition,
            data,
            refire_count,
            scheduled_for: now,
            fired_at: now,
        }
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = at;
        self
    }

    pub fn key(&self) -> &JobKey {
        &self.definition.key
    }
}

/// One execution attempt. Owned by the harness for the duration of a run.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub key: JobKey,
    pub run_id: RunId,
    pub attempt: u32,
    pub tenant: Option<TenantKey>,
    pub log_level: Option<LogLevel>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRun {
    pub fn begin(fire: &FireContext) -> Self {
        Self {
            key: fire.key().clone(),
            run_id: RunId::new(),
            attempt: fire.refire_count,
            tenant: fire.data.owner(),
            log_level: fire.data.owner_log_level(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}
