//! Per-run execution context.
//!
//! Every job run carries the same small set of keys into its logs: the
//! request type, the job id, the run id, and optionally the owning tenant and
//! a log verbosity override for that tenant. The context is an explicit value
//! handed down the call chain; [`ExecutionContext::span`] turns it into a
//! tracing span so every event emitted inside the run is tagged with it.

use core::str::FromStr;

use tracing::{Level, Span, field};

use jobwright_core::{RunId, TenantKey};

/// `request_type` recorded for job runs.
pub const REQUEST_TYPE_JOB: &str = "job";

/// Span field holding the tenant's log level override.
pub(crate) const LOG_LEVEL_FIELD: &str = "log_level_override";

/// Log verbosity override.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LogLevel(Level);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level: {0}")]
pub struct LogLevelError(String);

impl LogLevel {
    pub fn new(level: Level) -> Self {
        Self(level)
    }

    pub fn level(&self) -> Level {
        self.0
    }

    pub fn as_str(&self) -> &'static str {
        self.0.as_str()
    }
}

impl FromStr for LogLevel {
    type Err = LogLevelError;

    /// Case-insensitive. Accepts the usual aliases (`warning`, `fatal`, `all`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = match s.trim().to_ascii_lowercase().as_str() {
            "trace" | "all" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" | "warning" => Level::WARN,
            "error" | "fatal" => Level::ERROR,
            _ => return Err(LogLevelError(s.to_string())),
        };
        Ok(Self(level))
    }
}

impl core::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contextual metadata for one job run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    request_type: &'static str,
    job_id: String,
    run_id: RunId,
    tenant: Option<TenantKey>,
    log_level: Option<LogLevel>,
}

impl ExecutionContext {
    pub fn for_job(job_id: impl Into<String>, run_id: RunId) -> Self {
        Self {
            request_type: REQUEST_TYPE_JOB,
            job_id: job_id.into(),
            run_id,
            tenant: None,
            log_level: None,
        }
    }

    pub fn with_tenant(mut self, tenant: Option<TenantKey>) -> Self {
        self.tenant = tenant;
        self
    }

    pub fn with_log_level(mut self, level: Option<LogLevel>) -> Self {
        self.log_level = level;
        self
    }

    pub fn request_type(&self) -> &'static str {
        self.request_type
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn tenant(&self) -> Option<&TenantKey> {
        self.tenant.as_ref()
    }

    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    /// Build the span that scopes this run's logging.
    ///
    /// The span always exists (even when `info` is filtered out) when the
    /// subscriber has a [`crate::LevelOverrideLayer`], so the override can
    /// raise verbosity for events inside it.
    pub fn span(&self) -> Span {
        let span = tracing::info_span!(
            "job_run",
            request_type = self.request_type,
            job_id = %self.job_id,
            run_id = %self.run_id,
            tenant_id = field::Empty,
            log_level_override = field::Empty,
        );
        if let Some(tenant) = &self.tenant {
            span.record("tenant_id", tenant.as_str());
        }
        if let Some(level) = self.log_level {
            span.record(LOG_LEVEL_FIELD, level.as_str());
        }
        span
    }
}
