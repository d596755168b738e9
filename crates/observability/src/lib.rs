//! Tracing/logging setup and per-run execution context.

/// Initialize process-wide tracing with JSON output.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init_with(LogFormat::Json);
}

pub mod context;
pub mod tracing;

pub use self::context::{ExecutionContext, LogLevel, LogLevelError, REQUEST_TYPE_JOB};
pub use self::tracing::{LevelOverrideLayer, LogFormat, TenantLevelFilter, init_with};
