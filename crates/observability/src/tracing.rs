//! Tracing/logging initialization.
//!
//! The base verbosity comes from `RUST_LOG` (default `info`). On top of it a
//! job run may carry a per-tenant `log_level_override` span field; events
//! emitted inside such a span are let through down to that level even when
//! the base filter would drop them.

use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::subscriber::Interest;
use tracing::{Metadata, Subscriber};
use tracing_subscriber::layer::{Context, Filter, Layered, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::context::{LOG_LEVEL_FIELD, LogLevel};

/// Output format for log lines.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Multi-line human readable output for local runs.
    Pretty,
}

impl LogFormat {
    /// Read `JOBWRIGHT_LOG_FORMAT` (`json` | `pretty`), defaulting to JSON.
    pub fn from_env() -> Self {
        match std::env::var("JOBWRIGHT_LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_with(format: LogFormat) {
    let base = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let filter = TenantLevelFilter::new(base);

    let fmt_layer: Box<dyn Layer<Layered<LevelOverrideLayer, Registry>> + Send + Sync> =
        match format {
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_timer(tracing_subscriber::fmt::time::SystemTime)
                .with_target(false)
                .with_filter(filter)
                .boxed(),
            LogFormat::Pretty => tracing_subscriber::fmt::layer()
                .pretty()
                .with_filter(filter)
                .boxed(),
        };

    let _ = tracing_subscriber::registry()
        .with(LevelOverrideLayer)
        .with(fmt_layer)
        .try_init();
}

/// Level override stored in a span's extensions.
#[derive(Debug, Copy, Clone)]
struct LevelOverride(LogLevel);

#[derive(Default)]
struct OverrideVisitor(Option<LogLevel>);

impl Visit for OverrideVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == LOG_LEVEL_FIELD {
            self.0 = value.parse().ok();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn core::fmt::Debug) {
        if field.name() == LOG_LEVEL_FIELD {
            self.0 = format!("{value:?}").trim_matches('"').parse().ok();
        }
    }
}

/// Captures `log_level_override` span fields into span extensions.
///
/// Must sit below the filtered output layer so the extension exists by the
/// time [`TenantLevelFilter`] looks for it.
#[derive(Debug, Default, Copy, Clone)]
pub struct LevelOverrideLayer;

impl LevelOverrideLayer {
    fn store<S>(id: &Id, level: Option<LogLevel>, ctx: &Context<'_, S>)
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        if let (Some(level), Some(span)) = (level, ctx.span(id)) {
            span.extensions_mut().replace(LevelOverride(level));
        }
    }
}

impl<S> Layer<S> for LevelOverrideLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = OverrideVisitor::default();
        attrs.record(&mut visitor);
        Self::store(id, visitor.0, &ctx);
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let mut visitor = OverrideVisitor::default();
        values.record(&mut visitor);
        Self::store(id, visitor.0, &ctx);
    }
}

/// Per-layer filter: `RUST_LOG` directives, widened by the innermost
/// enclosing span's level override.
#[derive(Debug)]
pub struct TenantLevelFilter {
    base: EnvFilter,
}

impl TenantLevelFilter {
    pub fn new(base: EnvFilter) -> Self {
        Self { base }
    }

    fn override_level<S>(cx: &Context<'_, S>) -> Option<LogLevel>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let current = cx.lookup_current()?;
        current
            .scope()
            .find_map(|span| span.extensions().get::<LevelOverride>().map(|o| o.0))
    }
}

impl<S> Filter<S> for TenantLevelFilter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn enabled(&self, meta: &Metadata<'_>, cx: &Context<'_, S>) -> bool {
        if Filter::<S>::enabled(&self.base, meta, cx) {
            return true;
        }
        // Spans that can carry an override stay visible to this layer,
        // otherwise `lookup_current` never reaches them under a strict base.
        if meta.is_span() && meta.fields().field(LOG_LEVEL_FIELD).is_some() {
            return true;
        }
        Self::override_level(cx).is_some_and(|level| *meta.level() <= level.level())
    }

    fn callsite_enabled(&self, _meta: &'static Metadata<'static>) -> Interest {
        // The override is only known at runtime, so nothing can be cached.
        Interest::sometimes()
    }

    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        Filter::<S>::on_new_span(&self.base, attrs, id, ctx)
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        Filter::<S>::on_record(&self.base, id, values, ctx)
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        Filter::<S>::on_enter(&self.base, id, ctx)
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        Filter::<S>::on_exit(&self.base, id, ctx)
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        Filter::<S>::on_close(&self.base, id, ctx)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    use jobwright_core::{RunId, TenantKey};
    use tracing::Level;

    use super::*;
    use crate::context::ExecutionContext;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn with_capture(f: impl FnOnce()) -> String {
        with_capture_under("info", f)
    }

    fn with_capture_under(base: &str, f: impl FnOnce()) -> String {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = tracing_subscriber::registry().with(LevelOverrideLayer).with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(move || writer.clone())
                .with_filter(TenantLevelFilter::new(EnvFilter::new(base))),
        );
        tracing::subscriber::with_default(subscriber, f);
        out.text()
    }

    #[test]
    fn override_raises_verbosity_inside_the_run_span() {
        let text = with_capture(|| {
            let ctx = ExecutionContext::for_job("stats-1", RunId::new())
                .with_tenant(Some(TenantKey::new("acme").unwrap()))
                .with_log_level(Some(LogLevel::new(Level::DEBUG)));
            let span = ctx.span();
            let _entered = span.enter();
            tracing::debug!("inside overridden run");
        });

        assert!(text.contains("inside overridden run"));
        assert!(text.contains("acme"));
    }

    #[test]
    fn base_filter_applies_without_override() {
        let text = with_capture(|| {
            let ctx = ExecutionContext::for_job("stats-2", RunId::new());
            let span = ctx.span();
            let _entered = span.enter();
            tracing::debug!("dropped debug line");
            tracing::info!("kept info line");
        });

        assert!(!text.contains("dropped debug line"));
        assert!(text.contains("kept info line"));
        assert!(text.contains("stats-2"));
    }

    #[test]
    fn override_widens_a_stricter_base_filter() {
        let text = with_capture_under("warn", || {
            tracing::info!("info outside any run");
            let ctx = ExecutionContext::for_job("stats-3", RunId::new())
                .with_log_level(Some(LogLevel::new(Level::DEBUG)));
            let span = ctx.span();
            let _entered = span.enter();
            tracing::info!("info inside overridden run");
            tracing::debug!("debug inside overridden run");
            tracing::trace!("trace inside overridden run");
        });

        assert!(!text.contains("info outside any run"));
        assert!(text.contains("info inside overridden run"));
        assert!(text.contains("debug inside overridden run"));
        assert!(!text.contains("trace inside overridden run"));
    }

    #[test]
    fn run_span_without_override_stays_at_base_level() {
        let text = with_capture_under("warn", || {
            let ctx = ExecutionContext::for_job("stats-4", RunId::new());
            let span = ctx.span();
            let _entered = span.enter();
            tracing::info!("info in plain run");
            tracing::warn!("warn in plain run");
        });

        assert!(!text.contains("info in plain run"));
        assert!(text.contains("warn in plain run"));
    }
}
