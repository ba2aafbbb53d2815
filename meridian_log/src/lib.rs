//! Structured logging bootstrap for MeridianDB.

use anyhow::Result;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Handle that updates the log filter at runtime.
pub type ReloadHandle = reload::Handle<EnvFilter, Registry>;

/// Initialize structured JSON logging with hourly rolling files and a
/// runtime-reloadable filter. `dir` is the log directory, `level` the
/// initial log level. Call once per process.
pub fn init(dir: &str, level: Level) -> Result<ReloadHandle> {
    let file_appender = RollingFileAppender::new(Rotation::HOURLY, dir, "meridiandb.log");
    let filter = EnvFilter::default().add_directive(level.into());
    let (filter, handle) = reload::Layer::new(filter);
    let fmt_layer = fmt::layer()
        .with_writer(file_appender)
        .json()
        .with_current_span(false)
        .with_span_list(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
    Ok(handle)
}

/// Initialize plain stderr logging honouring `RUST_LOG`. Used by tests and
/// examples; ignores repeated initialization.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_test_writer())
        .try_init();
}
