//! Tracing subscriber setup for hosts embedding the controller.

use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Install a console subscriber filtered by `RUST_LOG` (default `info`). When `SNAPS_LOG_DIR` is
/// set, events are also written to a rolling file there (`SNAPS_LOG_ROTATION`: `hourly`,
/// `minutely` or `daily`). Safe to call more than once; later calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_filter(filter);
    let registry = tracing_subscriber::registry().with(console);

    match std::env::var("SNAPS_LOG_DIR").ok().filter(|d| !d.trim().is_empty()) {
        Some(dir) => {
            if std::fs::create_dir_all(&dir).is_err() {
                eprintln!("failed to create log directory {dir}");
            }
            let rotation = std::env::var("SNAPS_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
            let writer = match rotation.to_lowercase().as_str() {
                "hourly" => tracing_appender::rolling::hourly(&dir, "snaps"),
                "minutely" => tracing_appender::rolling::minutely(&dir, "snaps"),
                _ => tracing_appender::rolling::daily(&dir, "snaps"),
            };
            let (nb, guard) = tracing_appender::non_blocking(writer);
            let _ = FILE_GUARD.set(guard);
            let file_filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_writer(nb)
                .with_filter(file_filter);
            let _ = registry.with(file_layer).try_init();
        }
        None => {
            let _ = registry.try_init();
        }
    }
}

/// Like [`init`] but routes output through the test harness capture.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer().with_filter(filter))
        .try_init();
}
