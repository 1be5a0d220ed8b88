//! Shared `tracing` setup for the three binaries: an `EnvFilter` (default
//! `info`, overridable via `RUST_LOG`) plus a non-blocking rolling file
//! writer under the component's configured `log_dir`. The returned guard
//! must be held for the lifetime of `main` — dropping it flushes and closes
//! the writer early.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub fn init(component: &str, log_dir: &str) -> WorkerGuard {
    std::fs::create_dir_all(log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(log_dir, format!("{component}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();

    guard
}
