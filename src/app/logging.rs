//! Structured logging init (§1.1): `tracing` + `tracing-subscriber` to
//! stderr, fanning out to a rotating per-session file via `tracing-appender`,
//! with verbosity raised by repeated `-v` flags the way the teacher's CLI
//! front-end does.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

/// `-v` → INFO+targets, `-vv` → DEBUG+targets, `-vvv` → TRACE+targets+thread ids.
/// 0 verbosity keeps the default INFO level with no target/thread noise.
pub fn init_logging(verbosity: u8, project_name: &str) -> anyhow::Result<WorkerGuard> {
    let level = match verbosity {
        0 => "info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let log_dir = Path::new("/tmp/scriptorium").join(project_name);
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::never(
        &log_dir,
        format!("run_{}.log", chrono::Utc::now().format("%Y%m%dT%H%M%SZ")),
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbosity >= 2)
        .with_thread_ids(verbosity >= 3)
        .with_line_number(verbosity >= 3);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install global tracing subscriber: {e}"))?;

    Ok(guard)
}
