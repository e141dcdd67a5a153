//! Logging initialization: console output plus a non-blocking daily file
//! appender under `logs/`.

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber. The returned guard must be kept alive
/// for the lifetime of the process or buffered file output is lost.
pub fn init_logging(filter: &str) -> Result<WorkerGuard> {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let file_appender = tracing_appender::rolling::daily("logs", "medprice.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .try_init()?;

    Ok(guard)
}
