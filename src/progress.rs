//! Run logging for the CLI.
//!
//! Diagnostics go to **stderr** so stdout stays parseable when tables are
//! written there (`--output-format json` without `--output`).
//!
//! - [`init_tracing`] installs the `tracing` subscriber, as text or as one
//!   JSON object per line.
//! - [`TracingLog`] forwards [`RunLog`] messages to `tracing`.

use std::sync::Arc;

use clap::ValueEnum;
use tracing::Subscriber;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use commcare_sync_core::log::{LogLevel, NoLog, RunLog};

/// Shape of log output on stderr.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
    Off,
}

impl LogFormat {
    /// Build the run log for this format.
    pub fn run_log(&self) -> Arc<dyn RunLog> {
        match self {
            LogFormat::Text | LogFormat::Json => Arc::new(TracingLog),
            LogFormat::Off => Arc::new(NoLog),
        }
    }
}

/// The fmt layer for `format`, writing to `writer`.
pub fn log_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(false)
        .with_ansi(ansi);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Text | LogFormat::Off => layer.boxed(),
    }
}

/// Install the global subscriber. `RUST_LOG` wins when set; otherwise the
/// crate logs at info (debug with `verbose`) and dependencies at warn.
pub fn init_tracing(verbose: bool, format: LogFormat) -> anyhow::Result<()> {
    if format == LogFormat::Off {
        return Ok(());
    }
    let default = if verbose {
        "warn,commcare_sync=debug,ccsync=debug"
    } else {
        "warn,commcare_sync=info,ccsync=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(log_layer(
            format,
            std::io::stderr,
            atty::is(atty::Stream::Stderr),
        ))
        .try_init()?;
    Ok(())
}

/// Forwards to the `tracing` macros.
pub struct TracingLog;

impl RunLog for TracingLog {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
    }
}
