//! Headless host bridge binary for stdin/stdout JSON communication.
//!
//! This binary reads `CommandEnvelope` messages as newline-delimited JSON
//! from stdin, dispatches them to the update engine, and writes
//! `ResponseEnvelope` and `EventEnvelope` messages to stdout.
//!
//! All tracing/diagnostic output goes to stderr (and optionally a daily log
//! file) so that stdout remains a clean JSON protocol channel.

use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;
use updraft::host::handler::EngineHandler;
use updraft::host::stdio::run_stdio_bridge;
use updraft::update::scratch::leftover_sessions;
use updraft::{UpdateEngine, UpdraftConfig, updraft_dirs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = updraft_dirs::config_file();
    let config = UpdraftConfig::load_or_default(&config_path)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", config_path.display()))?;

    let _log_guard = init_tracing(config.host.log_to_file);

    tracing::info!(
        version = %config.current_version(),
        config = %config_path.display(),
        "updraft-host starting"
    );

    match leftover_sessions(&config.scratch_root()) {
        Ok(left) if !left.is_empty() => {
            tracing::warn!(count = left.len(), "scratch space from earlier sessions is still on disk");
        }
        Ok(_) => {}
        Err(e) => tracing::debug!(error = %e, "could not list scratch space"),
    }

    let host_config = config.host.clone();
    let engine = UpdateEngine::new(config)
        .map_err(|e| anyhow::anyhow!("cannot start update engine: {e}"))?;
    let handler = EngineHandler::new(Arc::new(engine));

    run_stdio_bridge(handler, &host_config).await.map_err(|e| {
        tracing::error!(error = %e, "updraft-host exited with error");
        anyhow::anyhow!("updraft-host failed: {e}")
    })?;

    tracing::info!("updraft-host shut down cleanly");
    Ok(())
}

/// Log to stderr, plus a daily file under the logs directory when enabled.
fn init_tracing(log_to_file: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = if log_to_file {
        let appender = tracing_appender::rolling::daily(updraft_dirs::logs_dir(), "updraft-host.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}
