mod args;
mod dirs;

use std::io;
use std::sync::Arc;

use budget_app::{
    AppPaths, LogNotifier, Monitor, ensure_app_data_dir, load_or_create, logging, watch_limits,
};
use budget_core::{LiveStatus, SafetyVerdict};
use budget_db::Db;
use ingest::FileSource;
use serde::Serialize;

#[derive(Serialize)]
struct StatusReport {
    status: LiveStatus,
    verdict: SafetyVerdict,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = args::parse_args().map_err(|err| {
        eprintln!("{err}");
        args::print_help();
        io::Error::new(io::ErrorKind::InvalidInput, "invalid arguments")
    })?;

    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => dirs::resolve_data_dir().map_err(io::Error::other)?.dir,
    };
    let mut paths = AppPaths::new(data_dir);
    if let Some(config_path) = args.config {
        paths = paths.with_config_path(config_path);
    }
    ensure_app_data_dir(&paths).map_err(|err| io::Error::other(err.to_string()))?;

    let loaded =
        load_or_create(&paths.config_path).map_err(|err| io::Error::other(err.to_string()))?;
    logging::init(&loaded.config.log_level);
    if loaded.created {
        tracing::info!(path = %loaded.path.display(), "created default config");
    }
    let config = loaded.config;
    tracing::info!(data_dir = %paths.app_data_dir.display(), "using data dir");

    let db = Db::open_and_migrate(&paths.db_path).map_err(|err| {
        io::Error::other(format!("failed to initialize database: {}", err))
    })?;
    let source =
        FileSource::new(config.source_roots()).with_max_batch_bytes(config.runtime.max_batch_bytes);
    for root in source.roots() {
        tracing::info!(root = %root.path.display(), "watching usage logs");
    }

    let monitor = Monitor::start(
        &config,
        Box::new(db),
        Arc::new(source),
        Arc::new(LogNotifier),
    )
    .await
    .map_err(|err| io::Error::other(err.to_string()))?;
    let handle = monitor.handle();

    if args.status {
        let report = StatusReport {
            status: handle
                .live_status()
                .await
                .map_err(|err| io::Error::other(err.to_string()))?,
            verdict: handle.budget_verdict().await,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        monitor
            .shutdown()
            .await
            .map_err(|err| io::Error::other(err.to_string()))?;
        return Ok(());
    }

    let _limits_watcher = match watch_limits(&paths.config_path, monitor.limits_sender()) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            tracing::warn!(error = %err, "config hot reload unavailable");
            None
        }
    };

    println!("Budget monitor is running. Press Ctrl+C to stop.");
    shutdown_signal().await;
    tracing::info!("shutting down");
    monitor
        .shutdown()
        .await
        .map_err(|err| io::Error::other(err.to_string()))?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
