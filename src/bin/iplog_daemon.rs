use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use iplog::config::{Config, LookupProvider};
use iplog::geolocation;
use iplog::models::{Request, UserProfile};
use iplog::output::{OutputFormat, OutputHandler};
use iplog::persistence;
use iplog::tracking::{AddressTracker, HistoryPolicy, IngestError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// A finished name query on its way to the presenter
type QueryResult = (String, Result<Option<UserProfile>, IngestError>);

/// Address history daemon
///
/// Reads one JSON request per line from stdin:
/// `{"type":"connect","id":..,"name":..,"address":..}` or
/// `{"type":"lookup","name":..}`.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Starting iplog daemon...");

    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        Config::from_file(&config_path)?
    } else {
        log::warn!(
            "Config file {:?} not found, using defaults without geolocation",
            config_path
        );
        let mut config = Config::default();
        config.lookup.provider = LookupProvider::None;
        config
    };

    // A broken store disables address logging, not the daemon
    let backend = match persistence::open_backend(&config.storage, config.history.max_size) {
        Ok(backend) => Some(backend),
        Err(e) => {
            log::error!("Storage unavailable, address logging disabled: {}", e);
            None
        }
    };

    let lookup = if config.features.query_location {
        match geolocation::from_config(&config.lookup) {
            Ok(lookup) => lookup,
            Err(e) => {
                log::warn!("Geolocation unavailable, recording without it: {}", e);
                None
            }
        }
    } else {
        None
    };

    let tracker = backend.clone().map(|store| {
        Arc::new(AddressTracker::new(
            store,
            lookup,
            HistoryPolicy::from_config(&config),
        ))
    });

    let output = OutputHandler::new(
        OutputFormat::from_name(&config.output.format),
        config.output.file_path.clone(),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, gracefully stopping...");
        let _ = shutdown_tx.send(true);
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(
        tracker.clone(),
        config.features.auto_log_on_join,
        output,
        shutdown_rx,
    ));
    // The stdin reader may still be parked in a blocking read
    runtime.shutdown_timeout(Duration::from_secs(1));

    drop(tracker);
    if let Some(backend) = backend {
        backend.shutdown();
    }

    log::info!("iplog daemon stopped");
    Ok(())
}

async fn run(
    tracker: Option<Arc<AddressTracker>>,
    auto_log_on_join: bool,
    mut output: OutputHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<QueryResult>();

    // Every query result is presented from this one task
    let presenter = tokio::spawn(async move {
        while let Some((name, result)) = result_rx.recv().await {
            match result {
                Ok(profile) => {
                    if let Err(e) = output.write_lookup(&name, profile.as_ref()) {
                        log::error!("Failed to write lookup result for {}: {}", name, e);
                    }
                }
                Err(e) => log::error!("Lookup of {} failed: {}", name, e),
            }
        }
        if let Err(e) = output.flush() {
            log::error!("Failed to flush output: {}", e);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();

    log::info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => dispatch(
                    &line,
                    tracker.as_ref(),
                    auto_log_on_join,
                    &mut tasks,
                    &result_tx,
                ),
                Ok(None) => {
                    log::info!("End of input");
                    break;
                }
                Err(e) => {
                    log::error!("Failed to read input: {}", e);
                    break;
                }
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => report_join(joined),
        }
    }

    // Let in-flight requests finish before the store is shut down
    while let Some(joined) = tasks.join_next().await {
        report_join(joined);
    }
    drop(result_tx);
    if let Err(e) = presenter.await {
        log::error!("Presenter task failed: {}", e);
    }
}

/// Parse one request line and start its task
fn dispatch(
    line: &str,
    tracker: Option<&Arc<AddressTracker>>,
    auto_log_on_join: bool,
    tasks: &mut JoinSet<()>,
    results: &mpsc::UnboundedSender<QueryResult>,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            log::warn!("Ignoring malformed request: {}", e);
            return;
        }
    };

    let tracker = match tracker {
        Some(tracker) => tracker.clone(),
        None => {
            log::warn!("Address logging is disabled, ignoring request");
            return;
        }
    };

    match request {
        Request::Connect(event) => {
            if !auto_log_on_join {
                log::debug!("Automatic logging is off, ignoring connect of {}", event.id);
                return;
            }
            tasks.spawn(async move {
                let name = event.name.clone();
                if let Err(e) = tracker.ingest(event).await {
                    log::error!("Failed to record address for {}: {}", name, e);
                }
            });
        }
        Request::Lookup { name } => {
            let results = results.clone();
            tasks.spawn(async move {
                let result = tracker.query(name.clone()).await;
                if results.send((name, result)).is_err() {
                    log::warn!("Presenter stopped, dropping lookup result");
                }
            });
        }
    }
}

fn report_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        log::error!("Request task failed: {}", e);
    }
}
