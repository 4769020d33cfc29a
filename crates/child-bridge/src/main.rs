//! Child Bridge Host
//!
//! Starts one supervised worker per plugin entry that carries a `_bridge`
//! block and keeps them running until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use child_bridge::config::{ConfigStore, JsonFileStore, PluginConfig};
use child_bridge::process::default_worker_path;
use child_bridge::{
    BridgeOptions, ChildBridgeHandle, ChildBridgeSupervisor, HomebridgeConfig, PluginIdentity, PluginType,
    ShutdownSignal, SupervisorConfig,
};

/// Run plugin instances as isolated child bridges
#[derive(Parser, Debug)]
#[command(name = "child-bridge")]
#[command(about = "Run plugin instances as isolated child bridges", long_about = None)]
struct Args {
    /// Enable debug logging in workers
    #[arg(short = 'D', long)]
    debug: bool,

    /// Force coloured log output
    #[arg(short = 'C', long)]
    color: bool,

    /// Allow insecure access to accessories
    #[arg(short = 'I', long)]
    insecure: bool,

    /// Omit timestamps from worker logs
    #[arg(short = 'T', long)]
    no_timestamp: bool,

    /// Keep cached accessories whose plugin is gone
    #[arg(short = 'K', long)]
    keep_orphans: bool,

    /// Do not print the setup QR code
    #[arg(short = 'Q', long)]
    no_qrcode: bool,

    /// Custom storage directory
    #[arg(short = 'U', long)]
    user_storage_path: Option<PathBuf>,

    /// Custom plugin directory
    #[arg(short = 'P', long)]
    plugin_path: Option<PathBuf>,

    /// Worker executable
    #[arg(long)]
    worker: Option<PathBuf>,
}

impl Args {
    fn options(&self) -> BridgeOptions {
        BridgeOptions {
            debug_mode_enabled: self.debug,
            force_colour_logging: self.color,
            insecure_access: self.insecure,
            no_log_timestamps: self.no_timestamp,
            keep_orphaned_cached_accessories: self.keep_orphans,
            hide_qr_code: self.no_qrcode,
            custom_storage_path: self.user_storage_path.clone(),
            custom_plugin_path: self.plugin_path.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "child_bridge=debug" } else { "child_bridge=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting child bridge host v{}", env!("CARGO_PKG_VERSION"));

    let options = args.options();
    let store = Arc::new(JsonFileStore::new(options.config_path()));
    info!("Loading config from: {}", store.path().display());

    let document = store
        .load()
        .await
        .with_context(|| format!("Failed to load {}", store.path().display()))?;

    let worker = args.worker.clone().unwrap_or_else(default_worker_path);
    let shutdown = ShutdownSignal::new();
    let handles = start_bridges(&document, &options, worker, store, &shutdown)?;

    if handles.is_empty() {
        warn!("No plugin entries with a _bridge block, nothing to run");
        return Ok(());
    }
    info!("Started {} child bridge(s)", handles.len());

    shutdown_signal().await;
    shutdown.trigger();

    join_all(handles.iter().map(|handle| handle.terminated())).await;
    info!("All child bridges stopped");

    Ok(())
}

/// Spawn a supervisor for every entry carrying `_bridge`
#[cfg(unix)]
fn start_bridges(
    document: &HomebridgeConfig,
    options: &BridgeOptions,
    worker: PathBuf,
    store: Arc<JsonFileStore>,
    shutdown: &ShutdownSignal,
) -> Result<Vec<ChildBridgeHandle>> {
    let launcher = Arc::new(child_bridge::process::OsLauncher::new(worker));
    let mut handles = Vec::new();

    for kind in [PluginType::Platform, PluginType::Accessory] {
        for raw in document.entries(kind) {
            if raw.get("_bridge").is_none() {
                continue;
            }
            let entry = match PluginConfig::from_entry(raw) {
                Ok(entry) => entry,
                Err(e) => {
                    error!("Skipping invalid {} entry: {}", kind, e);
                    continue;
                }
            };
            let Some(identifier) = entry.identifier(kind).map(str::to_owned) else {
                warn!("Skipping {} entry without an identifier", kind);
                continue;
            };

            let identity = resolve_identity(kind, &identifier, options);
            let config = match SupervisorConfig::new(identity, entry, document.clone(), options.clone()) {
                Ok(config) => config,
                Err(e) => {
                    error!("Skipping {}: {}", identifier, e);
                    continue;
                }
            };

            handles.push(ChildBridgeSupervisor::spawn(
                config,
                launcher.clone(),
                store.clone(),
                shutdown.subscribe(),
            ));
        }
    }

    Ok(handles)
}

#[cfg(not(unix))]
fn start_bridges(
    _document: &HomebridgeConfig,
    _options: &BridgeOptions,
    _worker: PathBuf,
    _store: Arc<JsonFileStore>,
    _shutdown: &ShutdownSignal,
) -> Result<Vec<ChildBridgeHandle>> {
    anyhow::bail!("Child bridges require a unix platform")
}

/// Plugin name and code location for an entry's identifier.
///
/// `homebridge-foo.Bar` names its plugin explicitly; a bare identifier is
/// assumed to be registered by a plugin of the same name.
fn resolve_identity(kind: PluginType, identifier: &str, options: &BridgeOptions) -> PluginIdentity {
    let (plugin_name, identifier) = match identifier.split_once('.') {
        Some((plugin, id)) => (plugin.to_string(), id.to_string()),
        None => (identifier.to_string(), identifier.to_string()),
    };

    let plugin_root = options
        .custom_plugin_path
        .clone()
        .unwrap_or_else(|| options.storage_path().join("node_modules"));
    let plugin_path = plugin_root.join(&plugin_name);

    PluginIdentity::new(kind, identifier, plugin_name, plugin_path)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
