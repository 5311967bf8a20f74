//! scene-daemon: Headless scene replica.
//!
//! Runs one scene session against a storage directory shared with sibling
//! replicas, using the same scene-core as the editor. Writes by siblings are
//! picked up through a filesystem watcher and merged in; local imports are
//! saved back with the usual debounce.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

// Use library exports
use scene_daemon::dir_source::DirSource;
use scene_daemon::native_storage::NativeStorage;
use scene_daemon::watcher::{StorageEvent, StorageWatcher};

use scene_core::{
    ReplicaId, SceneData, SceneEvent, SceneLocator, SceneSession, SessionConfig, SessionEffect,
    SessionEvent, SessionHost, Subscription, SystemClock,
};

/// How often the session gets a `Tick`.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(name = "scene-daemon")]
#[command(about = "Headless scene replica over a shared storage directory")]
struct Args {
    /// Storage directory shared with sibling replicas
    #[arg(short, long)]
    dir: PathBuf,

    /// Scene link to open (`#json=<id>,<key>`, `#room=<id>,<key>`, `#url=...`)
    #[arg(short, long)]
    link: Option<String>,

    /// Directory serving share links, rooms and their files
    #[arg(long)]
    blob_root: Option<PathBuf>,

    /// Scene file to merge into the session after opening
    #[arg(long)]
    import: Option<PathBuf>,

    /// JSON session config (debounce and check intervals)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Save debounce in milliseconds (overrides the config file)
    #[arg(long)]
    save_debounce_ms: Option<u64>,

    /// Period of the staleness check in milliseconds (overrides the config file)
    #[arg(long)]
    stale_check_ms: Option<u64>,

    /// Replica ID as 16 hex chars (generated if not provided)
    #[arg(long)]
    replica_id: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

/// Daemon state holding all components.
struct Daemon {
    session: SceneSession,
    watcher: StorageWatcher,
    /// Keeps the event log subscription alive
    _events: Subscription,
}

impl Daemon {
    /// Feed one event to the session and carry out what it asks for.
    async fn dispatch(&mut self, event: SessionEvent) {
        match self.session.handle(event).await {
            Ok(effects) => self.run_effects(effects),
            Err(e) => error!("Failed to handle session event: {}", e),
        }
    }

    fn run_effects(&self, effects: Vec<SessionEffect>) {
        for effect in effects {
            match effect {
                SessionEffect::Spawn(task) => {
                    tokio::spawn(async move {
                        let outcome = task.await;
                        debug!(
                            "File fetch finished: {} loaded, {} errored",
                            outcome.loaded_files.len(),
                            outcome.errored_files.len()
                        );
                    });
                }
                SessionEffect::Broadcast(payload) => {
                    // No peer transport in the daemon; rooms are read-only snapshots.
                    info!(
                        "{:?} of {} element(s) ready for peers",
                        payload.kind,
                        payload.elements.len()
                    );
                }
                SessionEffect::PromptUnload => {
                    warn!("Unsaved files pending at shutdown");
                }
            }
        }
    }

    /// Handle a change in the storage directory.
    async fn on_storage_changed(&mut self, event: StorageEvent) {
        debug!("Storage changed: {} ({:?})", event.key, event.kind);
        self.dispatch(SessionEvent::StorageChanged).await;
    }

    async fn import(&mut self, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let scene = SceneData::from_json(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        info!("Importing {} element(s) from {:?}", scene.elements.len(), path);
        self.dispatch(SessionEvent::Import(scene.elements)).await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.dispatch(SessionEvent::BeforeUnload).await;
        self.dispatch(SessionEvent::Unload).await;
        if let Err(e) = self.session.close().await {
            error!("Failed to close session: {}", e);
        }
    }
}

fn log_event(event: &SceneEvent) {
    match event {
        SceneEvent::Notice { anomaly, detail } => warn!("{:?}: {}", anomaly, detail),
        SceneEvent::StaleStateImported { key } => info!("Pulled newer {} from storage", key),
        SceneEvent::SaveCompleted {
            elements_version,
            saved_files,
            errored_files,
        } => info!(
            "Saved scene (version {}, {} file(s) saved, {} errored)",
            elements_version, saved_files, errored_files
        ),
        other => debug!("{:?}", other),
    }
}

async fn read_config(path: Option<&PathBuf>) -> Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing config {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,scene_daemon=debug"
    } else {
        "info,scene_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting scene-daemon");
    info!("Storage path: {:?}", args.dir);

    let mut config = read_config(args.config.as_ref()).await?;
    if let Some(ms) = args.save_debounce_ms {
        config.save_debounce_ms = ms;
    }
    if let Some(ms) = args.stale_check_ms {
        config.stale_check_interval_ms = ms;
    }
    debug!("Session config: {:?}", config);

    // Generate replica ID if not provided
    let replica = match &args.replica_id {
        Some(id) => id.parse::<ReplicaId>().context("invalid --replica-id")?,
        None => {
            let id = ReplicaId::generate();
            info!("Generated replica ID: {}", id);
            id
        }
    };

    let locator = args
        .link
        .as_deref()
        .map(SceneLocator::parse)
        .unwrap_or(SceneLocator::Local);

    let mut host = SessionHost::new(
        Arc::new(NativeStorage::new(args.dir.clone())),
        Arc::new(SystemClock),
    );
    if let Some(root) = &args.blob_root {
        info!("Remote sources served from {:?}", root);
        let source = Arc::new(DirSource::new(root.clone()));
        host = host
            .with_remote_files(source.clone())
            .with_remote_scenes(source);
    }
    let events = host.events.subscribe(log_event);

    let session = SceneSession::open(replica, config, locator, host).await?;
    info!(
        "Session open, replica {} ({} element(s))",
        session.replica(),
        session.store().elements().len()
    );

    // Create storage watcher
    let watcher = StorageWatcher::new(args.dir.clone())?;
    info!("Storage watcher started");

    let mut daemon = Daemon {
        session,
        watcher,
        _events: events,
    };

    if let Some(path) = &args.import {
        daemon.import(path).await?;
    }

    info!("Daemon running. Press Ctrl+C to stop.");

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Main event loop
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                daemon.dispatch(SessionEvent::Tick).await;
            }

            // Handle storage watcher events
            Some(event) = daemon.watcher.event_rx().recv() => {
                daemon.on_storage_changed(event).await;
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    daemon.shutdown().await;
    info!("Shutting down");
    Ok(())
}
