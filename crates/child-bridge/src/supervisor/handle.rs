//! Child Bridge Handle
//!
//! Cloneable parent-side handle to a running supervisor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info};

use crate::config::{BridgeOverride, ConfigStore, HomebridgeConfig, PluginConfig, PluginType};

// ─────────────────────────────────────────────────────────────────────────────
// Child Bridge State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a supervised worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildBridgeState {
    /// Launching the worker process
    Spawning,
    /// Process running, waiting for `ready`
    AwaitingReady,
    /// `load` sent, waiting for `loaded`
    Loading,
    /// `start` sent, worker is serving
    Active,
    /// Worker exited, respawn scheduled
    Restarting,
    /// Stopped on request, will not restart until started again
    Stopped,
    /// Shut down for good
    Terminated,
}

impl ChildBridgeState {
    pub fn is_terminal(&self) -> bool {
        *self == ChildBridgeState::Terminated
    }
}

impl std::fmt::Display for ChildBridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildBridgeState::Spawning => write!(f, "spawning"),
            ChildBridgeState::AwaitingReady => write!(f, "awaiting ready"),
            ChildBridgeState::Loading => write!(f, "loading"),
            ChildBridgeState::Active => write!(f, "active"),
            ChildBridgeState::Restarting => write!(f, "restarting"),
            ChildBridgeState::Stopped => write!(f, "stopped"),
            ChildBridgeState::Terminated => write!(f, "terminated"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshots
// ─────────────────────────────────────────────────────────────────────────────

/// The configuration pair currently applied to a child bridge
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub plugin_config: PluginConfig,
    pub bridge: BridgeOverride,
}

/// Status summary for a child bridge
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildBridgeMetadata {
    pub status: ChildBridgeState,
    pub pid: Option<u32>,
    pub name: String,
    pub username: String,
    pub identifier: String,
    pub plugin: String,
    #[serde(rename = "type")]
    pub kind: PluginType,
    pub restart_count: u32,
    /// Messages not delivered because the channel was disconnected
    pub dropped_messages: u32,
    pub manually_stopped: bool,
    pub shutting_down: bool,
    pub last_started_at: Option<DateTime<Utc>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor Command
// ─────────────────────────────────────────────────────────────────────────────

/// Commands processed by the supervisor task
pub(crate) enum SupervisorCommand {
    /// Apply a freshly read document. `seq` orders reads across handles.
    ApplyConfig {
        document: HomebridgeConfig,
        seq: u64,
        reply: oneshot::Sender<()>,
    },
    /// Tear the worker down so it restarts
    Restart,
    /// Stop the worker and keep it stopped
    Stop,
    /// Undo a manual stop
    Start,
    /// Shut this supervisor down for good
    Shutdown,
    Snapshot(oneshot::Sender<ConfigSnapshot>),
    Metadata(oneshot::Sender<ChildBridgeMetadata>),
}

// ─────────────────────────────────────────────────────────────────────────────
// Child Bridge Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to communicate with a running supervisor
///
/// Dropping every handle shuts the supervisor down.
#[derive(Clone)]
pub struct ChildBridgeHandle {
    name: Arc<str>,
    command_tx: mpsc::Sender<SupervisorCommand>,
    state: watch::Receiver<ChildBridgeState>,
    store: Arc<dyn ConfigStore>,
    /// Last refresh sequence number handed out, shared by all clones
    refresh_seq: Arc<AtomicU64>,
    span: Span,
}

impl ChildBridgeHandle {
    pub(crate) fn new(
        name: String,
        command_tx: mpsc::Sender<SupervisorCommand>,
        state: watch::Receiver<ChildBridgeState>,
        store: Arc<dyn ConfigStore>,
        span: Span,
    ) -> Self {
        Self {
            name: name.into(),
            command_tx,
            state,
            store,
            refresh_seq: Arc::new(AtomicU64::new(0)),
            span,
        }
    }

    /// Instance name used to tag log lines
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChildBridgeState {
        *self.state.borrow()
    }

    /// Wait until the state satisfies `pred` and return it.
    ///
    /// Returns the last known state if the supervisor goes away first.
    pub async fn wait_for_state(&self, mut pred: impl FnMut(ChildBridgeState) -> bool) -> ChildBridgeState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|state| pred(*state)).await.map(|state| *state);
        reached.unwrap_or_else(|_| *rx.borrow())
    }

    /// Wait for the supervisor to reach `Terminated`
    pub async fn terminated(&self) {
        self.wait_for_state(|state| state.is_terminal()).await;
    }

    /// Reread the shared configuration and apply this instance's entry.
    ///
    /// Failures are logged, never returned. Does not restart the worker.
    /// When refreshes overlap, the document read last wins even if an
    /// earlier read finishes after it.
    pub async fn refresh_config(&self) {
        self.refresh().instrument(self.span.clone()).await
    }

    async fn refresh(&self) {
        let seq = self.refresh_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let document = match self.store.load().await {
            Ok(document) => document,
            Err(e) => {
                error!("Failed to refresh child bridge config: {}", e);
                return;
            }
        };

        let (reply, done) = oneshot::channel();
        if self.send(SupervisorCommand::ApplyConfig { document, seq, reply }).await {
            let _ = done.await;
        }
    }

    /// Refresh the configuration, then restart the worker with it
    pub fn restart_bridge(&self) -> JoinHandle<()> {
        self.span.in_scope(|| info!("Restarting child bridge..."));

        let this = self.clone();
        tokio::spawn(async move {
            this.refresh_config().await;
            this.send(SupervisorCommand::Restart).await;
        })
    }

    /// Stop the worker. It stays down until `start_bridge`.
    pub async fn stop_bridge(&self) {
        self.send(SupervisorCommand::Stop).await;
    }

    /// Refresh the configuration and start a manually stopped worker
    pub async fn start_bridge(&self) {
        self.refresh_config().await;
        self.send(SupervisorCommand::Start).await;
    }

    /// Shut this supervisor down for good
    pub async fn shutdown(&self) {
        self.send(SupervisorCommand::Shutdown).await;
    }

    /// Current configuration pair
    pub async fn snapshot(&self) -> Option<ConfigSnapshot> {
        let (tx, rx) = oneshot::channel();
        if !self.send(SupervisorCommand::Snapshot(tx)).await {
            return None;
        }
        rx.await.ok()
    }

    /// Current status summary
    pub async fn metadata(&self) -> Option<ChildBridgeMetadata> {
        let (tx, rx) = oneshot::channel();
        if !self.send(SupervisorCommand::Metadata(tx)).await {
            return None;
        }
        rx.await.ok()
    }

    async fn send(&self, cmd: SupervisorCommand) -> bool {
        if self.command_tx.send(cmd).await.is_err() {
            self.span.in_scope(|| debug!("Supervisor is gone, command dropped"));
            return false;
        }
        true
    }
}

impl std::fmt::Debug for ChildBridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildBridgeHandle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
