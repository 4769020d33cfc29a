//! Child Bridge Supervisor
//!
//! One tokio task per isolated plugin instance. The task owns the worker
//! process, walks it through the `ready` / `load` / `loaded` / `start`
//! handshake and respawns it after a fixed delay whenever it exits, until
//! shutdown is requested.

mod handle;
mod shutdown;

pub use handle::*;
pub use shutdown::*;

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{Sleep, sleep};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{BridgeOverride, ConfigStore, HomebridgeConfig, PluginConfig, PluginIdentity};
use crate::ipc::ChildMessage;
use crate::options::BridgeOptions;
use crate::payload::{build_load_payload, effective_bridge_config};
use crate::process::{Launcher, ProcessHandle, WorkerEvent, WorkerExit};

/// Delay between a worker exit and its respawn
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(7);

const COMMAND_CHANNEL_SIZE: usize = 64;

/// Errors raised while setting up a supervisor
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("{0} config has no _bridge block")]
    MissingBridgeConfig(String),
}

/// Timing knobs for a supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Wait between a worker exit and the next spawn
    pub restart_delay: Duration,
    /// SIGKILL a worker that ignores SIGTERM for this long. `None` never escalates.
    pub termination_grace: Option<Duration>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            restart_delay: DEFAULT_RESTART_DELAY,
            termination_grace: None,
        }
    }
}

impl SupervisorSettings {
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = Some(grace);
        self
    }
}

/// Everything a supervisor is created from
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub identity: PluginIdentity,
    pub plugin_config: PluginConfig,
    pub bridge: BridgeOverride,
    pub homebridge_config: HomebridgeConfig,
    pub options: BridgeOptions,
    pub settings: SupervisorSettings,
}

impl SupervisorConfig {
    /// Build from a plugin entry. The entry must carry a `_bridge` block.
    pub fn new(
        identity: PluginIdentity,
        plugin_config: PluginConfig,
        homebridge_config: HomebridgeConfig,
        options: BridgeOptions,
    ) -> Result<Self, SupervisorError> {
        let bridge = plugin_config
            .bridge
            .clone()
            .ok_or_else(|| SupervisorError::MissingBridgeConfig(identity.identifier.clone()))?;

        Ok(Self {
            identity,
            plugin_config,
            bridge,
            homebridge_config,
            options,
            settings: SupervisorSettings::default(),
        })
    }

    pub fn with_settings(mut self, settings: SupervisorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Display name of the bridge, used to tag log lines
    pub fn display_name(&self) -> String {
        effective_bridge_config(
            &self.identity,
            &self.plugin_config,
            &self.bridge,
            &self.homebridge_config.bridge,
        )
        .name
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor Task
// ─────────────────────────────────────────────────────────────────────────────

/// State owned by one supervisor task
pub struct ChildBridgeSupervisor {
    identity: PluginIdentity,
    plugin_config: PluginConfig,
    bridge: BridgeOverride,
    homebridge_config: HomebridgeConfig,
    options: BridgeOptions,
    settings: SupervisorSettings,
    /// Worker arguments, computed once from the options
    args: Vec<String>,
    launcher: Arc<dyn Launcher>,
    state: watch::Sender<ChildBridgeState>,
    process: Option<ProcessHandle>,
    restart_timer: Option<Pin<Box<Sleep>>>,
    kill_deadline: Option<Pin<Box<Sleep>>>,
    shutting_down: bool,
    manually_stopped: bool,
    restart_count: u32,
    dropped_messages: u32,
    /// Sequence number of the last applied refresh
    applied_refresh: u64,
    last_started_at: Option<DateTime<Utc>>,
}

impl ChildBridgeSupervisor {
    /// Start a supervisor task and return its handle
    pub fn spawn(
        config: SupervisorConfig,
        launcher: Arc<dyn Launcher>,
        store: Arc<dyn ConfigStore>,
        shutdown: ShutdownListener,
    ) -> ChildBridgeHandle {
        let name = config.display_name();
        let span = info_span!("child_bridge", name = %name);

        let (state_tx, state_rx) = watch::channel(ChildBridgeState::Spawning);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        let supervisor = Self {
            args: config.options.process_flags(),
            identity: config.identity,
            plugin_config: config.plugin_config,
            bridge: config.bridge,
            homebridge_config: config.homebridge_config,
            options: config.options,
            settings: config.settings,
            launcher,
            state: state_tx,
            process: None,
            restart_timer: None,
            kill_deadline: None,
            shutting_down: false,
            manually_stopped: false,
            restart_count: 0,
            dropped_messages: 0,
            applied_refresh: 0,
            last_started_at: None,
        };

        tokio::spawn(supervisor.run(command_rx, shutdown).instrument(span.clone()));

        ChildBridgeHandle::new(name, command_tx, state_rx, store, span)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SupervisorCommand>, mut shutdown: ShutdownListener) {
        if shutdown.is_triggered() {
            info!("Shutdown already requested, not starting child bridge");
            self.shutting_down = true;
            self.set_state(ChildBridgeState::Terminated);
        } else {
            self.spawn_worker();
        }

        let mut commands_open = true;
        loop {
            if !commands_open && self.current_state().is_terminal() {
                break;
            }

            tokio::select! {
                _ = shutdown.wait(), if !self.shutting_down => self.request_shutdown(),
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        debug!("All handles dropped");
                        commands_open = false;
                        self.request_shutdown();
                    }
                },
                event = next_worker_event(&mut self.process) => self.handle_worker_event(event),
                _ = wait_timer(&mut self.restart_timer) => {
                    self.restart_timer = None;
                    self.restart_worker();
                }
                _ = wait_timer(&mut self.kill_deadline) => {
                    self.kill_deadline = None;
                    self.escalate();
                }
            }
        }

        debug!("Supervisor stopped");
    }

    fn current_state(&self) -> ChildBridgeState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ChildBridgeState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("State {} -> {}", previous, state);
        }
    }

    // ── Worker lifecycle ────────────────────────────────────────────────────

    fn spawn_worker(&mut self) {
        self.set_state(ChildBridgeState::Spawning);

        match self.launcher.launch(&self.args) {
            Ok(process) => {
                match process.pid() {
                    Some(pid) => info!("Launched child bridge with PID {}", pid),
                    None => info!("Launched child bridge"),
                }
                self.process = Some(process);
                self.last_started_at = Some(Utc::now());
                self.set_state(ChildBridgeState::AwaitingReady);
            }
            Err(e) => {
                error!("Failed to launch child bridge: {}", e);
                self.schedule_restart();
            }
        }
    }

    fn restart_worker(&mut self) {
        if self.shutting_down || self.manually_stopped {
            return;
        }
        self.restart_count += 1;
        self.spawn_worker();
    }

    fn schedule_restart(&mut self) {
        warn!(
            "Restarting child bridge in {} seconds...",
            self.settings.restart_delay.as_secs_f32()
        );
        self.restart_timer = Some(Box::pin(sleep(self.settings.restart_delay)));
        self.set_state(ChildBridgeState::Restarting);
    }

    /// Ask the live worker to exit. Its exit event decides what happens next.
    fn teardown(&mut self) {
        let Some(process) = self.process.as_mut() else {
            return;
        };

        if process.is_connected() {
            process.terminate();
        } else {
            debug!("Channel not connected, not signalling worker");
        }

        if let Some(grace) = self.settings.termination_grace {
            if self.kill_deadline.is_none() {
                self.kill_deadline = Some(Box::pin(sleep(grace)));
            }
        }
    }

    fn escalate(&mut self) {
        if let Some(process) = self.process.as_mut() {
            warn!("Child bridge did not exit in time, killing");
            process.kill();
        }
    }

    fn request_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.restart_timer = None;

        if self.process.is_some() {
            info!("Shutting down child bridge");
            self.teardown();
        } else {
            self.set_state(ChildBridgeState::Terminated);
        }
    }

    // ── Worker events ───────────────────────────────────────────────────────

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Message(msg) => self.handle_message(msg),
            WorkerEvent::Malformed(e) => debug!("Ignoring malformed message from child bridge: {}", e),
            WorkerEvent::Exited(exit) => self.handle_exit(exit),
        }
    }

    fn handle_message(&mut self, msg: ChildMessage) {
        match (self.current_state(), msg) {
            (ChildBridgeState::AwaitingReady, ChildMessage::Ready) => self.load_worker(),
            (ChildBridgeState::Loading, ChildMessage::Loaded) => self.start_worker(),
            (state, msg) => debug!("Ignoring '{}' message while {}", msg.id(), state),
        }
    }

    fn load_worker(&mut self) {
        let payload = build_load_payload(
            &self.identity,
            &self.plugin_config,
            &self.bridge,
            &self.options,
            &self.homebridge_config,
        );
        self.set_state(ChildBridgeState::Loading);
        self.send_to_worker(ChildMessage::Load(Box::new(payload)));
    }

    fn start_worker(&mut self) {
        self.set_state(ChildBridgeState::Active);
        self.send_to_worker(ChildMessage::Start);
        info!("Child bridge started");
    }

    /// Best effort: a message the channel cannot take is counted and dropped
    fn send_to_worker(&mut self, msg: ChildMessage) {
        let delivered = self.process.as_ref().is_some_and(|process| process.send(msg));
        if !delivered {
            self.dropped_messages += 1;
        }
    }

    fn handle_exit(&mut self, exit: WorkerExit) {
        self.process = None;
        self.kill_deadline = None;

        if self.shutting_down {
            info!("Child bridge process ended ({})", exit);
            self.set_state(ChildBridgeState::Terminated);
        } else if self.manually_stopped {
            info!("Child bridge stopped ({})", exit);
            self.set_state(ChildBridgeState::Stopped);
        } else {
            warn!("Child bridge process ended ({})", exit);
            self.schedule_restart();
        }
    }

    // ── Commands ────────────────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::ApplyConfig { document, seq, reply } => {
                if seq > self.applied_refresh {
                    self.applied_refresh = seq;
                    self.apply_config(&document);
                } else {
                    debug!("Ignoring config read {}, read {} already applied", seq, self.applied_refresh);
                }
                let _ = reply.send(());
            }
            SupervisorCommand::Restart => self.restart(),
            SupervisorCommand::Stop => self.stop(),
            SupervisorCommand::Start => self.start(),
            SupervisorCommand::Shutdown => self.request_shutdown(),
            SupervisorCommand::Snapshot(reply) => {
                let _ = reply.send(ConfigSnapshot {
                    plugin_config: self.plugin_config.clone(),
                    bridge: self.bridge.clone(),
                });
            }
            SupervisorCommand::Metadata(reply) => {
                let _ = reply.send(self.metadata());
            }
        }
    }

    /// Swap in this instance's entry from a freshly read document
    fn apply_config(&mut self, document: &HomebridgeConfig) {
        let kind = self.identity.kind;
        match document.find_instance(&self.identity, &self.bridge.username) {
            Some(Ok(entry)) => {
                if let Some(bridge) = &entry.bridge {
                    self.bridge = bridge.clone();
                }
                self.plugin_config = entry;
                info!("Refreshed {} config", kind);
            }
            Some(Err(e)) => warn!("Invalid {} config for child bridge, using existing config: {}", kind, e),
            None => warn!("Could not find {} config for child bridge, using existing config", kind),
        }
    }

    fn restart(&mut self) {
        if self.shutting_down {
            return;
        }
        if self.manually_stopped {
            info!("Child bridge was stopped manually, not restarting");
            return;
        }
        if self.process.is_some() {
            self.teardown();
        } else {
            debug!("No worker running, restart already pending");
        }
    }

    fn stop(&mut self) {
        if self.shutting_down || self.manually_stopped {
            return;
        }
        info!("Stopping child bridge");
        self.manually_stopped = true;
        self.restart_timer = None;

        if self.process.is_some() {
            self.teardown();
        } else {
            self.set_state(ChildBridgeState::Stopped);
        }
    }

    fn start(&mut self) {
        if self.shutting_down {
            warn!("Child bridge is shutting down, not starting");
            return;
        }
        if !self.manually_stopped {
            debug!("Child bridge was not stopped");
            return;
        }
        info!("Starting child bridge");
        self.manually_stopped = false;

        if self.process.is_none() {
            self.spawn_worker();
        }
    }

    fn metadata(&self) -> ChildBridgeMetadata {
        ChildBridgeMetadata {
            status: self.current_state(),
            pid: self.process.as_ref().and_then(|p| p.pid()),
            name: effective_bridge_config(
                &self.identity,
                &self.plugin_config,
                &self.bridge,
                &self.homebridge_config.bridge,
            )
            .name,
            username: self.bridge.username.clone(),
            identifier: self.identity.identifier.clone(),
            plugin: self.identity.plugin_name.clone(),
            kind: self.identity.kind,
            restart_count: self.restart_count,
            dropped_messages: self.dropped_messages,
            manually_stopped: self.manually_stopped,
            shutting_down: self.shutting_down,
            last_started_at: self.last_started_at,
        }
    }
}

async fn next_worker_event(process: &mut Option<ProcessHandle>) -> WorkerEvent {
    match process.as_mut() {
        Some(process) => process.next_event().await,
        None => pending().await,
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}
