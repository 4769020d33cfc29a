//! Child Bridge - process-isolated plugin instances
//!
//! This crate runs selected plugin instances in their own worker process,
//! each serving as an independent HomeKit bridge:
//! - Shared configuration document and per-instance overrides
//! - Length-prefixed JSON message channel to the worker
//! - Worker process handle and launcher
//! - Per-instance supervisor with handshake, restart and shutdown

// Shared configuration document
pub mod config;

// Process-wide flags
pub mod options;

// Message channel
pub mod ipc;

// Load payload assembly
pub mod payload;

// Worker processes
pub mod process;

// Lifecycle supervision
pub mod supervisor;

pub use config::{ConfigStore, HomebridgeConfig, JsonFileStore, PluginConfig, PluginIdentity, PluginType};
pub use ipc::ChildMessage;
pub use options::BridgeOptions;
pub use supervisor::{
    ChildBridgeHandle, ChildBridgeState, ChildBridgeSupervisor, ShutdownSignal, SupervisorConfig,
    SupervisorSettings,
};
