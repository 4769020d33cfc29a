//! Child Bridge Worker
//!
//! Worker side of the child bridge channel. A worker is launched by the
//! supervisor, announces itself, loads the one plugin instance it was asked
//! for and serves it until the channel closes.

pub mod heartbeat;
pub mod plugin;
pub mod runtime;

pub use plugin::{BridgePlugin, PluginFactory, PluginRegistry};
pub use runtime::WorkerRuntime;

use child_bridge::config::PluginType;
use child_bridge::ipc::IpcError;

/// Errors that end a worker
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Channel error: {0}")]
    Ipc(#[from] IpcError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel closed while waiting for '{0}'")]
    ChannelClosed(&'static str),

    #[error("No {kind} registered as '{identifier}'")]
    UnknownPlugin { kind: PluginType, identifier: String },

    #[error("Plugin error: {0}")]
    Plugin(String),
}
