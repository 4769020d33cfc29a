//! Worker runtime
//!
//! Drives the worker half of the handshake over the channel:
//! `ready` -> wait `load` -> create plugin -> `loaded` -> wait `start` -> serve.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use child_bridge::ipc::{ChildMessage, IpcError, IpcReader, IpcWriter, LoadPayload};

use crate::{PluginRegistry, WorkerError};

/// Runs one plugin instance inside a worker process
#[derive(Debug, Clone)]
pub struct WorkerRuntime {
    registry: PluginRegistry,
}

impl WorkerRuntime {
    pub fn new(registry: PluginRegistry) -> Self {
        Self { registry }
    }

    /// Run the handshake and serve until the supervisor closes the channel
    pub async fn run<R, W>(&self, mut reader: IpcReader<R>, mut writer: IpcWriter<W>) -> Result<(), WorkerError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        writer.send(&ChildMessage::Ready).await?;

        let payload = wait_for_load(&mut reader).await?;
        info!(
            "Loading {} '{}' from {}",
            payload.kind,
            payload.identifier,
            payload.plugin_path.display()
        );
        let mut plugin = self.registry.create(&payload)?;
        writer.send(&ChildMessage::Loaded).await?;

        wait_for(&mut reader, ChildMessage::Start).await?;
        info!("Starting bridge '{}'", payload.bridge_config.name);

        let mut closed = tokio::spawn(drain(reader));
        tokio::select! {
            result = plugin.serve() => {
                result?;
                debug!("Plugin finished serving, waiting for channel to close");
                let _ = closed.await;
            }
            _ = &mut closed => {}
        }

        info!("Channel closed, shutting down");
        Ok(())
    }
}

async fn next_message<R: AsyncRead + Unpin>(
    reader: &mut IpcReader<R>,
    expected: &'static str,
) -> Result<ChildMessage, WorkerError> {
    loop {
        match reader.recv().await {
            Ok(Some(msg)) => return Ok(msg),
            Ok(None) => return Err(WorkerError::ChannelClosed(expected)),
            Err(IpcError::Decode(e)) => warn!("Ignoring malformed message: {}", e),
            Err(e) => return Err(e.into()),
        }
    }
}

async fn wait_for_load<R: AsyncRead + Unpin>(reader: &mut IpcReader<R>) -> Result<LoadPayload, WorkerError> {
    loop {
        match next_message(reader, "load").await? {
            ChildMessage::Load(payload) => return Ok(*payload),
            other => debug!("Ignoring '{}' while waiting for load", other.id()),
        }
    }
}

async fn wait_for<R: AsyncRead + Unpin>(reader: &mut IpcReader<R>, wanted: ChildMessage) -> Result<(), WorkerError> {
    loop {
        let msg = next_message(reader, wanted.id()).await?;
        if msg == wanted {
            return Ok(());
        }
        debug!("Ignoring '{}' while waiting for {}", msg.id(), wanted.id());
    }
}

/// Read until the channel closes
async fn drain<R: AsyncRead + Unpin>(mut reader: IpcReader<R>) {
    loop {
        match reader.recv_frame().await {
            Ok(Some(_)) => debug!("Ignoring message after start"),
            Ok(None) => break,
            Err(e) => {
                debug!("Channel read failed: {}", e);
                break;
            }
        }
    }
}
