//! IPC protocol for communicating with child bridge workers
//!
//! Every message is a JSON envelope `{ "id": ..., "data": ... }` framed as
//! `[length: 4 bytes BE][json: length bytes]`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{BindAddress, HomebridgeConfig, PluginConfig, PluginType};

/// Largest frame either side will accept
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors on the message channel
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("IPC I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

/// Handshake messages exchanged with a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", content = "data", rename_all = "camelCase")]
pub enum ChildMessage {
    /// Worker → supervisor: bootstrap complete, awaiting load
    Ready,
    /// Supervisor → worker: load and instantiate the named plugin
    Load(Box<LoadPayload>),
    /// Worker → supervisor: plugin instantiated
    Loaded,
    /// Supervisor → worker: begin serving
    Start,
}

impl ChildMessage {
    /// Wire id of this message
    pub fn id(&self) -> &'static str {
        match self {
            ChildMessage::Ready => "ready",
            ChildMessage::Load(_) => "load",
            ChildMessage::Loaded => "loaded",
            ChildMessage::Start => "start",
        }
    }
}

/// Payload of the `load` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadPayload {
    #[serde(rename = "type")]
    pub kind: PluginType,
    pub identifier: String,
    pub plugin_path: PathBuf,
    pub plugin_config: PluginConfig,
    pub bridge_config: BridgeConfiguration,
    pub bridge_options: ChildBridgeOptions,
    pub homebridge_config: HomebridgeConfig,
}

/// Effective HomeKit bridge identity for one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfiguration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub username: String,
    pub pin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<BindAddress>,
    #[serde(rename = "setupID", default, skip_serializing_if = "Option::is_none")]
    pub setup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Effective options handed to the worker at load time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildBridgeOptions {
    pub cached_accessories_dir: PathBuf,
    pub cached_accessories_item_name: String,
    pub keep_orphaned_cached_accessories: bool,
    #[serde(rename = "hideQRCode")]
    pub hide_qr_code: bool,
    pub insecure_access: bool,
    pub no_log_timestamps: bool,
    pub debug_mode_enabled: bool,
    pub force_colour_logging: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_storage_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_plugin_path: Option<PathBuf>,
}

/// Decode one frame body. Anything other than the four known envelopes is an error.
pub fn decode(frame: &[u8]) -> Result<ChildMessage, IpcError> {
    Ok(serde_json::from_slice(frame)?)
}

/// Encode a message into a frame body
pub fn encode(msg: &ChildMessage) -> Result<Vec<u8>, IpcError> {
    Ok(serde_json::to_vec(msg)?)
}

/// IPC writer for sending framed messages
pub struct IpcWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> IpcWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send a message
    pub async fn send(&mut self, msg: &ChildMessage) -> Result<(), IpcError> {
        let payload = encode(msg)?;
        self.send_frame(&payload).await
    }

    /// Send an already encoded frame body
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), IpcError> {
        if payload.is_empty() {
            return Err(IpcError::EmptyFrame);
        }
        if payload.len() > MAX_FRAME_LEN {
            return Err(IpcError::FrameTooLarge(payload.len()));
        }

        let len = payload.len() as u32;
        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(payload).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// IPC reader for receiving framed messages
pub struct IpcReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> IpcReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive one raw frame body. `Ok(None)` on clean EOF.
    pub async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, IpcError> {
        // Read length (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Err(IpcError::EmptyFrame);
        }
        if len > MAX_FRAME_LEN {
            return Err(IpcError::FrameTooLarge(len));
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }

    /// Receive and decode one message
    pub async fn recv(&mut self) -> Result<Option<ChildMessage>, IpcError> {
        match self.recv_frame().await? {
            Some(frame) => decode(&frame).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unit_messages_on_the_wire() {
        assert_eq!(serde_json::to_value(ChildMessage::Ready).unwrap(), json!({"id": "ready"}));
        assert_eq!(serde_json::to_value(ChildMessage::Start).unwrap(), json!({"id": "start"}));
        assert_eq!(decode(br#"{"id":"loaded"}"#).unwrap(), ChildMessage::Loaded);
    }

    #[test]
    fn test_load_payload_field_names() {
        let payload = LoadPayload {
            kind: PluginType::Accessory,
            identifier: "Switch".into(),
            plugin_path: PathBuf::from("/plugins/switch"),
            plugin_config: PluginConfig::default(),
            bridge_config: BridgeConfiguration {
                name: "Lamp".into(),
                port: Some(51000),
                username: "AA:BB:CC:DD:EE:FF".into(),
                pin: "031-45-154".into(),
                bind: None,
                setup_id: Some("ABCD".into()),
                manufacturer: None,
                model: None,
            },
            bridge_options: ChildBridgeOptions {
                cached_accessories_dir: PathBuf::from("/hb/accessories"),
                cached_accessories_item_name: "cachedAccessories.AABBCCDDEEFF".into(),
                keep_orphaned_cached_accessories: false,
                hide_qr_code: true,
                insecure_access: false,
                no_log_timestamps: false,
                debug_mode_enabled: false,
                force_colour_logging: false,
                custom_storage_path: None,
                custom_plugin_path: None,
            },
            homebridge_config: HomebridgeConfig::default(),
        };

        let value = serde_json::to_value(ChildMessage::Load(Box::new(payload))).unwrap();
        assert_eq!(value["id"], "load");

        let data = &value["data"];
        assert_eq!(data["type"], "accessory");
        assert_eq!(data["pluginPath"], "/plugins/switch");
        assert_eq!(data["bridgeConfig"]["setupID"], "ABCD");
        assert_eq!(data["bridgeOptions"]["hideQRCode"], true);
        assert_eq!(
            data["bridgeOptions"]["cachedAccessoriesItemName"],
            "cachedAccessories.AABBCCDDEEFF"
        );
        assert!(data["homebridgeConfig"].is_object());
    }

    #[test]
    fn test_malformed_messages_rejected() {
        assert!(decode(b"[1,2,3]").is_err());
        assert!(decode(b"\"ready\"").is_err());
        assert!(decode(br#"{"data":{}}"#).is_err());
        assert!(decode(br#"{"id":"reboot"}"#).is_err());
        assert!(decode(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_frames_across_a_pipe() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = IpcWriter::new(client);
        let mut reader = IpcReader::new(server);

        writer.send(&ChildMessage::Ready).await.unwrap();
        writer.send_frame(br#"{"id":"bogus"}"#).await.unwrap();
        writer.send(&ChildMessage::Loaded).await.unwrap();
        drop(writer);

        assert_eq!(reader.recv().await.unwrap(), Some(ChildMessage::Ready));
        assert!(matches!(reader.recv().await, Err(IpcError::Decode(_))));
        assert_eq!(reader.recv().await.unwrap(), Some(ChildMessage::Loaded));
        assert_eq!(reader.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = IpcReader::new(server);

        client.write_all(&0u32.to_be_bytes()).await.unwrap();
        assert!(matches!(reader.recv_frame().await, Err(IpcError::EmptyFrame)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = IpcReader::new(server);

        let len = (MAX_FRAME_LEN + 1) as u32;
        client.write_all(&len.to_be_bytes()).await.unwrap();
        assert!(matches!(reader.recv_frame().await, Err(IpcError::FrameTooLarge(_))));
    }
}
