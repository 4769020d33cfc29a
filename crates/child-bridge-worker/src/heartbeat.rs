//! Heartbeat platform
//!
//! Built-in platform that writes a heartbeat line to stdout on a fixed
//! interval. Useful for checking that a child bridge is alive and that its
//! output reaches the parent.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use child_bridge::config::PluginType;
use child_bridge::ipc::LoadPayload;

use crate::{BridgePlugin, PluginRegistry, WorkerError};

pub const IDENTIFIER: &str = "Heartbeat";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

pub fn register(registry: &mut PluginRegistry) {
    registry.register(
        PluginType::Platform,
        IDENTIFIER,
        |payload: &LoadPayload| -> Result<Box<dyn BridgePlugin>, WorkerError> {
            Ok(Box::new(Heartbeat::from_payload(payload)))
        },
    );
}

#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    name: String,
    interval: Duration,
}

impl Heartbeat {
    /// Reads `interval` (seconds) from the plugin config
    pub fn from_payload(payload: &LoadPayload) -> Self {
        let interval = payload
            .plugin_config
            .extra
            .get("interval")
            .and_then(|v| v.as_f64())
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|interval| !interval.is_zero())
            .unwrap_or(DEFAULT_INTERVAL);

        Self {
            name: payload.bridge_config.name.clone(),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn line(&self, beat: u64) -> String {
        format!("[{}] heartbeat {}\n", self.name, beat)
    }
}

#[async_trait]
impl BridgePlugin for Heartbeat {
    async fn serve(&mut self) -> Result<(), WorkerError> {
        let mut stdout = tokio::io::stdout();
        let mut ticker = tokio::time::interval(self.interval);
        let mut beat = 0u64;

        loop {
            ticker.tick().await;
            beat += 1;
            stdout.write_all(self.line(beat).as_bytes()).await?;
            stdout.flush().await?;
        }
    }
}
