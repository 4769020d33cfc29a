//! Shared Configuration Document
//!
//! Typed view over the parts of the shared `config.json` that a child bridge
//! reads. Everything else is carried through untouched so the full document
//! can be handed to the worker.

mod store;

pub use store::*;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default HomeKit setup code used when the document omits one
pub const DEFAULT_PIN: &str = "031-45-154";

/// Kind of plugin instance hosted by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Platform,
    Accessory,
}

impl std::fmt::Display for PluginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginType::Platform => write!(f, "platform"),
            PluginType::Accessory => write!(f, "accessory"),
        }
    }
}

/// Identifies which plugin code a worker must load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginIdentity {
    /// Platform or accessory
    pub kind: PluginType,
    /// Registered platform/accessory identifier (e.g. "Heartbeat")
    pub identifier: String,
    /// Plugin's own display identifier (package name)
    pub plugin_name: String,
    /// Resolved path to the plugin's code
    pub plugin_path: PathBuf,
}

impl PluginIdentity {
    pub fn new(
        kind: PluginType,
        identifier: impl Into<String>,
        plugin_name: impl Into<String>,
        plugin_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            plugin_name: plugin_name.into(),
            plugin_path: plugin_path.into(),
        }
    }

    /// Whether a config entry's identifier field refers to this instance.
    ///
    /// Accepts both the bare identifier and the `plugin.Identifier` form.
    pub fn matches_identifier(&self, value: &str) -> bool {
        if value == self.identifier {
            return true;
        }
        value
            .split_once('.')
            .is_some_and(|(plugin, id)| plugin == self.plugin_name && id == self.identifier)
    }
}

/// Interface(s) the HomeKit server binds to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BindAddress {
    One(String),
    Many(Vec<String>),
}

/// Instance-specific bridge block (`_bridge`) inside a platform/accessory entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeOverride {
    /// Stable key correlating this instance with its config entry
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<BindAddress>,
    #[serde(rename = "setupID", default, skip_serializing_if = "Option::is_none")]
    pub setup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BridgeOverride {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            name: None,
            port: None,
            pin: None,
            bind: None,
            setup_id: None,
            manufacturer: None,
            model: None,
            extra: Map::new(),
        }
    }
}

/// Top-level `bridge` block holding the global defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeDefaults {
    #[serde(default = "default_bridge_name")]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default = "default_pin")]
    pub pin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<BindAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_bridge_name() -> String {
    "Homebridge".to_string()
}

fn default_pin() -> String {
    DEFAULT_PIN.to_string()
}

impl Default for BridgeDefaults {
    fn default() -> Self {
        Self {
            name: default_bridge_name(),
            username: String::new(),
            pin: default_pin(),
            port: None,
            bind: None,
            manufacturer: None,
            model: None,
            extra: Map::new(),
        }
    }
}

/// One entry of `platforms[]` or `accessories[]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "_bridge", default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<BridgeOverride>,
    /// Plugin-specific keys, opaque to the supervisor
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PluginConfig {
    /// Type a single raw entry
    pub fn from_entry(entry: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(entry)
    }

    /// Value of the kind-specific identifier field
    pub fn identifier(&self, kind: PluginType) -> Option<&str> {
        match kind {
            PluginType::Platform => self.platform.as_deref(),
            PluginType::Accessory => self.accessory.as_deref(),
        }
    }

    /// Username of the embedded bridge block, if any
    pub fn bridge_username(&self) -> Option<&str> {
        self.bridge.as_ref().map(|b| b.username.as_str())
    }
}

impl PluginType {
    /// Key holding the identifier in a config entry
    pub fn entry_key(&self) -> &'static str {
        match self {
            PluginType::Platform => "platform",
            PluginType::Accessory => "accessory",
        }
    }
}

/// The whole shared configuration document.
///
/// `platforms[]` and `accessories[]` stay raw: an entry is only typed once
/// it has been matched, so another plugin's block never fails the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HomebridgeConfig {
    #[serde(default)]
    pub bridge: BridgeDefaults,
    #[serde(default)]
    pub platforms: Vec<Value>,
    #[serde(default)]
    pub accessories: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HomebridgeConfig {
    /// Raw entries of the given kind
    pub fn entries(&self, kind: PluginType) -> &[Value] {
        match kind {
            PluginType::Platform => &self.platforms,
            PluginType::Accessory => &self.accessories,
        }
    }

    /// Locate the raw entry belonging to one isolated instance.
    ///
    /// Both the identifier field and `_bridge.username` must match.
    pub fn find_entry(&self, identity: &PluginIdentity, username: &str) -> Option<&Value> {
        let key = identity.kind.entry_key();
        self.entries(identity.kind).iter().find(|entry| {
            entry
                .get(key)
                .and_then(Value::as_str)
                .is_some_and(|id| identity.matches_identifier(id))
                && entry
                    .get("_bridge")
                    .and_then(|bridge| bridge.get("username"))
                    .and_then(Value::as_str)
                    == Some(username)
        })
    }

    /// Typed entry for one isolated instance.
    ///
    /// `None` when no entry matches; an error when the matching entry itself
    /// is malformed.
    pub fn find_instance(
        &self,
        identity: &PluginIdentity,
        username: &str,
    ) -> Option<Result<PluginConfig, serde_json::Error>> {
        self.find_entry(identity, username).map(PluginConfig::from_entry)
    }
}
