//! Load payload assembly
//!
//! Builds the configuration a worker receives in its `load` message by
//! merging the instance's bridge block with the global defaults.

use crate::config::{BridgeDefaults, BridgeOverride, HomebridgeConfig, PluginConfig, PluginIdentity};
use crate::ipc::{BridgeConfiguration, ChildBridgeOptions, LoadPayload};
use crate::options::BridgeOptions;

/// Prefix of the per-bridge cached accessories file
pub const CACHED_ACCESSORIES_PREFIX: &str = "cachedAccessories.";

/// Cache file name for a bridge username: colons stripped, uppercased.
pub fn cached_accessories_item_name(username: &str) -> String {
    let suffix: String = username.chars().filter(|c| *c != ':').collect();
    format!("{}{}", CACHED_ACCESSORIES_PREFIX, suffix.to_uppercase())
}

/// Effective bridge identity for the worker.
///
/// `bind` always comes from the global defaults; it cannot be overridden per
/// instance.
pub fn effective_bridge_config(
    identity: &PluginIdentity,
    plugin_config: &PluginConfig,
    bridge: &BridgeOverride,
    defaults: &BridgeDefaults,
) -> BridgeConfiguration {
    let name = bridge
        .name
        .clone()
        .or_else(|| plugin_config.name.clone())
        .unwrap_or_else(|| identity.plugin_name.clone());

    BridgeConfiguration {
        name,
        port: bridge.port,
        username: bridge.username.clone(),
        pin: bridge.pin.clone().unwrap_or_else(|| defaults.pin.clone()),
        bind: defaults.bind.clone(),
        setup_id: bridge.setup_id.clone(),
        manufacturer: bridge
            .manufacturer
            .clone()
            .or_else(|| defaults.manufacturer.clone()),
        model: bridge.model.clone().or_else(|| defaults.model.clone()),
    }
}

/// Options forwarded to the worker, with a cache location unique to `username`
pub fn worker_options(options: &BridgeOptions, username: &str) -> ChildBridgeOptions {
    ChildBridgeOptions {
        cached_accessories_dir: options.cached_accessories_dir(),
        cached_accessories_item_name: cached_accessories_item_name(username),
        keep_orphaned_cached_accessories: options.keep_orphaned_cached_accessories,
        hide_qr_code: options.hide_qr_code,
        insecure_access: options.insecure_access,
        no_log_timestamps: options.no_log_timestamps,
        debug_mode_enabled: options.debug_mode_enabled,
        force_colour_logging: options.force_colour_logging,
        custom_storage_path: options.custom_storage_path.clone(),
        custom_plugin_path: options.custom_plugin_path.clone(),
    }
}

/// Assemble the complete `load` payload from the current snapshot
pub fn build_load_payload(
    identity: &PluginIdentity,
    plugin_config: &PluginConfig,
    bridge: &BridgeOverride,
    options: &BridgeOptions,
    homebridge_config: &HomebridgeConfig,
) -> LoadPayload {
    let bridge_config = effective_bridge_config(identity, plugin_config, bridge, &homebridge_config.bridge);
    let bridge_options = worker_options(options, &bridge.username);

    LoadPayload {
        kind: identity.kind,
        identifier: identity.identifier.clone(),
        plugin_path: identity.plugin_path.clone(),
        plugin_config: plugin_config.clone(),
        bridge_config,
        bridge_options,
        homebridge_config: homebridge_config.clone(),
    }
}
