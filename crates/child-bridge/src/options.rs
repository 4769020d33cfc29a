//! Bridge Options
//!
//! Process-wide flags shared by the parent and every worker. They are fixed
//! for the lifetime of a supervisor and translated once into the worker's
//! argument vector.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Directory name of the default storage location under the home directory
const DEFAULT_STORAGE_DIR: &str = ".homebridge";

/// Process-wide flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeOptions {
    pub debug_mode_enabled: bool,
    pub force_colour_logging: bool,
    pub insecure_access: bool,
    pub no_log_timestamps: bool,
    pub keep_orphaned_cached_accessories: bool,
    #[serde(rename = "hideQRCode")]
    pub hide_qr_code: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_storage_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_plugin_path: Option<PathBuf>,
}

impl BridgeOptions {
    /// Translate the options into worker launch arguments.
    ///
    /// Flags are independent of each other; only presence and the pairing of
    /// path flags with their value matter.
    pub fn process_flags(&self) -> Vec<String> {
        let mut args = Vec::new();

        let switches = [
            (self.debug_mode_enabled, "-D"),
            (self.force_colour_logging, "-C"),
            (self.insecure_access, "-I"),
            (self.no_log_timestamps, "-T"),
            (self.keep_orphaned_cached_accessories, "-K"),
            (self.hide_qr_code, "-Q"),
        ];
        for (enabled, flag) in switches {
            if enabled {
                args.push(flag.to_string());
            }
        }

        if let Some(path) = &self.custom_storage_path {
            args.push("-U".to_string());
            args.push(path.display().to_string());
        }
        if let Some(path) = &self.custom_plugin_path {
            args.push("-P".to_string());
            args.push(path.display().to_string());
        }

        args
    }

    /// Root storage directory
    pub fn storage_path(&self) -> PathBuf {
        self.custom_storage_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(DEFAULT_STORAGE_DIR)
        })
    }

    /// Location of the shared configuration document
    pub fn config_path(&self) -> PathBuf {
        self.storage_path().join("config.json")
    }

    /// Directory holding cached accessory files
    pub fn cached_accessories_dir(&self) -> PathBuf {
        self.storage_path().join("accessories")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_options_no_flags() {
        assert!(BridgeOptions::default().process_flags().is_empty());
    }

    #[test]
    fn test_debug_and_storage_path() {
        let options = BridgeOptions {
            debug_mode_enabled: true,
            custom_storage_path: Some(PathBuf::from("/x")),
            ..Default::default()
        };

        let flags = options.process_flags();
        assert_eq!(flags.len(), 3);
        assert!(flags.contains(&"-D".to_string()));

        let storage = flags.iter().position(|f| f == "-U").unwrap();
        assert_eq!(flags[storage + 1], "/x");
    }

    #[test]
    fn test_every_switch() {
        let options = BridgeOptions {
            debug_mode_enabled: true,
            force_colour_logging: true,
            insecure_access: true,
            no_log_timestamps: true,
            keep_orphaned_cached_accessories: true,
            hide_qr_code: true,
            custom_storage_path: Some(PathBuf::from("/var/lib/hb")),
            custom_plugin_path: Some(PathBuf::from("/opt/plugins")),
        };

        let flags = options.process_flags();
        for flag in ["-D", "-C", "-I", "-T", "-K", "-Q"] {
            assert!(flags.iter().any(|f| f == flag), "missing {flag}");
        }

        let plugins = flags.iter().position(|f| f == "-P").unwrap();
        assert_eq!(flags[plugins + 1], "/opt/plugins");
        assert_eq!(flags.len(), 10);
    }

    #[test]
    fn test_storage_derived_paths() {
        let options = BridgeOptions {
            custom_storage_path: Some(PathBuf::from("/srv/hb")),
            ..Default::default()
        };

        assert_eq!(options.config_path(), PathBuf::from("/srv/hb/config.json"));
        assert_eq!(options.cached_accessories_dir(), PathBuf::from("/srv/hb/accessories"));
    }

    #[test]
    fn test_default_storage_under_home() {
        let path = BridgeOptions::default().storage_path();
        assert!(path.ends_with(DEFAULT_STORAGE_DIR));
    }
}
