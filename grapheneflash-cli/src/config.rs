//! Configuration file support for grapheneflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (GRAPHENEFLASH_*)
//! 3. Local config file (./grapheneflash.toml)
//! 4. Global config file (~/.config/grapheneflash/config.toml)

use directories::ProjectDirs;
use grapheneflash::{FlashTimeouts, PollConfig};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-directory config file.
pub const LOCAL_CONFIG_FILE: &str = "grapheneflash.toml";

/// Host tool locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolsConfig {
    /// Path to `adb`.
    pub adb: Option<PathBuf>,
    /// Path to `fastboot`.
    pub fastboot: Option<PathBuf>,
}

/// Device selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Preferred device serial.
    pub serial: Option<String>,
}

/// Bundle store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundlesConfig {
    /// Directory holding `<codename>/<version>/` bundles.
    pub root: Option<PathBuf>,
}

/// Flash defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlashConfig {
    /// Never query or unlock the bootloader.
    #[serde(default)]
    pub skip_unlock: bool,
    /// Relock the bootloader after flashing.
    #[serde(default)]
    pub lock_bootloader: bool,
    /// Compare the device product with the codename before writing.
    pub verify_codename: Option<bool>,
}

/// Overrides for the state machine bounds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutsConfig {
    /// Bootloader entry and reconnect after reboots.
    pub fastboot_secs: Option<u64>,
    /// Fastbootd entry.
    pub fastbootd_secs: Option<u64>,
    /// User confirmation of the unlock.
    pub unlock_secs: Option<u64>,
    /// Interval between device presence checks.
    pub poll_interval_ms: Option<u64>,
    /// Pause after `reboot-bootloader`.
    pub reboot_settle_secs: Option<u64>,
}

impl TimeoutsConfig {
    /// Apply the configured overrides on top of `timeouts`.
    pub fn apply(&self, mut timeouts: FlashTimeouts) -> FlashTimeouts {
        if let Some(secs) = self.fastboot_secs {
            timeouts.fastboot_entry = Duration::from_secs(secs);
            timeouts.reboot_reconnect = Duration::from_secs(secs);
        }
        if let Some(secs) = self.fastbootd_secs {
            timeouts.fastbootd_entry = Duration::from_secs(secs);
        }
        if let Some(secs) = self.unlock_secs {
            timeouts.unlock_confirm = Duration::from_secs(secs);
        }
        if let Some(secs) = self.reboot_settle_secs {
            timeouts.reboot_settle = Duration::from_secs(secs);
        }
        timeouts
    }

    /// Presence polling used by the process transport.
    pub fn poll_config(&self) -> PollConfig {
        let poll = PollConfig::default();
        match self.poll_interval_ms {
            Some(ms) => poll.with_interval(Duration::from_millis(ms)),
            None => poll,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Host tools.
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Device selection.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Bundle store.
    #[serde(default)]
    pub bundles: BundlesConfig,
    /// Flash defaults.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Timeout overrides.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "grapheneflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Bundle store used when neither the CLI nor a config file names one.
    pub fn default_bundles_root() -> PathBuf {
        ProjectDirs::from("", "", "grapheneflash").map_or_else(
            || PathBuf::from("bundles"),
            |dirs| dirs.data_dir().join("bundles"),
        )
    }

    /// Bundle store after applying the config file.
    pub fn bundles_root(&self) -> PathBuf {
        self.bundles
            .root
            .clone()
            .unwrap_or_else(Self::default_bundles_root)
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.tools.adb.is_some() {
            self.tools.adb = other.tools.adb;
        }
        if other.tools.fastboot.is_some() {
            self.tools.fastboot = other.tools.fastboot;
        }

        if other.device.serial.is_some() {
            self.device.serial = other.device.serial;
        }

        if other.bundles.root.is_some() {
            self.bundles.root = other.bundles.root;
        }

        if other.flash.skip_unlock {
            self.flash.skip_unlock = true;
        }
        if other.flash.lock_bootloader {
            self.flash.lock_bootloader = true;
        }
        if other.flash.verify_codename.is_some() {
            self.flash.verify_codename = other.flash.verify_codename;
        }

        let timeouts = other.timeouts;
        if timeouts.fastboot_secs.is_some() {
            self.timeouts.fastboot_secs = timeouts.fastboot_secs;
        }
        if timeouts.fastbootd_secs.is_some() {
            self.timeouts.fastbootd_secs = timeouts.fastbootd_secs;
        }
        if timeouts.unlock_secs.is_some() {
            self.timeouts.unlock_secs = timeouts.unlock_secs;
        }
        if timeouts.poll_interval_ms.is_some() {
            self.timeouts.poll_interval_ms = timeouts.poll_interval_ms;
        }
        if timeouts.reboot_settle_secs.is_some() {
            self.timeouts.reboot_settle_secs = timeouts.reboot_settle_secs;
        }
    }

    /// Where a remembered serial is written: the local file when one exists,
    /// otherwise the global config.
    fn remember_path() -> anyhow::Result<PathBuf> {
        let local = Path::new(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Ok(local.to_path_buf());
        }
        match Self::global_config_dir() {
            Some(dir) => {
                fs::create_dir_all(&dir)?;
                Ok(dir.join("config.toml"))
            },
            None => Ok(local.to_path_buf()),
        }
    }

    /// Save `serial` as the preferred device.
    pub fn remember_serial(&mut self, serial: &str) -> anyhow::Result<()> {
        let path = Self::remember_path()?;
        self.save_serial_to(&path, serial)?;
        info!("Saved device serial to {}", path.display());
        Ok(())
    }

    fn save_serial_to(&mut self, path: &Path, serial: &str) -> anyhow::Result<()> {
        // Rewrite only the file being updated, not the merged view.
        let mut on_disk = Self::load_from_file(path).unwrap_or_default();
        on_disk.device.serial = Some(serial.to_string());

        let content = toml::to_string_pretty(&on_disk)?;
        fs::write(path, content)?;

        self.device.serial = Some(serial.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_empty() {
        let config = Config::default();
        assert!(config.tools.adb.is_none());
        assert!(config.device.serial.is_none());
        assert!(config.bundles.root.is_none());
        assert!(!config.flash.skip_unlock);
        assert!(!config.flash.lock_bootloader);
        assert!(config.flash.verify_codename.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let content = r#"
            [tools]
            adb = "/opt/platform-tools/adb"
            fastboot = "/opt/platform-tools/fastboot"

            [device]
            serial = "28A1KXYZ"

            [bundles]
            root = "/srv/bundles"

            [flash]
            skip_unlock = true
            verify_codename = false

            [timeouts]
            fastboot_secs = 120
            poll_interval_ms = 500
        "#;

        let config: Config = toml::from_str(content).unwrap();
        assert_eq!(
            config.tools.fastboot.as_deref(),
            Some(Path::new("/opt/platform-tools/fastboot"))
        );
        assert_eq!(config.device.serial.as_deref(), Some("28A1KXYZ"));
        assert_eq!(config.bundles_root(), PathBuf::from("/srv/bundles"));
        assert!(config.flash.skip_unlock);
        assert!(!config.flash.lock_bootloader);
        assert_eq!(config.flash.verify_codename, Some(false));
        assert_eq!(config.timeouts.fastboot_secs, Some(120));
    }

    #[test]
    fn test_parse_partial_config() {
        let config: Config = toml::from_str("[device]\nserial = \"abc\"\n").unwrap();
        assert_eq!(config.device.serial.as_deref(), Some("abc"));
        assert_eq!(config.flash, FlashConfig::default());
        assert_eq!(config.timeouts, TimeoutsConfig::default());
    }

    #[test]
    fn test_merge_overrides_set_fields_only() {
        let mut base = Config::default();
        base.tools.adb = Some(PathBuf::from("/usr/bin/adb"));
        base.device.serial = Some("global".to_string());
        base.timeouts.unlock_secs = Some(600);

        let mut local = Config::default();
        local.device.serial = Some("local".to_string());
        local.flash.lock_bootloader = true;
        local.timeouts.fastbootd_secs = Some(30);

        base.merge(local);

        assert_eq!(base.tools.adb, Some(PathBuf::from("/usr/bin/adb")));
        assert_eq!(base.device.serial.as_deref(), Some("local"));
        assert!(base.flash.lock_bootloader);
        assert_eq!(base.timeouts.unlock_secs, Some(600));
        assert_eq!(base.timeouts.fastbootd_secs, Some(30));
    }

    #[test]
    fn test_merge_keeps_verify_codename_unless_set() {
        let mut base = Config::default();
        base.flash.verify_codename = Some(false);
        base.merge(Config::default());
        assert_eq!(base.flash.verify_codename, Some(false));
    }

    #[test]
    fn test_timeouts_apply() {
        let overrides = TimeoutsConfig {
            fastboot_secs: Some(10),
            unlock_secs: Some(20),
            reboot_settle_secs: Some(0),
            ..Default::default()
        };
        let defaults = FlashTimeouts::default();
        let timeouts = overrides.apply(defaults);

        assert_eq!(timeouts.fastboot_entry, Duration::from_secs(10));
        assert_eq!(timeouts.reboot_reconnect, Duration::from_secs(10));
        assert_eq!(timeouts.unlock_confirm, Duration::from_secs(20));
        assert_eq!(timeouts.reboot_settle, Duration::ZERO);
        assert_eq!(timeouts.fastbootd_entry, defaults.fastbootd_entry);
        assert_eq!(timeouts.super_flash, defaults.super_flash);
    }

    #[test]
    fn test_poll_config_interval() {
        let overrides = TimeoutsConfig {
            poll_interval_ms: Some(250),
            ..Default::default()
        };
        assert_eq!(overrides.poll_config().interval, Duration::from_millis(250));
        assert_eq!(TimeoutsConfig::default().poll_config(), PollConfig::default());
    }

    #[test]
    fn test_load_from_path_reads_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[bundles]\nroot = \"/data/bundles\"\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.bundles.root, Some(PathBuf::from("/data/bundles")));
    }

    #[test]
    fn test_load_from_path_invalid_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[device\nserial = ").unwrap();

        assert_eq!(Config::load_from_path(&path), Config::default());
    }

    #[test]
    fn test_load_from_path_missing_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let config = Config::load_from_path(&dir.path().join("absent.toml"));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_serial_preserves_other_settings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LOCAL_CONFIG_FILE);
        fs::write(&path, "[flash]\nlock_bootloader = true\n").unwrap();

        let mut config = Config::default();
        config.save_serial_to(&path, "28A1KXYZ").unwrap();

        let written = Config::load_from_path(&path);
        assert_eq!(written.device.serial.as_deref(), Some("28A1KXYZ"));
        assert!(written.flash.lock_bootloader);
        assert_eq!(config.device.serial.as_deref(), Some("28A1KXYZ"));
    }

    #[test]
    fn test_global_config_path_name() {
        if let Some(path) = Config::global_config_path() {
            assert!(path.ends_with("config.toml"));
        }
    }

    #[test]
    fn test_default_bundles_root_ends_with_bundles() {
        assert!(Config::default_bundles_root().ends_with("bundles"));
    }
}
