//! Proxy configuration

use anyhow::{Context, Result};
use multihal_core::constants;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::DirectChannelPolicy;
use crate::power::PowerLockKind;

/// Tunables of the proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Version of the config format
    pub version: u32,
    /// How long the wake lock may stay held without an acknowledgement
    pub wakelock_timeout_ms: u64,
    /// How long the dispatcher waits for room in the client channel
    pub pending_write_timeout_ms: u64,
    /// Events the dispatch queue holds before dropping new ones
    pub max_pending_events: usize,
    /// Name of the platform wake lock
    pub wakelock_name: String,
    pub direct_channel_policy: DirectChannelPolicy,
    pub power_lock: PowerLockKind,
    /// File listing the sub-HALs to load, one name per line
    pub subhal_list_path: PathBuf,
}

impl ProxyConfig {
    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(Self::default());
        }

        Self::load_from_path(&config_path)
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_path()?)
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("org", "multihal", "multihal")
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

        Ok(dirs.config_dir().join("multihal.json"))
    }

    /// Load configuration from a specific file path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific file path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.wakelock_timeout_ms == 0 {
            anyhow::bail!("wakelock_timeout_ms must be greater than 0");
        }
        if self.max_pending_events == 0 {
            anyhow::bail!("max_pending_events must be greater than 0");
        }
        if self.wakelock_name.is_empty() {
            anyhow::bail!("wakelock_name must not be empty");
        }
        Ok(())
    }

    pub fn wakelock_timeout(&self) -> Duration {
        Duration::from_millis(self.wakelock_timeout_ms)
    }

    pub fn pending_write_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_write_timeout_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            version: 1,
            wakelock_timeout_ms: constants::WAKELOCK_TIMEOUT.as_millis() as u64,
            pending_write_timeout_ms: constants::PENDING_WRITE_TIMEOUT.as_millis() as u64,
            max_pending_events: constants::MAX_PENDING_EVENTS,
            wakelock_name: constants::WAKELOCK_NAME.to_string(),
            direct_channel_policy: DirectChannelPolicy::default(),
            power_lock: PowerLockKind::default(),
            subhal_list_path: PathBuf::from(constants::DEFAULT_SUBHAL_LIST_PATH),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("multihal-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.wakelock_timeout(), Duration::from_secs(20));
        assert_eq!(config.pending_write_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_pending_events, 100_000);
        assert_eq!(config.wakelock_name, "SensorsHAL_WAKEUP");
        assert_eq!(config.direct_channel_policy, DirectChannelPolicy::FirstRegistered);
        assert_eq!(config.power_lock, PowerLockKind::Noop);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let path = temp_path("partial");
        std::fs::write(&path, r#"{ "max_pending_events": 64, "power_lock": "sysfs" }"#).unwrap();

        let config = ProxyConfig::load_from_path(&path).unwrap();
        assert_eq!(config.max_pending_events, 64);
        assert_eq!(config.power_lock, PowerLockKind::Sysfs);
        assert_eq!(config.wakelock_timeout_ms, 20_000);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_save_and_reload() {
        let path = temp_path("roundtrip");
        let mut config = ProxyConfig::default();
        config.direct_channel_policy = DirectChannelPolicy::Preferred("motion".into());
        config.save_to_path(&path).unwrap();

        let loaded = ProxyConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded, config);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let path = temp_path("invalid");
        std::fs::write(&path, r#"{ "max_pending_events": 0 }"#).unwrap();

        assert!(ProxyConfig::load_from_path(&path).is_err());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_errors_name_the_file() {
        let missing = temp_path("missing");
        let err = ProxyConfig::load_from_path(&missing).unwrap_err();
        assert!(format!("{:#}", err).contains(&format!("reading {}", missing.display())));

        let path = temp_path("malformed");
        std::fs::write(&path, "{ not json").unwrap();
        let err = ProxyConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{:#}", err).contains(&format!("parsing {}", path.display())));

        std::fs::remove_file(&path).ok();
    }
}
