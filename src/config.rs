//! Configuration management for blockctl.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ControlError;

/// Upper bound for `ipset.max_batch_size`
const MAX_BATCH_SIZE_LIMIT: usize = 100_000;

/// Parse a duration like "500ms", "10s" or "2m".
///
/// Requires ASCII-only input to prevent Unicode-related edge cases.
pub fn parse_duration(value: &str) -> Option<Duration> {
    if !value.is_ascii() || value.len() < 2 {
        return None;
    }

    let (num_part, unit_ms) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped, 1u64)
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped, 1_000u64)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped, 60_000u64)
    } else {
        return None;
    };

    let n = num_part.parse::<u64>().ok()?;
    n.checked_mul(unit_ms).map(Duration::from_millis)
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Debounce window after the last queued rule ("10s")
    pub debounce: String,

    /// Prefix privileged commands with sudo instead of requiring root
    pub use_sudo: bool,

    /// Baseline setup script run by `start_initialization`
    pub setup_script: PathBuf,

    /// Hard timeout for the setup script
    pub setup_timeout: String,

    /// Advisory lock file for the daemon
    pub lock_file: PathBuf,

    pub ipset: IpsetConfig,

    pub iptables: IptablesConfig,

    pub hostset: HostsetConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            debounce: "10s".to_string(),
            use_sudo: false,
            setup_script: PathBuf::from("/usr/lib/blockctl/install_iptables_setup.sh"),
            setup_timeout: "10s".to_string(),
            lock_file: PathBuf::from("/run/blockctl.lock"),
            ipset: IpsetConfig::default(),
            iptables: IptablesConfig::default(),
            hostset: HostsetConfig::default(),
        }
    }
}

/// Set engine (ipset) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpsetConfig {
    pub binary: String,
    pub max_batch_size: usize,
    pub max_retries: usize,
    pub list_timeout: String,
    /// Limit for one `ipset restore` submission
    pub restore_timeout: String,
}

impl Default for IpsetConfig {
    fn default() -> Self {
        Self {
            binary: "ipset".to_string(),
            max_batch_size: 2000,
            max_retries: 10,
            list_timeout: "10s".to_string(),
            restore_timeout: "30s".to_string(),
        }
    }
}

/// Packet-filter rule controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IptablesConfig {
    pub enabled: bool,
    pub command_timeout: String,
}

impl Default for IptablesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command_timeout: "30s".to_string(),
        }
    }
}

/// Kernel TLS hostset settings (platform capabilities included)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostsetConfig {
    /// Base of `<base>/<module>/hostset/<set>`
    pub base_path: PathBuf,
    /// Platform ships the TCP matching module (xt_tls)
    pub tcp_supported: bool,
    /// Platform ships the UDP matching module (xt_udp_tls)
    pub udp_supported: bool,
}

impl Default for HostsetConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/proc/net"),
            tcp_supported: true,
            udp_supported: false,
        }
    }
}

impl ControlConfig {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: ControlConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            tracing::info!("No config at {:?}, using defaults", path.as_ref());
            Ok(Self::default())
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ControlError> {
        for (name, value) in [
            ("debounce", &self.debounce),
            ("setup_timeout", &self.setup_timeout),
            ("ipset.list_timeout", &self.ipset.list_timeout),
            ("ipset.restore_timeout", &self.ipset.restore_timeout),
            ("iptables.command_timeout", &self.iptables.command_timeout),
        ] {
            match parse_duration(value) {
                Some(d) if !d.is_zero() => {}
                _ => {
                    return Err(ControlError::Config(format!(
                        "Invalid {} '{}'. Use format like '500ms', '10s', '1m'",
                        name, value
                    )))
                }
            }
        }

        if self.ipset.binary.trim().is_empty() {
            return Err(ControlError::Config("ipset.binary must not be empty".to_string()));
        }

        if self.ipset.max_batch_size == 0 || self.ipset.max_batch_size > MAX_BATCH_SIZE_LIMIT {
            return Err(ControlError::Config(format!(
                "ipset.max_batch_size must be between 1 and {}",
                MAX_BATCH_SIZE_LIMIT
            )));
        }

        if self.ipset.max_retries == 0 {
            return Err(ControlError::Config("ipset.max_retries must be at least 1".to_string()));
        }

        Ok(())
    }

    /// Save configuration to YAML file atomically
    ///
    /// Uses tempfile + rename pattern to prevent corruption on crash.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let path = path.as_ref();
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        let parent_dir = path.parent().unwrap_or(Path::new("/etc/blockctl"));
        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .context("Failed to create temporary file for config")?;
        temp_file.write_all(content.as_bytes())?;
        temp_file.as_file().sync_all()?;
        temp_file
            .persist(path)
            .with_context(|| format!("Failed to persist config to {:?}", path))?;
        Ok(())
    }

    pub fn debounce_window(&self) -> Duration {
        parse_duration(&self.debounce).unwrap_or(Duration::from_secs(10))
    }

    pub fn setup_timeout(&self) -> Duration {
        parse_duration(&self.setup_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn ipset_list_timeout(&self) -> Duration {
        parse_duration(&self.ipset.list_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn ipset_restore_timeout(&self) -> Duration {
        parse_duration(&self.ipset.restore_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn iptables_timeout(&self) -> Duration {
        parse_duration(&self.iptables.command_timeout).unwrap_or(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("0s"), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("10h"), None);
        assert_eq!(parse_duration("-1s"), None);
        assert_eq!(parse_duration("１0s"), None);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ControlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.debounce_window(), Duration::from_secs(10));
        assert_eq!(config.setup_timeout(), Duration::from_secs(10));
        assert_eq!(config.ipset.max_batch_size, 2000);
        assert_eq!(config.ipset.max_retries, 10);
        assert_eq!(config.ipset_restore_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_bad_restore_timeout() {
        let mut config = ControlConfig::default();
        config.ipset.restore_timeout = "soon".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ipset.restore_timeout"));
    }

    #[test]
    fn test_validate_rejects_zero_debounce() {
        let config = ControlConfig {
            debounce: "0s".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ControlError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_batch_size() {
        let mut config = ControlConfig::default();
        config.ipset.max_batch_size = 0;
        assert!(config.validate().is_err());

        config.ipset.max_batch_size = MAX_BATCH_SIZE_LIMIT + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_retries() {
        let mut config = ControlConfig::default();
        config.ipset.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "debounce: 2s\nhostset:\n  udp_supported: true\n";
        let config: ControlConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.debounce_window(), Duration::from_secs(2));
        assert!(config.hostset.udp_supported);
        assert!(config.hostset.tcp_supported);
        assert_eq!(config.hostset.base_path, PathBuf::from("/proc/net"));
        assert_eq!(config.ipset.binary, "ipset");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");

        let mut config = ControlConfig::default();
        config.use_sudo = true;
        config.ipset.max_batch_size = 500;
        config.save(&path).unwrap();

        let loaded = ControlConfig::load(&path).unwrap();
        assert!(loaded.use_sudo);
        assert_eq!(loaded.ipset.max_batch_size, 500);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        std::fs::write(&path, "debounce: soon\n").unwrap();

        assert!(ControlConfig::load(&path).is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = ControlConfig::load_or_default("/nonexistent/blockctl.yaml").unwrap();
        assert_eq!(config.debounce, "10s");
    }
}
