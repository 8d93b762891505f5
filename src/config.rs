//! Driver configuration.
//!
//! This module handles the on-disk driver configuration: where state, logs
//! and persistent definitions live, which VMM binary to launch, and how
//! named networks map onto host bridges.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for per-user directories.
const APP_NAME: &str = "chvirt";

/// Name of the configuration file inside the config directory.
pub const CONFIG_FILE_NAME: &str = "ch.conf";

/// Default VMM executable, resolved through PATH.
pub const DEFAULT_EMULATOR: &str = "cloud-hypervisor";

/// Default cgroup v2 mount point.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriverConfig {
    /// Configuration format version.
    pub version: u8,

    /// Whether the driver runs privileged (`ch:///system`).
    pub privileged: bool,

    /// Runtime state: sockets, FIFOs, pidfiles, status documents.
    pub state_dir: PathBuf,

    /// Per-domain VMM and event logs.
    pub log_dir: PathBuf,

    /// Persistent domain definitions.
    pub config_dir: PathBuf,

    /// Autostart symlinks.
    pub autostart_dir: PathBuf,

    /// Default VMM binary when a definition has no `emulator`.
    pub emulator: String,

    /// cgroup v2 mount point.
    pub cgroup_root: PathBuf,

    /// Controllers to use; empty means detect from the hierarchy.
    pub cgroup_controllers: Vec<String>,

    /// Prefix event log lines with a timestamp.
    pub log_timestamp: bool,

    /// Install ebtables allow-in rules for guest MACs.
    pub mac_filter: bool,

    /// The driver owns the FDB of network bridges: taps get learning and
    /// unicast flooding turned off and a static entry for the guest MAC.
    pub mac_table_managed: bool,

    /// Budget for acquiring a domain job.
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,

    /// Named networks mapped to host bridges.
    pub networks: HashMap<String, String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::privileged()
    }
}

impl DriverConfig {
    /// Defaults for the system instance.
    pub fn privileged() -> Self {
        let config_dir = PathBuf::from("/etc/libvirt/ch");
        Self {
            version: 1,
            privileged: true,
            state_dir: PathBuf::from("/run/libvirt/ch"),
            log_dir: PathBuf::from("/var/log/libvirt/ch"),
            autostart_dir: config_dir.join("autostart"),
            config_dir,
            emulator: DEFAULT_EMULATOR.to_string(),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            cgroup_controllers: Vec::new(),
            log_timestamp: true,
            mac_filter: false,
            mac_table_managed: false,
            job_timeout: Duration::from_secs(30),
            networks: HashMap::new(),
        }
    }

    /// Defaults for a per-user session instance.
    pub fn session() -> Self {
        let runtime = dirs::runtime_dir()
            .or_else(dirs::cache_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(APP_NAME);
        let cache = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(APP_NAME);
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(APP_NAME);

        Self {
            privileged: false,
            state_dir: runtime.join("run"),
            log_dir: cache.join("log"),
            autostart_dir: config_dir.join("autostart"),
            config_dir,
            ..Self::privileged()
        }
    }

    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `<config_dir>/ch.conf` of
    /// the mode's defaults is read when present; otherwise defaults apply.
    pub fn load(path: Option<&Path>, privileged: bool) -> Result<Self> {
        let defaults = if privileged {
            Self::privileged()
        } else {
            Self::session()
        };

        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let candidate = defaults.config_dir.join(CONFIG_FILE_NAME);
                if !candidate.exists() {
                    return Ok(defaults);
                }
                candidate
            }
        };

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        Self::parse(&raw, defaults)
    }

    /// Parse TOML on top of a set of defaults.
    pub fn parse(raw: &str, defaults: Self) -> Result<Self> {
        let value: toml::Value =
            toml::from_str(raw).map_err(|e| Error::ConfigLoad(e.to_string()))?;
        let mut merged = toml::Value::try_from(&defaults)
            .map_err(|e| Error::ConfigLoad(e.to_string()))?;

        if let (Some(base), toml::Value::Table(overrides)) = (merged.as_table_mut(), value) {
            for (key, val) in overrides {
                base.insert(key, val);
            }
        }

        let mut config: Self = merged
            .try_into()
            .map_err(|e: toml::de::Error| Error::ConfigLoad(e.to_string()))?;

        // autostart follows config_dir unless set explicitly
        if !raw.contains("autostart_dir") && config.config_dir != defaults.config_dir {
            config.autostart_dir = config.config_dir.join("autostart");
        }
        Ok(config)
    }

    /// Save configuration to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = toml::to_string_pretty(self).map_err(|e| Error::ConfigSave(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, raw).map_err(|e| Error::ConfigSave(e.to_string()))
    }

    /// Create the state, log and config directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.state_dir, &self.log_dir, &self.config_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::internal(format!("cannot create directory {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// URI of this driver instance.
    pub fn uri(&self) -> &'static str {
        if self.privileged {
            "ch:///system"
        } else {
            "ch:///session"
        }
    }

    /// Pidfile of a domain.
    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.pid", name))
    }

    /// API socket of a domain.
    pub fn api_socket(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}-socket", name))
    }

    /// Event FIFO of a domain.
    pub fn event_fifo(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}-monitor-fifo", name))
    }

    /// Log file of a domain.
    pub fn log_file(&self, name: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", name))
    }

    /// Live status document of a domain.
    pub fn status_file(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", name))
    }

    /// Persistent definition of a domain.
    pub fn config_file(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{}.json", name))
    }

    /// Autostart link of a domain.
    pub fn autostart_link(&self, name: &str) -> PathBuf {
        self.autostart_dir.join(format!("{}.json", name))
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        humantime::format_duration(*duration)
            .to_string()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privileged_defaults() {
        let config = DriverConfig::privileged();
        assert_eq!(config.state_dir, PathBuf::from("/run/libvirt/ch"));
        assert_eq!(config.autostart_dir, PathBuf::from("/etc/libvirt/ch/autostart"));
        assert_eq!(config.emulator, "cloud-hypervisor");
        assert_eq!(config.job_timeout, Duration::from_secs(30));
        assert_eq!(config.uri(), "ch:///system");
    }

    #[test]
    fn test_session_defaults_are_unprivileged() {
        let config = DriverConfig::session();
        assert!(!config.privileged);
        assert_eq!(config.uri(), "ch:///session");
        assert!(config.state_dir.ends_with("chvirt/run"));
    }

    #[test]
    fn test_domain_paths() {
        let config = DriverConfig::privileged();
        assert_eq!(config.pid_file("t1"), PathBuf::from("/run/libvirt/ch/t1.pid"));
        assert_eq!(config.api_socket("t1"), PathBuf::from("/run/libvirt/ch/t1-socket"));
        assert_eq!(
            config.event_fifo("t1"),
            PathBuf::from("/run/libvirt/ch/t1-monitor-fifo")
        );
        assert_eq!(config.log_file("t1"), PathBuf::from("/var/log/libvirt/ch/t1.log"));
        assert_eq!(
            config.autostart_link("t1"),
            PathBuf::from("/etc/libvirt/ch/autostart/t1.json")
        );
    }

    #[test]
    fn test_parse_partial_overrides() {
        let raw = r#"
            state_dir = "/tmp/state"
            config_dir = "/tmp/conf"
            job_timeout = "5s"
            mac_filter = true

            [networks]
            default = "virbr0"
        "#;

        let config = DriverConfig::parse(raw, DriverConfig::privileged()).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/state"));
        assert_eq!(config.log_dir, PathBuf::from("/var/log/libvirt/ch"));
        assert_eq!(config.autostart_dir, PathBuf::from("/tmp/conf/autostart"));
        assert_eq!(config.job_timeout, Duration::from_secs(5));
        assert!(config.mac_filter);
        assert_eq!(config.networks.get("default").map(String::as_str), Some("virbr0"));
    }

    #[test]
    fn test_parse_rejects_bad_duration() {
        let err = DriverConfig::parse("job_timeout = \"soon\"", DriverConfig::privileged())
            .unwrap_err();
        assert!(err.to_string().contains("failed to load config"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ch.conf");

        let mut config = DriverConfig::privileged();
        config.emulator = "/opt/ch/cloud-hypervisor".to_string();
        config.networks.insert("lan".into(), "br0".into());
        config.save(&path).unwrap();

        let loaded = DriverConfig::load(Some(&path), true).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let err = DriverConfig::load(Some(Path::new("/nonexistent/ch.conf")), true).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ch.conf"));
    }
}
