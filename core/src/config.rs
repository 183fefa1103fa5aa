use crate::StrataError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/strata/config.json";

/// Everything the storage workflows need to know about the host layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub paths: HostPaths,
    pub layout: PartitionLayout,
    pub install: InstallConfig,
    pub reboot: RebootConfig,
    pub health: HealthConfig,
}

impl StrataConfig {
    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, StrataError> {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str::<StrataConfig>(&contents).map_err(|e| {
                StrataError::Configuration(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No configuration at {}, using defaults", path.display());
                StrataConfig::default()
            }
            Err(e) => return Err(e.into()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StrataError> {
        self.layout.validate()?;

        if self.health.poll_interval_secs == 0 {
            return Err(StrataError::Configuration(
                "health.poll_interval_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Host paths the workflows touch. Overridable so the workflows can run
/// against a scratch tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostPaths {
    /// A path on the system disk. `None` means the running executable.
    pub anchor: Option<PathBuf>,
    pub sysfs_block: PathBuf,
    pub dev_root: PathBuf,
    pub by_id: PathBuf,
    pub mapper: PathBuf,
    pub boot_mount: PathBuf,
    pub optical_device: PathBuf,
    pub optical_mapped: PathBuf,
    pub key_dir: PathBuf,
    pub reboot_trigger: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            anchor: None,
            sysfs_block: PathBuf::from("/sys/class/block"),
            dev_root: PathBuf::from("/dev"),
            by_id: PathBuf::from("/dev/disk/by-id"),
            mapper: PathBuf::from("/dev/mapper"),
            boot_mount: PathBuf::from("/boot"),
            optical_device: PathBuf::from("/dev/sr0"),
            optical_mapped: PathBuf::from("/dev/mapper/sr0"),
            key_dir: PathBuf::from("/var/lib/strata"),
            reboot_trigger: PathBuf::from("/proc/sysrq-trigger"),
        }
    }
}

impl HostPaths {
    pub fn anchor(&self) -> Result<PathBuf, StrataError> {
        match &self.anchor {
            Some(anchor) => Ok(anchor.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}

/// Fixed partition roles on the system disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionLayout {
    pub boot: u32,
    pub seed: u32,
    pub swap: u32,
    pub root: u32,
    pub local_data: u32,
    /// Partitions cloned from a writable source.
    pub clone_count: u32,
    /// Partitions cloned from read-only install media.
    pub clone_count_read_only: u32,
}

impl Default for PartitionLayout {
    fn default() -> Self {
        Self {
            boot: 1,
            seed: 2,
            swap: 9,
            root: 10,
            local_data: 11,
            clone_count: 8,
            clone_count_read_only: 5,
        }
    }
}

impl PartitionLayout {
    /// Partitions removed by a factory reset, in deletion order.
    pub fn reset_targets(&self) -> [u32; 3] {
        [self.swap, self.root, self.local_data]
    }

    pub fn clone_count(&self, read_only_source: bool) -> u32 {
        if read_only_source {
            self.clone_count_read_only
        } else {
            self.clone_count
        }
    }

    pub fn validate(&self) -> Result<(), StrataError> {
        if self.clone_count == 0 || self.clone_count_read_only == 0 {
            return Err(StrataError::Configuration(
                "partition clone counts must be greater than zero".to_string(),
            ));
        }

        if self.boot == self.seed {
            return Err(StrataError::Configuration(
                "boot and seed partitions must differ".to_string(),
            ));
        }

        for index in self.reset_targets() {
            if index == 0 || index == self.boot || index == self.seed {
                return Err(StrataError::Configuration(format!(
                    "partition {} cannot be both preserved and destroyed by a reset",
                    index
                )));
            }
        }

        Ok(())
    }
}

/// Install-time behaviour, normally read from the `install` seed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallOptions {
    pub force_install: bool,
    pub force_reboot: bool,
    pub target: Option<InstallTarget>,
}

impl InstallOptions {
    pub fn target_selector(&self) -> Option<&str> {
        self.target
            .as_ref()
            .map(|target| target.id.as_str())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallTarget {
    #[serde(default)]
    pub id: String,
}

/// Host-side install policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Smallest disk, in bytes, the system may be installed to.
    pub min_target_size: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            min_target_size: 50 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebootConfig {
    pub reset_delay_ms: u64,
    pub install_delay_ms: u64,
    pub media_poll_interval_ms: u64,
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            reset_delay_ms: 1_000,
            install_delay_ms: 5_000,
            media_poll_interval_ms: 1_000,
        }
    }
}

impl RebootConfig {
    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }

    pub fn install_delay(&self) -> Duration {
        Duration::from_millis(self.install_delay_ms)
    }

    pub fn media_poll_interval(&self) -> Duration {
        Duration::from_millis(self.media_poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub poll_interval_secs: u64,
    /// Only report these pools. Empty means all of them.
    pub pools: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            pools: Vec::new(),
        }
    }
}

impl HealthConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn wants(&self, pool: &str) -> bool {
        self.pools.is_empty() || self.pools.iter().any(|p| p == pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = StrataConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, StrataConfig::default());
        assert_eq!(config.layout.reset_targets(), [9, 10, 11]);
        assert_eq!(config.layout.clone_count(true), 5);
        assert_eq!(config.layout.clone_count(false), 8);
        assert_eq!(config.install.min_target_size, 53_687_091_200);
    }

    #[test]
    fn test_min_target_size_is_configurable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"install": {"min_target_size": 1048576}}"#).unwrap();

        let config = StrataConfig::load(&path).unwrap();
        assert_eq!(config.install.min_target_size, 1_048_576);
        assert_eq!(config.layout, PartitionLayout::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"paths": {"key_dir": "/srv/keys"}, "reboot": {"reset_delay_ms": 10}}"#).unwrap();

        let config = StrataConfig::load(&path).unwrap();
        assert_eq!(config.paths.key_dir, PathBuf::from("/srv/keys"));
        assert_eq!(config.paths.by_id, PathBuf::from("/dev/disk/by-id"));
        assert_eq!(config.reboot.reset_delay(), Duration::from_millis(10));
        assert_eq!(config.reboot.install_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_reset_must_not_destroy_seed_partition() {
        let layout = PartitionLayout {
            local_data: 2,
            ..PartitionLayout::default()
        };
        assert!(matches!(layout.validate(), Err(StrataError::Configuration(_))));
    }

    #[test]
    fn test_zero_clone_count_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"layout": {"clone_count_read_only": 0}}"#).unwrap();

        assert!(matches!(StrataConfig::load(&path), Err(StrataError::Configuration(_))));
    }

    #[test]
    fn test_install_selector() {
        let options: InstallOptions =
            serde_json::from_str(r#"{"force_reboot": true, "target": {"id": "Samsung"}}"#).unwrap();
        assert!(options.force_reboot);
        assert!(!options.force_install);
        assert_eq!(options.target_selector(), Some("Samsung"));

        let empty: InstallOptions = serde_json::from_str(r#"{"target": {"id": ""}}"#).unwrap();
        assert_eq!(empty.target_selector(), None);
    }
}
