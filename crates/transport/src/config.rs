//! Transport configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, PoolError};

/// Upper bound on concurrent software decode workers.
pub const MAX_CAPACITY: usize = 64;

/// Bytes of each frame compared to decide whether a paused frame changed.
pub const DEFAULT_FINGERPRINT_LEN: usize = 1024;

/// Settings shared by the pool, the render side and spawned workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Number of slots in the pool.
    pub capacity: usize,
    /// Directory holding segment files.
    pub shm_dir: PathBuf,
    /// File name prefix for segments and slot tables.
    pub segment_prefix: String,
    /// How long the render side waits for a frame lock.
    pub lock_timeout_ms: u64,
    pub fingerprint_len: usize,
    /// Log level passed to spawned worker processes.
    pub worker_log_level: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            shm_dir: default_shm_dir(),
            segment_prefix: "gridframe".to_string(),
            lock_timeout_ms: 1000,
            fingerprint_len: DEFAULT_FINGERPRINT_LEN,
            worker_log_level: "info".to_string(),
        }
    }
}

impl TransportConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.capacity == 0 || self.capacity > MAX_CAPACITY {
            return Err(PoolError::InvalidCapacity {
                requested: self.capacity,
                max: MAX_CAPACITY,
            });
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Path of the frame segment named after `name`.
    pub fn segment_path(&self, name: &str) -> PathBuf {
        segment_path(&self.shm_dir, &self.segment_prefix, name)
    }
}

pub(crate) fn segment_path(dir: &Path, prefix: &str, name: &str) -> PathBuf {
    dir.join(format!("{}-{}", prefix, name))
}

/// `/dev/shm` when the platform has it, else the user runtime dir, else temp.
pub fn default_shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        return dev_shm.to_path_buf();
    }
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

/// Fresh, empty directory for one test's segments.
#[cfg(test)]
pub(crate) fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("gridframe-test-{}", crate::WorkerId::new()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[cfg(test)]
pub(crate) fn scratch_config(capacity: usize) -> TransportConfig {
    TransportConfig {
        capacity,
        shm_dir: scratch_dir(),
        lock_timeout_ms: 200,
        ..TransportConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TransportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fingerprint_len, 1024);
        assert_eq!(config.lock_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn capacity_bounds() {
        let mut config = TransportConfig::default();
        config.capacity = 0;
        assert!(matches!(config.validate(), Err(PoolError::InvalidCapacity { .. })));
        config.capacity = MAX_CAPACITY + 1;
        assert!(config.validate().is_err());
        config.capacity = MAX_CAPACITY;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_fills_missing_fields() {
        let dir = scratch_dir();
        let path = dir.join("config.json");
        fs::write(&path, r#"{ "capacity": 2, "segment_prefix": "wall" }"#).unwrap();

        let config = TransportConfig::load(&path).unwrap();
        assert_eq!(config.capacity, 2);
        assert_eq!(config.segment_prefix, "wall");
        assert_eq!(config.lock_timeout_ms, 1000);
        assert_eq!(config.segment_path("abc"), config.shm_dir.join("wall-abc"));
    }

    #[test]
    fn load_rejects_bad_capacity() {
        let dir = scratch_dir();
        let path = dir.join("config.json");
        fs::write(&path, r#"{ "capacity": 100 }"#).unwrap();

        assert!(matches!(
            TransportConfig::load(&path),
            Err(ConfigError::Invalid(PoolError::InvalidCapacity { .. }))
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let path = scratch_dir().join("absent.json");
        assert!(matches!(
            TransportConfig::load(&path),
            Err(crate::ConfigError::Io(_))
        ));
    }
}
