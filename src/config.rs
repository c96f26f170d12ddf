//! Engine open-time tuning. Mirrors the original `StorageEngine::OpenOptions`,
//! loadable from a TOML file the way the wider `vectordotdev-vector`
//! workspace loads its own configuration surfaces.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default block size for the log device: a multiple of 512, per §4.A.
pub const DEFAULT_BLOCK_SIZE: u32 = 2048;

/// Default offline-compaction trigger ratio: compact when live-block
/// utilization has not yet reached this fraction of the device, per §4.D.5.
pub const DEFAULT_COMPACTION_RATIO: f64 = 0.60;

/// Default minimum device size before compaction is even considered.
pub const DEFAULT_COMPACTION_DEVICE_MIN_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Options governing how a [`crate::storage::engine::StorageEngine`] opens
/// and maintains its log device and index table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenOptions {
    /// Block size of the log device. Must be a multiple of 512.
    pub block_size: u32,
    /// Whether to create the log device and index files if they don't exist.
    pub create_if_missing: bool,
    /// Offline compaction runs at open only if the device is at least this
    /// many bytes.
    pub compaction_device_min_size: u64,
    /// Offline compaction runs at open only if live-block utilization is at
    /// or below this ratio.
    pub compaction_ratio: f64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            create_if_missing: true,
            compaction_device_min_size: DEFAULT_COMPACTION_DEVICE_MIN_SIZE,
            compaction_ratio: DEFAULT_COMPACTION_RATIO,
        }
    }
}

impl OpenOptions {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % 512 != 0 {
            return Err(crate::error::Error::invalid_argument(format!(
                "block_size must be a non-zero multiple of 512, got {}",
                self.block_size
            )));
        }
        if !(0.0..=1.0).contains(&self.compaction_ratio) {
            return Err(crate::error::Error::invalid_argument(format!(
                "compaction_ratio must be within [0, 1], got {}",
                self.compaction_ratio
            )));
        }
        Ok(())
    }

    /// Loads options from a TOML file, falling back to defaults for any
    /// field the file omits (`#[serde(default)]` on every field).
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let opts: OpenOptions = toml::from_str(s)
            .map_err(|e| crate::error::Error::invalid_argument(format!("invalid config: {e}")))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| crate::error::Error::fatal(format!("unable to serialize config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let opts = OpenOptions::default();
        assert_eq!(opts.block_size, 2048);
        assert!((opts.compaction_ratio - 0.60).abs() < f64::EPSILON);
        assert_eq!(opts.compaction_device_min_size, 4 * 1024 * 1024 * 1024);
    }

    #[test]
    fn rejects_misaligned_block_size() {
        let mut opts = OpenOptions::default();
        opts.block_size = 513;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let opts = OpenOptions { block_size: 4096, ..OpenOptions::default() };
        let toml = opts.to_toml_string().unwrap();
        let back = OpenOptions::from_toml_str(&toml).unwrap();
        assert_eq!(back.block_size, 4096);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let opts = OpenOptions::from_toml_str("block_size = 4096\n").unwrap();
        assert_eq!(opts.block_size, 4096);
        assert_eq!(opts.create_if_missing, true);
    }
}
