use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HfsError, Result};

/// Loader settings, normally read from a JSON file next to the boot image.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Block cache capacity, in cache granules.
    pub cache_blocks: usize,
    /// Largest file `load_file` will copy, in bytes.
    pub max_file_size: u64,
    /// Reject files not owned by root or writable by group/other.
    pub enforce_ownership: bool,
    /// Hard-link indirections followed before the catalog is declared corrupt.
    pub max_link_depth: u32,
    /// Byte offset of the volume on the device.
    pub partition_offset: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            cache_blocks: 64,
            max_file_size: 64 * 1024 * 1024,
            enforce_ownership: true,
            max_link_depth: 1,
            partition_offset: 0,
        }
    }
}

impl LoaderConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| HfsError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
