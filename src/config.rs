//! Configuration management for stackfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default limit on live shadow nodes
pub const DEFAULT_MAX_NODES: usize = 1 << 20;

/// Default attribute cache lifetime handed to the kernel, in milliseconds
pub const DEFAULT_ATTR_TTL_MS: u64 = 1000;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Lower filesystem configuration
    pub lower: LowerConfig,

    /// Mount configuration
    pub mount: MountConfig,

    /// Stacking layer configuration
    pub stack: StackConfig,
}

/// Lower filesystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LowerConfig {
    /// Directory the layer is stacked on
    pub path: PathBuf,

    /// Pass extended attributes through to the lower directory
    pub xattr: bool,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Filesystem name reported to the kernel
    pub fs_name: String,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Allow root to access the mount
    pub allow_root: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,

    /// Attribute and entry cache lifetime (ms)
    pub attr_ttl_ms: u64,
}

/// Stacking layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Maximum number of live shadow nodes
    pub max_nodes: usize,
}

impl Default for LowerConfig {
    fn default() -> Self {
        LowerConfig {
            path: PathBuf::from("/srv/stackfs/lower"),
            xattr: true,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/stackfs"),
            fs_name: "stackfs".to_string(),
            allow_other: false,
            allow_root: false,
            auto_unmount: true,
            attr_ttl_ms: DEFAULT_ATTR_TTL_MS,
        }
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            max_nodes: DEFAULT_MAX_NODES,
        }
    }
}

impl Config {
    /// Default location of the config file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stackfs")
            .join("config.json")
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("STACKFS_LOWER_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.lower.path = PathBuf::from(dir);
            }
        }

        if let Ok(mount_point) = std::env::var("STACKFS_MOUNT_POINT") {
            let mount_point = mount_point.trim();
            if !mount_point.is_empty() {
                self.mount.mount_point = PathBuf::from(mount_point);
            }
        }

        if let Ok(ttl) = std::env::var("STACKFS_ATTR_TTL_MS") {
            if let Ok(ttl) = ttl.trim().parse::<u64>() {
                self.mount.attr_ttl_ms = ttl;
            }
        }

        if let Ok(max_nodes) = std::env::var("STACKFS_MAX_NODES") {
            if let Ok(max_nodes) = max_nodes.trim().parse::<usize>() {
                self.stack.max_nodes = max_nodes;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.lower.path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "Lower directory is required".to_string(),
            ));
        }

        if self.mount.mount_point.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("Mount point is required".to_string()));
        }

        if self.lower.path == self.mount.mount_point {
            return Err(Error::InvalidConfig(
                "Mount point must differ from the lower directory".to_string(),
            ));
        }

        // root node plus at least one child
        if self.stack.max_nodes < 2 {
            return Err(Error::InvalidConfig(
                "max_nodes must be at least 2".to_string(),
            ));
        }

        Ok(())
    }
}
