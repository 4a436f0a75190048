//! Runtime configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::ConfigError;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "NTFSMAN_CONFIG";

/// Which NTFS implementation the executor mounts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NtfsDriver {
    /// Kernel `ntfs3`, falling back to `ntfs-3g` when the kernel lacks it.
    #[default]
    Auto,
    Kernel,
    Fuse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory under which mount points are created.
    pub mount_root: PathBuf,
    pub driver: NtfsDriver,
    pub allow_read_write: bool,
    pub read_write_by_default: bool,
    /// Extra `-o` style options passed to the driver.
    pub mount_options: Vec<String>,
    /// Buffered change events per subscriber.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt/ntfsman"),
            driver: NtfsDriver::Auto,
            allow_read_write: true,
            read_write_by_default: false,
            mount_options: Vec::new(),
            event_capacity: 64,
        }
    }
}

impl Config {
    /// `$XDG_CONFIG_HOME/ntfsman/config.json` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ntfsman").join("config.json"))
    }

    /// Load from `path`, else `$NTFSMAN_CONFIG`, else the default location.
    ///
    /// A missing file at the implicit locations yields defaults; an explicit
    /// path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        let implicit = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(Self::default_path);
        match implicit {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
