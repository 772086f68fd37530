//! Configuration for tool names, timeouts and the mount base directory.
//!
//! Every field has a default, so an empty (or absent) config file yields the
//! stock libimobiledevice/ifuse setup:
//!
//! ```toml
//! mount_base = "/run/user/1000/idevices"
//!
//! [tools]
//! fuse_unmount = "fusermount3"
//!
//! [timeouts]
//! mount_secs = 30
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigParseSnafu, IoResultExt, Result};

/// Name of the per-user directory holding all mount points.
pub const MOUNT_DIR_NAME: &str = "idevices";

/// External utilities invoked by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Lists connected device UDIDs (`-l`).
    pub device_list: String,
    /// Prints device properties as `key: value` lines.
    pub device_info: String,
    /// FUSE bridge exposing the device filesystem.
    pub fuse_mount: String,
    /// Unmounts FUSE filesystems (`-u`, `-uz`).
    pub fuse_unmount: String,
    /// Reports whether a path is a mount point (`-q`).
    pub mount_query: String,
    /// Opens a directory in the desktop file browser.
    pub file_browser: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            device_list: "idevice_id".to_string(),
            device_info: "ideviceinfo".to_string(),
            fuse_mount: "ifuse".to_string(),
            fuse_unmount: "fusermount".to_string(),
            mount_query: "mountpoint".to_string(),
            file_browser: "xdg-open".to_string(),
        }
    }
}

/// Per-operation timeouts, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub list_secs: u64,
    pub info_secs: u64,
    /// Scoped sub-queries (disk usage, battery).
    pub domain_secs: u64,
    pub mount_secs: u64,
    pub unmount_secs: u64,
    /// Forced unmount during stale-mount cleanup.
    pub stale_unmount_secs: u64,
    pub query_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            list_secs: 5,
            info_secs: 10,
            domain_secs: 5,
            mount_secs: 15,
            unmount_secs: 15,
            stale_unmount_secs: 1,
            query_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn list(&self) -> Duration {
        Duration::from_secs(self.list_secs)
    }

    pub fn info(&self) -> Duration {
        Duration::from_secs(self.info_secs)
    }

    pub fn domain(&self) -> Duration {
        Duration::from_secs(self.domain_secs)
    }

    pub fn mount(&self) -> Duration {
        Duration::from_secs(self.mount_secs)
    }

    pub fn unmount(&self) -> Duration {
        Duration::from_secs(self.unmount_secs)
    }

    pub fn stale_unmount(&self) -> Duration {
        Duration::from_secs(self.stale_unmount_secs)
    }

    pub fn query(&self) -> Duration {
        Duration::from_secs(self.query_secs)
    }
}

/// Top-level configuration for [`crate::Mounter`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MounterConfig {
    /// Directory holding mount points. Defaults to [`default_mount_base`].
    pub mount_base: Option<PathBuf>,
    pub tools: ToolConfig,
    pub timeouts: TimeoutConfig,
}

impl MounterConfig {
    /// Creates a new config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a config from a TOML file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).config_read_context(path)?;
        Self::from_toml(&content, path)
    }

    fn from_toml(content: &str, path: &Path) -> Result<Self> {
        use snafu::ResultExt;

        toml::from_str(content).context(ConfigParseSnafu { path })
    }

    /// Sets the mount base directory.
    pub fn with_mount_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_base = Some(path.into());
        self
    }

    /// Returns the configured mount base, or the per-user default.
    pub fn resolve_mount_base(&self) -> PathBuf {
        self.mount_base.clone().unwrap_or_else(default_mount_base)
    }
}

/// Returns the per-user mount base: `$XDG_RUNTIME_DIR/idevices`, falling back
/// to `/run/user/<uid>/idevices`.
pub fn default_mount_base() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(|| {
            let uid = nix::unistd::getuid();
            PathBuf::from(format!("/run/user/{}", uid))
        })
        .join(MOUNT_DIR_NAME)
}
