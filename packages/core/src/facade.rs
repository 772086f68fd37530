//! High-level entry point tying device discovery to mount management.
//!
//! [`Mounter`] runs the two cycles a front-end needs:
//!
//! - scan: reconcile stale mounts, enumerate devices, fetch each one
//! - mount/unmount: materialize or tear down the FUSE mount for a device
//!
//! Failures are folded into [`MountOutcome`] / [`UnmountOutcome`] carrying a
//! user-facing message and an [`ErrorKind`], so presentation code never has
//! to inspect [`crate::Error`] directly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::config::MounterConfig;
use crate::device::{Device, DeviceRegistry};
use crate::error::{Error, ErrorKind, Result, user_message};
use crate::executor::{CommandRunner, SystemRunner};
use crate::mount::{MountManager, MountState};

/// Result of a mount attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MountOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl MountOutcome {
    fn mounted(path: PathBuf) -> Self {
        Self {
            success: true,
            path: Some(path),
            error: None,
            error_kind: None,
        }
    }

    fn failed(error: &Error) -> Self {
        Self {
            success: false,
            path: None,
            error: Some(user_message(error)),
            error_kind: Some(error.kind()),
        }
    }
}

/// Result of an unmount attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmountOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl UnmountOutcome {
    fn unmounted() -> Self {
        Self {
            success: true,
            error: None,
            error_kind: None,
        }
    }

    fn failed(error: &Error) -> Self {
        Self {
            success: false,
            error: Some(user_message(error)),
            error_kind: Some(error.kind()),
        }
    }

    /// Returns true if the unmount failed because files are still open.
    pub fn is_busy(&self) -> bool {
        self.error_kind == Some(ErrorKind::BusyResource)
    }
}

/// Device discovery plus mount management behind one cheap-to-clone handle.
#[derive(Clone)]
pub struct Mounter {
    registry: Arc<DeviceRegistry>,
    mounts: Arc<MountManager>,
}

impl Mounter {
    /// Creates a mounter that runs the real system tools.
    pub fn new(config: MounterConfig) -> Result<Self> {
        Self::with_runner(config, Arc::new(SystemRunner::new()))
    }

    /// Creates a mounter on top of a custom command runner.
    ///
    /// Creates the mount base directory and clears out mounts left behind by
    /// a previous session.
    pub fn with_runner(config: MounterConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let mount_base = config.resolve_mount_base();
        let mounts = MountManager::new(
            runner.clone(),
            config.tools.clone(),
            config.timeouts.clone(),
            mount_base,
        )?;
        let registry = DeviceRegistry::new(runner, config.tools, config.timeouts);

        let removed = mounts.cleanup_stale_mounts();
        if removed > 0 {
            log::info!("startup cleanup removed {} stale mount point(s)", removed);
        }

        Ok(Self {
            registry: Arc::new(registry),
            mounts: Arc::new(mounts),
        })
    }

    /// Returns the directory holding all mount points.
    pub fn mount_base(&self) -> &Path {
        self.mounts.mount_base()
    }

    /// Reconciles stale mounts, then lists every connected device.
    ///
    /// Never fails. Devices that cannot be queried are left out.
    pub fn scan(&self) -> Vec<Device> {
        self.mounts.cleanup_stale_mounts();
        let devices = self.registry.refresh_all();
        log::info!("scan found {} device(s)", devices.len());
        devices
    }

    /// Looks up a single connected device by UDID.
    pub fn find_device(&self, udid: &str) -> Option<Device> {
        self.mounts.cleanup_stale_mounts();
        if !self
            .registry
            .list_connected_identifiers()
            .iter()
            .any(|u| u == udid)
        {
            log::info!("device {} is not connected", udid);
            return None;
        }
        self.registry.fetch_device_info(udid)
    }

    /// Mounts a device's filesystem.
    pub fn mount(&self, device: &Device) -> MountOutcome {
        match self.mounts.mount(device) {
            Ok(path) => {
                log::info!("mounted {} at {}", device.display_name(), path.display());
                MountOutcome::mounted(path)
            }
            Err(e) => MountOutcome::failed(&e),
        }
    }

    /// Unmounts gracefully. A busy mount is reported rather than forced.
    pub fn unmount(&self, path: &Path) -> UnmountOutcome {
        self.unmount_with(path, false)
    }

    /// Unmounts, escalating to a lazy unmount on failure when `force` is set.
    pub fn unmount_with(&self, path: &Path, force: bool) -> UnmountOutcome {
        match self.mounts.unmount(path, force) {
            Ok(()) => UnmountOutcome::unmounted(),
            Err(e) => UnmountOutcome::failed(&e),
        }
    }

    /// Removes every stale mount point under the mount base.
    pub fn cleanup_stale_mounts(&self) -> usize {
        self.mounts.cleanup_stale_mounts()
    }

    pub fn mount_state(&self, path: &Path) -> MountState {
        self.mounts.state(path)
    }

    /// Opens `path` in the desktop file browser. Returns false on failure.
    pub fn open_in_file_browser(&self, path: &Path) -> bool {
        self.mounts.open_in_file_browser(path)
    }
}
