//! Mount lifecycle management.
//!
//! All mount points live directly under one per-user base directory, named
//! `<sanitized device name>_<udid>`. This module creates them, mounts the
//! device filesystem through the FUSE bridge, unmounts (gracefully, then
//! forced), and reconciles directories left behind by a crashed session.
//!
//! A mount point directory is in one of three states, see [`MountState`].
//! Only an *active* mount is ever left alone; a directory that exists but is
//! not in the mount table is stale and gets force-unmounted and removed before
//! the path is reused.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use snafu::OptionExt;

use crate::config::{TimeoutConfig, ToolConfig};
use crate::device::Device;
use crate::error::{Error, IoResultExt, Result};
use crate::executor::{CommandRunner, Invocation, command_line};

/// Kernel mount table for the current mount namespace.
const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// State of a mount point path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MountState {
    /// Nothing exists at the path.
    Absent,
    /// A directory exists but nothing is mounted on it.
    StaleDirectory,
    /// The path is in the OS mount table.
    ActivelyMounted,
}

/// Owns the mount base directory and everything under it.
pub struct MountManager {
    runner: Arc<dyn CommandRunner>,
    tools: ToolConfig,
    timeouts: TimeoutConfig,
    mount_base: PathBuf,
}

impl MountManager {
    /// Creates the manager, creating the mount base directory if needed.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        tools: ToolConfig,
        timeouts: TimeoutConfig,
        mount_base: impl Into<PathBuf>,
    ) -> Result<Self> {
        let mount_base = mount_base.into();
        fs::create_dir_all(&mount_base).mount_point_context(&mount_base)?;
        log::info!("mount base directory: {}", mount_base.display());

        Ok(Self {
            runner,
            tools,
            timeouts,
            mount_base,
        })
    }

    /// Returns the directory holding all mount points.
    pub fn mount_base(&self) -> &Path {
        &self.mount_base
    }

    /// Returns the mount point a device would be mounted on.
    pub fn mount_point_for(&self, device: &Device) -> PathBuf {
        self.mount_base.join(device.mount_dir_name())
    }

    /// Classifies a path as absent, stale, or actively mounted.
    pub fn state(&self, path: &Path) -> MountState {
        // A dead FUSE endpoint fails stat with ENOTCONN, so anything other
        // than NotFound still counts as "something is there".
        match fs::symlink_metadata(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MountState::Absent,
            _ if self.is_mounted(path) => MountState::ActivelyMounted,
            _ => MountState::StaleDirectory,
        }
    }

    /// Mounts a device and returns its mount point.
    ///
    /// Mounting a device that is already mounted returns the existing mount
    /// point without invoking the FUSE bridge again.
    pub fn mount(&self, device: &Device) -> Result<PathBuf> {
        let mount_point = self.mount_point_for(device);
        let path = path_arg(&mount_point)?;

        match self.state(&mount_point) {
            MountState::ActivelyMounted => {
                log::info!("{} already mounted at {}", device.udid, path);
                return Ok(mount_point);
            }
            MountState::StaleDirectory => {
                log::warn!("reconciling stale mount point {}", path);
                self.force_unmount_quietly(path, self.timeouts.unmount());
                fs::remove_dir(&mount_point).mount_conflict_context(&mount_point)?;
            }
            MountState::Absent => {}
        }

        fs::create_dir_all(&mount_point).mount_point_context(&mount_point)?;
        log::info!("mounting {} at {}", device.display_name(), path);

        let program = &self.tools.fuse_mount;
        let args = ["-u", device.udid.as_str(), path];
        let result = self
            .runner
            .run(program, &args, self.timeouts.mount())
            .into_output()
            .and_then(|output| {
                if output.success() {
                    Ok(())
                } else {
                    let message = output.diagnostic();
                    Err(Error::Mount {
                        message: if message.is_empty() {
                            "Mount failed".to_string()
                        } else {
                            message
                        },
                    })
                }
            });

        match result {
            Ok(()) => {
                log::info!("mount successful: {}", path);
                Ok(mount_point)
            }
            Err(e) => {
                log::error!("mount of {} failed: {}", device.udid, e);
                let _ = fs::remove_dir(&mount_point);
                Err(e)
            }
        }
    }

    /// Unmounts a mount point and removes its directory.
    ///
    /// Tries a graceful unmount first. If that fails because files are still
    /// open and `force` is false, returns [`Error::Busy`] without escalating.
    /// Otherwise falls back to a lazy forced unmount.
    pub fn unmount(&self, mount_point: &Path, force: bool) -> Result<()> {
        let path = path_arg(mount_point)?;
        log::info!("unmounting {}", path);

        sync_filesystems();

        let graceful = self.run_unmount("-u", path, self.timeouts.unmount());
        match graceful {
            Ok(()) => {
                log::info!("unmount successful: {}", path);
                self.remove_mount_dir(mount_point);
                return Ok(());
            }
            Err(e) if !force && is_busy_error(&e) => {
                log::warn!("{} is busy: {}", path, e);
                return Err(Error::Busy {
                    path: mount_point.to_path_buf(),
                    message: e.to_string(),
                });
            }
            Err(e) => log::warn!("graceful unmount of {} failed, forcing: {}", path, e),
        }

        match self.run_unmount("-uz", path, self.timeouts.unmount()) {
            Ok(()) => {
                log::info!("forced unmount successful: {}", path);
                self.remove_mount_dir(mount_point);
                Ok(())
            }
            Err(Error::CommandExit { stderr, .. }) => {
                log::error!("forced unmount of {} failed: {}", path, stderr);
                Err(Error::Unmount {
                    path: mount_point.to_path_buf(),
                    message: stderr,
                })
            }
            Err(e) => {
                log::error!("forced unmount of {} failed: {}", path, e);
                Err(e)
            }
        }
    }

    /// Force-unmounts and removes every stale entry under the mount base.
    ///
    /// Entries that are actively mounted are left in place. Every failure is
    /// tolerated; returns the number of directories removed.
    pub fn cleanup_stale_mounts(&self) -> usize {
        let entries = match fs::read_dir(&self.mount_base).mount_base_context(&self.mount_base) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("stale mount cleanup skipped: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let mount_point = entry.path();
            let Some(path) = mount_point.to_str() else {
                log::warn!("skipping non UTF-8 entry {}", mount_point.display());
                continue;
            };

            if self.is_mounted(&mount_point) {
                log::debug!("keeping active mount {}", path);
                continue;
            }

            self.force_unmount_quietly(path, self.timeouts.stale_unmount());
            match fs::remove_dir(&mount_point) {
                Ok(()) => {
                    log::info!("removed stale mount point {}", path);
                    removed += 1;
                }
                Err(e) => log::warn!("could not remove stale mount point {}: {}", path, e),
            }
        }
        removed
    }

    /// Returns true if `path` is in the OS mount table.
    ///
    /// Uses the mount-query tool, falling back to `/proc/self/mountinfo` when
    /// the tool is not installed. Any other failure counts as "not mounted".
    pub fn is_mounted(&self, path: &Path) -> bool {
        let Some(arg) = path.to_str() else {
            return mountinfo_contains(path);
        };

        match self
            .runner
            .run(&self.tools.mount_query, &["-q", arg], self.timeouts.query())
        {
            Invocation::Completed(output) => output.success(),
            Invocation::NotFound { program } => {
                log::debug!("'{}' not found, reading {}", program, MOUNTINFO_PATH);
                mountinfo_contains(path)
            }
            other => {
                log::debug!("mount query for {} failed: {:?}", arg, other);
                false
            }
        }
    }

    /// Opens a path in the desktop file browser.
    ///
    /// Best-effort: failures are logged and reported as `false`.
    pub fn open_in_file_browser(&self, path: &Path) -> bool {
        let Some(arg) = path.to_str() else {
            log::warn!("cannot open non UTF-8 path {}", path.display());
            return false;
        };

        match self.runner.spawn_detached(&self.tools.file_browser, &[arg]) {
            Ok(()) => {
                log::info!("file manager opened at {}", arg);
                true
            }
            Err(e) => {
                log::warn!("failed to open file manager: {}", e);
                false
            }
        }
    }

    fn run_unmount(&self, flag: &str, path: &str, timeout: Duration) -> Result<()> {
        let program = &self.tools.fuse_unmount;
        let args = [flag, path];
        self.runner
            .run(program, &args, timeout)
            .into_result(&command_line(program, &args))
            .map(|_| ())
    }

    fn force_unmount_quietly(&self, path: &str, timeout: Duration) {
        if let Err(e) = self.run_unmount("-uz", path, timeout) {
            log::debug!("forced unmount of {} ignored: {}", path, e);
        }
    }

    fn remove_mount_dir(&self, mount_point: &Path) {
        if let Err(e) = fs::remove_dir(mount_point) {
            log::debug!("could not remove {}: {}", mount_point.display(), e);
        }
    }
}

/// Converts a mount point to the `&str` form passed to external tools.
fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .with_whatever_context(|| format!("mount point {} is not valid UTF-8", path.display()))
}

/// Flushes pending writes to all filesystems.
fn sync_filesystems() {
    nix::unistd::sync();
}

/// Checks if an unmount error indicates open files on the mount.
fn is_busy_error(error: &Error) -> bool {
    let message = match error {
        Error::CommandExit { stderr, .. } => stderr,
        _ => return false,
    };

    let busy_indicators = ["Device or resource busy", "target is busy", "EBUSY"];

    busy_indicators
        .iter()
        .any(|indicator| message.contains(indicator))
}

/// Returns true if `/proc/self/mountinfo` lists `path` as a mount point.
fn mountinfo_contains(path: &Path) -> bool {
    match fs::read_to_string(MOUNTINFO_PATH) {
        Ok(content) => mount_points(&content).iter().any(|p| p == path),
        Err(e) => {
            log::debug!("failed to read {}: {}", MOUNTINFO_PATH, e);
            false
        }
    }
}

/// Extracts the mount point column (5th field) from mountinfo content.
fn mount_points(mountinfo: &str) -> Vec<PathBuf> {
    mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_mount_path(field)))
        .collect()
}

/// Unescapes octal sequences (`\040` for space) in mount table paths.
fn unescape_mount_path(input: &str) -> String {
    let mut bytes = Vec::with_capacity(input.len());
    let raw = input.as_bytes();
    let mut i = 0;

    while i < raw.len() {
        if raw[i] == b'\\'
            && i + 3 < raw.len()
            && raw[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
            && let Ok(byte) = u8::from_str_radix(&input[i + 1..=i + 3], 8)
        {
            bytes.push(byte);
            i += 4;
            continue;
        }
        bytes.push(raw[i]);
        i += 1;
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{ScriptedRunner, exit, not_found, ok};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Simulated FUSE bridge and mount table.
    #[derive(Default)]
    struct FakeFuse {
        mounted: HashSet<String>,
        busy: bool,
        mount_error: Option<String>,
    }

    fn fake_runner(state: Arc<Mutex<FakeFuse>>) -> ScriptedRunner {
        ScriptedRunner::new(move |program, args| {
            let mut fuse = state.lock().unwrap();
            match (program, args) {
                ("ifuse", ["-u", _udid, path]) => {
                    if let Some(message) = fuse.mount_error.clone() {
                        exit(1, &message)
                    } else {
                        fuse.mounted.insert(path.to_string());
                        ok("")
                    }
                }
                ("fusermount", ["-u", path]) => {
                    if fuse.busy {
                        exit(
                            1,
                            &format!("fusermount: failed to unmount {}: Device or resource busy", path),
                        )
                    } else if fuse.mounted.remove(*path) {
                        ok("")
                    } else {
                        exit(1, &format!("fusermount: entry for {} not found in /etc/mtab", path))
                    }
                }
                ("fusermount", ["-uz", path]) => {
                    if fuse.mounted.remove(*path) {
                        ok("")
                    } else {
                        exit(1, &format!("fusermount: entry for {} not found in /etc/mtab", path))
                    }
                }
                ("mountpoint", ["-q", path]) => {
                    if fuse.mounted.contains(*path) {
                        ok("")
                    } else {
                        exit(1, "")
                    }
                }
                ("xdg-open", _) => ok(""),
                _ => not_found(program),
            }
        })
    }

    struct Harness {
        manager: MountManager,
        runner: Arc<ScriptedRunner>,
        fuse: Arc<Mutex<FakeFuse>>,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let fuse = Arc::new(Mutex::new(FakeFuse::default()));
        let runner = Arc::new(fake_runner(fuse.clone()));
        let manager = MountManager::new(
            runner.clone(),
            ToolConfig::default(),
            TimeoutConfig::default(),
            dir.path().join("idevices"),
        )
        .unwrap();
        Harness {
            manager,
            runner,
            fuse,
            _dir: dir,
        }
    }

    fn iphone() -> Device {
        Device::new("AAA111").with_name("Test iPhone")
    }

    fn base_is_empty(manager: &MountManager) -> bool {
        fs::read_dir(manager.mount_base()).unwrap().next().is_none()
    }

    #[test]
    fn test_new_creates_mount_base() {
        let h = harness();
        assert!(h.manager.mount_base().is_dir());
    }

    #[test]
    fn test_mount_then_unmount_leaves_nothing() {
        let h = harness();
        let path = h.manager.mount(&iphone()).unwrap();

        assert_eq!(path, h.manager.mount_base().join("Test iPhone_AAA111"));
        assert!(path.is_dir());
        assert!(h.manager.is_mounted(&path));
        assert_eq!(h.manager.state(&path), MountState::ActivelyMounted);

        h.manager.unmount(&path, false).unwrap();

        assert!(!path.exists());
        assert!(!h.manager.is_mounted(&path));
        assert_eq!(h.manager.state(&path), MountState::Absent);
        assert!(base_is_empty(&h.manager));
    }

    #[test]
    fn test_mount_already_mounted_is_idempotent() {
        let h = harness();
        let first = h.manager.mount(&iphone()).unwrap();
        let second = h.manager.mount(&iphone()).unwrap();

        assert_eq!(first, second);
        let mounts = h
            .runner
            .calls()
            .iter()
            .filter(|c| c.starts_with("ifuse"))
            .count();
        assert_eq!(mounts, 1);
    }

    #[test]
    fn test_mount_reconciles_stale_directory() {
        let h = harness();
        let path = h.manager.mount_point_for(&iphone());
        fs::create_dir_all(&path).unwrap();
        assert_eq!(h.manager.state(&path), MountState::StaleDirectory);

        let mounted = h.manager.mount(&iphone()).unwrap();

        assert_eq!(mounted, path);
        assert!(h.manager.is_mounted(&path));
        let calls = h.runner.calls();
        let forced = calls
            .iter()
            .position(|c| c.starts_with("fusermount -uz"))
            .unwrap();
        let mount = calls.iter().position(|c| c.starts_with("ifuse")).unwrap();
        assert!(forced < mount);
    }

    #[test]
    fn test_mount_stale_directory_not_removable_is_conflict() {
        let h = harness();
        let path = h.manager.mount_point_for(&iphone());
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("leftover.txt"), b"data").unwrap();

        let err = h.manager.mount(&iphone()).unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::FilesystemConflict);
        assert!(!h.runner.called("ifuse"));
        // Existing content is never deleted
        assert!(path.join("leftover.txt").exists());
    }

    #[test]
    fn test_mount_failure_removes_directory() {
        let h = harness();
        h.fuse.lock().unwrap().mount_error = Some("No device found with udid AAA111.".to_string());

        let err = h.manager.mount(&iphone()).unwrap_err();

        assert_eq!(err.to_string(), "No device found with udid AAA111.");
        assert!(!h.manager.mount_point_for(&iphone()).exists());
    }

    #[test]
    fn test_mount_tool_missing() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|program, _| match program {
            "mountpoint" => exit(1, ""),
            _ => not_found(program),
        }));
        let manager = MountManager::new(
            runner,
            ToolConfig::default(),
            TimeoutConfig::default(),
            dir.path(),
        )
        .unwrap();

        let err = manager.mount(&iphone()).unwrap_err();
        assert!(matches!(err, Error::ToolNotFound { ref program } if program == "ifuse"));
        assert!(!manager.mount_point_for(&iphone()).exists());
    }

    #[test]
    fn test_distinct_udids_get_distinct_mounts() {
        let h = harness();
        let a = h.manager.mount(&Device::new("AAA111").with_name("iPhone")).unwrap();
        let b = h.manager.mount(&Device::new("BBB222").with_name("iPhone")).unwrap();

        assert_ne!(a, b);
        assert!(h.manager.is_mounted(&a));
        assert!(h.manager.is_mounted(&b));
    }

    #[test]
    fn test_unmount_busy_does_not_force() {
        let h = harness();
        let path = h.manager.mount(&iphone()).unwrap();
        h.fuse.lock().unwrap().busy = true;

        let err = h.manager.unmount(&path, false).unwrap_err();

        assert!(err.is_busy());
        assert!(!h.runner.called("fusermount -uz"));
        assert!(h.manager.is_mounted(&path));
        assert!(path.exists());
    }

    #[test]
    fn test_unmount_busy_with_force() {
        let h = harness();
        let path = h.manager.mount(&iphone()).unwrap();
        h.fuse.lock().unwrap().busy = true;

        h.manager.unmount(&path, true).unwrap();

        assert!(h.runner.called("fusermount -uz"));
        assert!(!h.manager.is_mounted(&path));
        assert!(!path.exists());
    }

    #[test]
    fn test_unmount_not_mounted_reports_diagnostic() {
        let h = harness();
        let path = h.manager.mount_base().join("Ghost_ZZZ999");

        let err = h.manager.unmount(&path, false).unwrap_err();

        match err {
            Error::Unmount { message, .. } => assert!(message.contains("not found")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_cleanup_stale_mounts_is_idempotent() {
        let h = harness();
        let base = h.manager.mount_base().to_path_buf();
        fs::create_dir(base.join("Old Phone_AAA111")).unwrap();
        fs::create_dir(base.join("Device_BBB222")).unwrap();

        assert_eq!(h.manager.cleanup_stale_mounts(), 2);
        assert!(base_is_empty(&h.manager));

        assert_eq!(h.manager.cleanup_stale_mounts(), 0);
        assert!(base_is_empty(&h.manager));
    }

    #[test]
    fn test_cleanup_keeps_active_mounts() {
        let h = harness();
        let active = h.manager.mount(&iphone()).unwrap();
        fs::create_dir(h.manager.mount_base().join("Old Phone_BBB222")).unwrap();

        assert_eq!(h.manager.cleanup_stale_mounts(), 1);
        assert!(active.exists());
        assert!(h.manager.is_mounted(&active));
    }

    #[test]
    fn test_open_in_file_browser() {
        let h = harness();
        assert!(h.manager.open_in_file_browser(h.manager.mount_base()));
        assert!(h.runner.called("xdg-open"));

        let runner = Arc::new(ScriptedRunner::new(|program, _| not_found(program)));
        let dir = tempfile::tempdir().unwrap();
        let manager = MountManager::new(
            runner,
            ToolConfig::default(),
            TimeoutConfig::default(),
            dir.path(),
        )
        .unwrap();
        assert!(!manager.open_in_file_browser(dir.path()));
    }

    #[test]
    fn test_is_busy_error() {
        let busy = Error::CommandExit {
            command: "fusermount -u /x".to_string(),
            code: 1,
            stderr: "fusermount: failed to unmount /x: Device or resource busy".to_string(),
        };
        assert!(is_busy_error(&busy));

        let other = Error::CommandExit {
            command: "fusermount -u /x".to_string(),
            code: 1,
            stderr: "fusermount: entry for /x not found in /etc/mtab".to_string(),
        };
        assert!(!is_busy_error(&other));
        assert!(!is_busy_error(&Error::ToolNotFound {
            program: "fusermount".to_string()
        }));
    }

    #[test]
    fn test_mount_points_from_mountinfo() {
        let mountinfo = "\
22 1 8:2 / / rw,relatime shared:1 - ext4 /dev/sda2 rw
98 29 0:47 / /run/user/1000/idevices/My\\040iPhone_AAA111 rw,nosuid,nodev shared:53 - fuse.ifuse ifuse rw,user_id=1000
";
        let points = mount_points(mountinfo);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0], PathBuf::from("/"));
        assert_eq!(
            points[1],
            PathBuf::from("/run/user/1000/idevices/My iPhone_AAA111")
        );
    }

    #[test]
    fn test_unescape_mount_path() {
        assert_eq!(unescape_mount_path(r"/mnt/My\040Drive"), "/mnt/My Drive");
        assert_eq!(unescape_mount_path(r"/mnt/a\134b"), r"/mnt/a\b");
        assert_eq!(unescape_mount_path(r"/mnt/trailing\04"), r"/mnt/trailing\04");
        assert_eq!(unescape_mount_path("/plain"), "/plain");
    }

    #[test]
    fn test_is_mounted_falls_back_to_mountinfo() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|program, _| not_found(program)));
        let manager = MountManager::new(
            runner.clone(),
            ToolConfig::default(),
            TimeoutConfig::default(),
            dir.path(),
        )
        .unwrap();

        // A fresh temp directory is never a mount point.
        assert!(!manager.is_mounted(dir.path()));
        assert!(runner.called("mountpoint -q"));
    }
}
