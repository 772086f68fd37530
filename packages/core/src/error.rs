//! Unified error types for the idevice-mount-core library.
//!
//! Uses SNAFU for context-rich error handling. The same underlying
//! `std::io::Error` shows up when creating, removing, and reading mount points
//! and configuration, so each site gets its own variant.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;
use std::time::Duration;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// External utility is not installed or not on PATH.
    #[snafu(display("'{program}' not found"))]
    ToolNotFound { program: String },

    /// External utility did not finish within its allotted time.
    #[snafu(display("'{program}' timed out after {}s", timeout.as_secs()))]
    Timeout { program: String, timeout: Duration },

    /// Command executed but returned non-zero exit code.
    #[snafu(display("{stderr}"))]
    CommandExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Failed to execute a system command for a reason other than absence.
    #[snafu(display("failed to execute '{command}': {message}"))]
    CommandExecution { command: String, message: String },

    /// Unmount refused because files on the device are still open.
    #[snafu(display("{} is busy: {message}", path.display()))]
    Busy { path: PathBuf, message: String },

    /// Tool output could not be interpreted.
    #[snafu(display("unexpected value for '{key}': {value}"))]
    ParseAnomaly { key: String, value: String },

    /// A leftover directory occupies the mount point and cannot be removed.
    #[snafu(display("mount point {} already exists and could not be removed", path.display()))]
    MountPointConflict {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Mount point creation failed.
    #[snafu(display("failed to create mount point at {}", path.display()))]
    MountPointCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Mount base directory could not be listed.
    #[snafu(display("failed to read mount base {}", path.display()))]
    MountBaseRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Mount operation failed.
    #[snafu(display("{message}"))]
    Mount { message: String },

    /// Unmount operation failed.
    #[snafu(display("failed to unmount {}: {message}", path.display()))]
    Unmount { path: PathBuf, message: String },

    /// Configuration file could not be read.
    #[snafu(display("failed to read config at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML for [`crate::config::MounterConfig`].
    #[snafu(display("failed to parse config at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Coarse classification of failures, shared with the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    ToolNotFound,
    Timeout,
    NonZeroExit,
    BusyResource,
    ParseAnomaly,
    FilesystemConflict,
    UnexpectedError,
}

impl Error {
    /// Returns the taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ToolNotFound { .. } => ErrorKind::ToolNotFound,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::CommandExit { .. } | Error::Mount { .. } | Error::Unmount { .. } => {
                ErrorKind::NonZeroExit
            }
            Error::Busy { .. } => ErrorKind::BusyResource,
            Error::ParseAnomaly { .. } | Error::ConfigParse { .. } => ErrorKind::ParseAnomaly,
            Error::MountPointConflict { .. } => ErrorKind::FilesystemConflict,
            Error::CommandExecution { .. }
            | Error::MountPointCreation { .. }
            | Error::MountBaseRead { .. }
            | Error::ConfigRead { .. }
            | Error::Generic { .. } => ErrorKind::UnexpectedError,
        }
    }

    /// Returns true if this error means the device still has open files.
    pub fn is_busy(&self) -> bool {
        self.kind() == ErrorKind::BusyResource
    }
}

/// Converts core library errors to short, actionable messages for users.
pub fn user_message(error: &Error) -> String {
    match error {
        Error::ToolNotFound { program } => {
            format!("'{}' is not installed. Install libimobiledevice and ifuse.", program)
        }
        Error::Timeout { .. } => {
            "The device did not respond in time. Unlock it and try again.".to_string()
        }
        Error::Busy { .. } => {
            "Device is busy. Close any open files on it and try again.".to_string()
        }
        Error::MountPointConflict { path, .. } => format!(
            "Mount folder {} is in use and could not be cleaned up.",
            path.display()
        ),
        Error::CommandExit { stderr, .. } if stderr.trim().is_empty() => {
            "The operation failed.".to_string()
        }
        // For other errors, use the default Display implementation
        _ => error.to_string(),
    }
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for mount point creation errors.
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for a stale mount point that could not be removed.
    fn mount_conflict_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for mount base listing errors.
    fn mount_base_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for config read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountPointCreationSnafu { path: path.into() })
    }

    fn mount_conflict_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountPointConflictSnafu { path: path.into() })
    }

    fn mount_base_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountBaseReadSnafu { path: path.into() })
    }

    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }
}
