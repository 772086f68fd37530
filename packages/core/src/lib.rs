//! idevice-mount-core: Core library for mounting iOS devices on Linux.
//!
//! This library discovers USB-connected iPhones and iPads through
//! libimobiledevice and exposes their media filesystem through `ifuse`,
//! keeping the per-user mount directory free of stale mount points.
//!
//! # Modules
//!
//! - [`executor`]: Bounded external command execution
//! - [`info`]: `key: value` parsing and model name lookup
//! - [`device`]: Device records and the device registry
//! - [`mount`]: Mount/unmount operations and stale mount cleanup
//! - [`facade`]: Scan and mount cycles for front-ends
//! - [`task`]: Running blocking operations on a worker thread
//! - [`config`]: Tool names, timeouts and mount base
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use idevice_mount_core::{Mounter, MounterConfig};
//!
//! let mounter = Mounter::new(MounterConfig::default()).unwrap();
//!
//! // Scan for connected devices
//! let devices = mounter.scan();
//!
//! if let Some(device) = devices.first() {
//!     let outcome = mounter.mount(device);
//!     if let Some(path) = outcome.path {
//!         println!("{} mounted at {}", device.display_name(), path.display());
//!         mounter.unmount(&path);
//!     }
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod facade;
pub mod info;
pub mod mount;
pub mod task;

// Re-export commonly used types
pub use config::MounterConfig;
pub use device::{BatteryState, Device, TrustState};
pub use error::{Error, ErrorKind, Result, user_message};
pub use facade::{MountOutcome, Mounter, UnmountOutcome};
pub use mount::MountState;
pub use task::BackgroundTask;
