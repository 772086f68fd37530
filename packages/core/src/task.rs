//! Off-thread execution for blocking core operations.
//!
//! Every [`crate::Mounter`] call may block for up to its tool timeout. UI
//! callers hand the call to a [`BackgroundTask`] and poll for the result from
//! their event loop instead of blocking it.
//!
//! ```no_run
//! use idevice_mount_core::{Mounter, MounterConfig, task::BackgroundTask};
//!
//! let mounter = Mounter::new(MounterConfig::default()).unwrap();
//! let worker = mounter.clone();
//! let mut scan = BackgroundTask::spawn("scan", move || worker.scan()).unwrap();
//!
//! // Later, from the event loop:
//! if let Some(devices) = scan.try_take() {
//!     println!("{} device(s)", devices.len());
//! }
//! ```

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use snafu::ResultExt;

use crate::error::Result;

/// A job running on its own worker thread.
pub struct BackgroundTask<T> {
    receiver: Receiver<T>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> BackgroundTask<T> {
    /// Starts `job` on a new named worker thread.
    pub fn spawn<F>(name: &str, job: F) -> Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("idevice-{}", name))
            .spawn(move || {
                // The receiver may have been dropped; nobody is waiting then.
                let _ = sender.send(job());
            })
            .with_whatever_context(|e| format!("failed to start '{}' worker: {}", name, e))?;

        Ok(Self {
            receiver,
            handle: Some(handle),
        })
    }

    /// Starts `job` and hands its result to `callback` on the worker thread.
    pub fn spawn_with_callback<F, C>(name: &str, job: F, callback: C) -> Result<()>
    where
        F: FnOnce() -> T + Send + 'static,
        C: FnOnce(T) + Send + 'static,
    {
        thread::Builder::new()
            .name(format!("idevice-{}", name))
            .spawn(move || callback(job()))
            .with_whatever_context(|e| format!("failed to start '{}' worker: {}", name, e))?;
        Ok(())
    }

    /// Returns the result if the job has finished, without blocking.
    ///
    /// Returns `None` while the job is running, and also once the result has
    /// been taken or the job panicked.
    pub fn try_take(&mut self) -> Option<T> {
        match self.receiver.try_recv() {
            Ok(value) => {
                self.join();
                Some(value)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.join();
                None
            }
        }
    }

    /// Blocks until the job finishes. Returns `None` if it panicked.
    pub fn wait(mut self) -> Option<T> {
        let value = self.receiver.recv().ok();
        self.join();
        value
    }

    /// Returns true once the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            log::error!("background task panicked");
        }
    }
}
