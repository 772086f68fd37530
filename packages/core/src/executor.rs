//! Command execution abstraction with timeout support.
//!
//! Every external utility (device listing, device info, FUSE mount and
//! unmount, mount-table query, file browser) is launched through a
//! [`CommandRunner`]. Expected failure modes never escape as panics or raw
//! `io::Error`s: the runner always hands back an [`Invocation`] describing what
//! happened, and callers decide whether that is fatal.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;

use crate::error::{Error, Result};

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Time allowed for pipes to close after leftover descendants are killed.
const PIPE_GRACE: Duration = Duration::from_millis(200);

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or -1 if the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the most useful diagnostic text: stderr if present, else stdout.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Outcome of running an external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// The process ran and exited (with any code).
    Completed(CommandOutput),
    /// The executable does not exist on PATH.
    NotFound { program: String },
    /// The process exceeded its timeout and was killed.
    TimedOut { program: String, timeout: Duration },
    /// Any other OS-level failure while spawning or waiting.
    Failed { program: String, message: String },
}

impl Invocation {
    /// Returns true if the command completed with exit code 0.
    pub fn succeeded(&self) -> bool {
        matches!(self, Invocation::Completed(output) if output.success())
    }

    /// Converts into the captured output regardless of exit code.
    ///
    /// Only missing tools, timeouts and spawn failures become errors.
    pub fn into_output(self) -> Result<CommandOutput> {
        match self {
            Invocation::Completed(output) => Ok(output),
            Invocation::NotFound { program } => Err(Error::ToolNotFound { program }),
            Invocation::TimedOut { program, timeout } => Err(Error::Timeout { program, timeout }),
            Invocation::Failed { program, message } => Err(Error::CommandExecution {
                command: program,
                message,
            }),
        }
    }

    /// Converts into the captured output, treating a non-zero exit as an error.
    pub fn into_result(self, command: &str) -> Result<CommandOutput> {
        let output = self.into_output()?;
        if !output.success() {
            return Err(Error::CommandExit {
                command: command.to_string(),
                code: output.exit_code,
                stderr: output.diagnostic(),
            });
        }
        Ok(output)
    }
}

/// Seam over process execution so the registry and mount manager can be
/// driven by a scripted runner in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, killing it if it outlives `timeout`.
    fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Invocation;

    /// Launches `program` without waiting for it to finish.
    fn spawn_detached(&self, program: &str, args: &[&str]) -> Result<()>;
}

/// Runs real processes via `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    /// Creates a new system runner.
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Invocation {
        log::debug!(
            "running '{}' (timeout {}ms)",
            command_line(program, args),
            timeout.as_millis()
        );

        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Invocation::NotFound {
                    program: program.to_string(),
                };
            }
            Err(e) => {
                return Invocation::Failed {
                    program: program.to_string(),
                    message: e.to_string(),
                };
            }
        };

        // The child leads its own process group so a timeout can take down
        // anything it started along with it.
        let group = Pid::from_raw(child.id() as i32);

        // Pipes are drained on their own threads so a chatty child can't
        // block on a full pipe while we wait for it.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let (stdout, stderr) =
                        collect_output(program, group, &stdout, &stderr, deadline);
                    return Invocation::Completed(CommandOutput {
                        exit_code: status.code().unwrap_or(-1),
                        stdout,
                        stderr,
                    });
                }
                Ok(None) => {
                    let now = Instant::now();
                    if now >= deadline {
                        kill_group_and_reap(group, &mut child);
                        log::debug!("'{}' killed after timeout", program);
                        return Invocation::TimedOut {
                            program: program.to_string(),
                            timeout,
                        };
                    }
                    thread::sleep(POLL_INTERVAL.min(deadline - now));
                }
                Err(e) => {
                    kill_group_and_reap(group, &mut child);
                    return Invocation::Failed {
                        program: program.to_string(),
                        message: e.to_string(),
                    };
                }
            }
        }
    }

    fn spawn_detached(&self, program: &str, args: &[&str]) -> Result<()> {
        log::debug!("launching '{}'", command_line(program, args));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ToolNotFound {
                        program: program.to_string(),
                    }
                } else {
                    Error::CommandExecution {
                        command: program.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        // Reap in the background so the launcher never lingers as a zombie.
        thread::spawn(move || {
            let _ = child.wait();
        });

        Ok(())
    }
}

/// Formats a command and its arguments for logs and error messages.
pub fn command_line(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Kills the whole process group led by `child`, then reaps `child`.
fn kill_group_and_reap(group: Pid, child: &mut Child) {
    if killpg(group, Signal::SIGKILL).is_err() {
        let _ = child.kill();
    }
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Receiver<Vec<u8>>> {
    pipe.map(|mut pipe| {
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = sender.send(buf);
        });
        receiver
    })
}

/// Waits for a drained pipe until `deadline`. `None` means it is still open.
fn receive(pipe: &Option<Receiver<Vec<u8>>>, deadline: Instant) -> Option<Vec<u8>> {
    match pipe {
        None => Some(Vec::new()),
        Some(receiver) => receiver
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .ok(),
    }
}

/// Collects the output of an exited child within the original deadline.
///
/// Background descendants can inherit the pipes and keep them open. If they
/// still do at the deadline, the group is killed and whatever arrives within
/// a short grace period is kept.
fn collect_output(
    program: &str,
    group: Pid,
    stdout: &Option<Receiver<Vec<u8>>>,
    stderr: &Option<Receiver<Vec<u8>>>,
    deadline: Instant,
) -> (String, String) {
    let mut out = receive(stdout, deadline);
    let mut err = receive(stderr, deadline);

    if out.is_none() || err.is_none() {
        log::debug!(
            "'{}' left descendants holding its output open, killing them",
            program
        );
        let _ = killpg(group, Signal::SIGKILL);
        let grace = Instant::now() + PIPE_GRACE;
        out = out.or_else(|| receive(stdout, grace));
        err = err.or_else(|| receive(stderr, grace));
    }

    (lossy(out), lossy(err))
}

fn lossy(bytes: Option<Vec<u8>>) -> String {
    bytes
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default()
}
