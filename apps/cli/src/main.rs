//! idevice-mount CLI - Command line interface for iOS device mounting.
//!
//! Lists connected devices, mounts and unmounts their filesystems, and
//! cleans up mount points left behind by earlier sessions.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use env_logger::{Builder, Env};
use serde::Serialize;

use idevice_mount_core::{Device, Mounter, MounterConfig, user_message};

/// iOS device mount tool.
#[derive(Parser)]
#[command(name = "idevice-mount")]
#[command(about = "Mount iPhones and iPads over USB via ifuse", long_about = None)]
struct Cli {
    /// TOML config file with tool names and timeouts.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory to create mount points in.
    #[arg(long, global = true)]
    mount_base: Option<PathBuf>,

    /// Log debug output, including every external command.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected devices.
    Scan {
        /// Print devices as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Mount a device by UDID.
    Mount {
        udid: String,
        /// Open the mount point in the file browser.
        #[arg(long)]
        open: bool,
        #[arg(long)]
        json: bool,
    },
    /// Unmount a mount point.
    Unmount {
        path: PathBuf,
        /// Lazily unmount even if files are still open.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
    /// Remove stale mount points.
    Cleanup,
    /// Show whether a path is mounted.
    Status { path: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match load_config(cli.config.as_deref(), cli.mount_base) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", user_message(&e));
            return ExitCode::FAILURE;
        }
    };
    let mounter = match Mounter::new(config) {
        Ok(mounter) => mounter,
        Err(e) => {
            eprintln!("Error: {}", user_message(&e));
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Scan { json } => scan(&mounter, json),
        Commands::Mount { udid, open, json } => mount(&mounter, &udid, open, json),
        Commands::Unmount { path, force, json } => unmount(&mounter, &path, force, json),
        Commands::Cleanup => {
            let removed = mounter.cleanup_stale_mounts();
            println!("Removed {} stale mount point(s)", removed);
            ExitCode::SUCCESS
        }
        Commands::Status { path } => {
            println!("{}: {:?}", path.display(), mounter.mount_state(&path));
            ExitCode::SUCCESS
        }
    }
}

/// Logs at `info` by default; `RUST_LOG` overrides, `--verbose` lowers to `debug`.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn load_config(
    path: Option<&Path>,
    mount_base: Option<PathBuf>,
) -> idevice_mount_core::Result<MounterConfig> {
    let config = match path {
        Some(path) => {
            log::debug!("loading config from {}", path.display());
            MounterConfig::load(path)?
        }
        None => MounterConfig::default(),
    };
    Ok(match mount_base {
        Some(base) => config.with_mount_base(base),
        None => config,
    })
}

fn scan(mounter: &Mounter, json: bool) -> ExitCode {
    let devices = mounter.scan();
    if json {
        return print_json(&devices);
    }

    if devices.is_empty() {
        println!("No devices found");
        return ExitCode::SUCCESS;
    }

    println!(
        "{:<26} {:<24} {:<20} {:<8} {:>16} {:>8} {}",
        "UDID", "NAME", "MODEL", "IOS", "STORAGE", "BATTERY", "TRUST"
    );
    for device in &devices {
        println!(
            "{:<26} {:<24} {:<20} {:<8} {:>16} {:>8} {:?}",
            device.udid,
            device.display_name(),
            device.friendly_model.as_deref().unwrap_or("-"),
            device.ios_version.as_deref().unwrap_or("-"),
            format_storage(device),
            device
                .battery_level_percent
                .map(|p| format!("{}%", p))
                .unwrap_or_else(|| "-".to_string()),
            device.trust,
        );
    }
    ExitCode::SUCCESS
}

fn mount(mounter: &Mounter, udid: &str, open: bool, json: bool) -> ExitCode {
    let Some(device) = mounter.find_device(udid) else {
        eprintln!("Error: device {} is not connected or could not be read", udid);
        return ExitCode::FAILURE;
    };

    let outcome = mounter.mount(&device);
    if json {
        print_json(&outcome);
    }

    match (&outcome.path, &outcome.error) {
        (Some(path), _) if outcome.success => {
            if !json {
                println!("Mounted {} at {}", device.display_name(), path.display());
            }
            if open && !mounter.open_in_file_browser(path) {
                log::warn!("could not open {} in the file browser", path.display());
            }
            ExitCode::SUCCESS
        }
        (_, error) => {
            eprintln!("Error: {}", error.as_deref().unwrap_or("mount failed"));
            ExitCode::FAILURE
        }
    }
}

fn unmount(mounter: &Mounter, path: &Path, force: bool, json: bool) -> ExitCode {
    let outcome = mounter.unmount_with(path, force);
    log::debug!("unmount of {} (force: {}): {:?}", path.display(), force, outcome);
    if json {
        print_json(&outcome);
    }

    if outcome.success {
        if !json {
            println!("Unmounted {}", path.display());
        }
        return ExitCode::SUCCESS;
    }

    eprintln!(
        "Error: {}",
        outcome.error.as_deref().unwrap_or("unmount failed")
    );
    if outcome.is_busy() && !force {
        eprintln!("Hint: pass --force to unmount anyway");
    }
    ExitCode::FAILURE
}

fn format_storage(device: &Device) -> String {
    match (device.storage_used_gb, device.storage_total_gb) {
        (Some(used), Some(total)) => format!("{:.1}/{:.1} GB", used, total),
        (None, Some(total)) => format!("{:.1} GB", total),
        _ => "-".to_string(),
    }
}

fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: failed to serialize output: {}", e);
            ExitCode::FAILURE
        }
    }
}
