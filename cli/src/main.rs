use anyhow::Context;
use clap::{Parser, Subcommand};
use ntfsman_core::{Config, MountState, Volume, VolumeError, VolumeEvent, VolumeRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ntfsman")]
#[command(about = "Discover, mount and unmount NTFS volumes", long_about = None)]
struct Cli {
    /// Configuration file (defaults to $NTFSMAN_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List NTFS volumes
    List,
    /// Mount a volume
    Mount {
        /// Device path, e.g. /dev/sdb1
        device: String,
        #[arg(long, conflicts_with = "read_only")]
        read_write: bool,
        #[arg(long)]
        read_only: bool,
    },
    /// Unmount a volume
    Unmount {
        device: String,
    },
    /// Unmount every mounted volume
    UnmountAll,
    /// Rescan periodically and print volume changes
    Watch {
        /// Seconds between scans
        #[arg(short, long, default_value_t = 2)]
        interval: u64,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "ntfsman=debug" } else { "ntfsman=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn format_size(bytes: u64) -> String {
    format!("{:.2} GB", bytes as f64 / 1_073_741_824.0)
}

fn print_volume(volume: &Volume) {
    println!("Volume: {}", volume.display_name());
    println!("  Device: {}", volume.device_path);
    println!("  Size: {}", format_size(volume.size_bytes));
    println!("  State: {}", volume.mount_state);
    if let MountState::Mounted { mount_point, read_write } = &volume.mount_state {
        let access = if *read_write { "read-write" } else { "read-only" };
        println!("  Mounted at: {} ({})", mount_point.display(), access);
    }
    if let Some(free) = volume.free_bytes {
        println!("  Free: {}", format_size(free));
    }
    if let MountState::Failed { reason } = &volume.mount_state {
        println!("  Hint: {}", reason.user_message());
    }
    println!();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn describe(error: &VolumeError) -> String {
    match error.mount_error() {
        Some(mount_error) => mount_error.user_message(),
        None => error.to_string(),
    }
}

async fn list(registry: &VolumeRegistry, json: bool) -> anyhow::Result<()> {
    let report = registry.scan().await;
    if json {
        return print_json(&report);
    }
    if let Some(error) = &report.error {
        eprintln!("Error enumerating devices: {}", error);
    }
    for device in &report.unreadable {
        eprintln!("Skipped {}: {}", device.device_path, device.reason);
    }
    if report.volumes.is_empty() {
        println!("No NTFS volumes found.");
        return Ok(());
    }
    println!("NTFS volumes:\n");
    for volume in &report.volumes {
        print_volume(volume);
    }
    Ok(())
}

async fn watch(registry: Arc<VolumeRegistry>, interval: u64, json: bool) -> anyhow::Result<()> {
    let mut events = registry.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if json => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!("Could not serialize event: {}", e),
                },
                Ok(VolumeEvent::VolumeChanged(volume)) => {
                    println!("{}: {}", volume.device_path, volume.mount_state)
                }
                Ok(VolumeEvent::VolumeRemoved(device_path)) => println!("{}: removed", device_path),
                Err(RecvError::Lagged(missed)) => tracing::warn!("Missed {} volume events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = registry.scan().await;
                if let Some(error) = report.error {
                    tracing::warn!("Scan failed: {}", error);
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
        }
    }
    printer.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let registry = Arc::new(ntfsman_platform::host_registry(&config));

    match cli.command {
        Commands::List => list(&registry, cli.json).await?,
        Commands::Mount { device, read_write, read_only } => {
            let read_write = if read_write {
                true
            } else if read_only {
                false
            } else {
                config.read_write_by_default
            };
            registry.scan().await;
            match registry.request_mount(&device, read_write).await {
                Ok(volume) if cli.json => print_json(&volume)?,
                Ok(volume) => {
                    let mount_point = volume.mount_point().unwrap_or(config.mount_root.as_path());
                    println!("Mounted {} at {}", volume.device_path, mount_point.display());
                }
                Err(e) => anyhow::bail!("Cannot mount {}: {}", device, describe(&e)),
            }
        }
        Commands::Unmount { device } => {
            registry.scan().await;
            match registry.request_unmount(&device).await {
                Ok(volume) if cli.json => print_json(&volume)?,
                Ok(volume) => println!("Unmounted {}", volume.device_path),
                Err(e) => anyhow::bail!("Cannot unmount {}: {}", device, describe(&e)),
            }
        }
        Commands::UnmountAll => {
            registry.scan().await;
            let outcomes = registry.unmount_all().await;
            let mut failures = 0;
            for (device, result) in &outcomes {
                match result {
                    Ok(_) => println!("Unmounted {}", device),
                    Err(e) => {
                        failures += 1;
                        eprintln!("Cannot unmount {}: {}", device, describe(e));
                    }
                }
            }
            if outcomes.is_empty() {
                println!("Nothing to unmount.");
            }
            if failures > 0 {
                anyhow::bail!("{} of {} volumes could not be unmounted", failures, outcomes.len());
            }
        }
        Commands::Watch { interval } => watch(registry, interval, cli.json).await?,
    }

    Ok(())
}
