/*!
 * RideSync Daemon
 * Keeps the intercom link up in the background
 */

use anyhow::Result;
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use ridesync::domain::models::{DiscoveryEvent, PeerId};
use ridesync::domain::settings::SettingsService;
use ridesync::infrastructure::bluetooth::scanner::DeviceList;
use ridesync::infrastructure::bluetooth::simulator::SimulatedPeripheral;
use ridesync::infrastructure::bluetooth::RideSyncService;
use ridesync::infrastructure::logging;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ridesyncd")]
#[command(about = "RideSync link daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Settings file path (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect the intercom and keep the link up until Ctrl-C
    Run {
        /// Connect to the last known peer right away instead of waiting for presence
        #[arg(long)]
        last_known: bool,
    },
    /// List nearby devices, strongest signal first
    Scan {
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,
    },
    /// Print the settings file location and contents
    Settings,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => SettingsService::with_path(path),
        None => SettingsService::new()?,
    };

    let level_override = cli.debug.then_some("debug");
    let _log_guard = logging::init_logger(&settings.get().log_settings, level_override)?;
    info!("RideSync daemon starting...");
    info!("Settings: {}", settings.path().display());

    let settings = Arc::new(Mutex::new(settings));
    match cli.command.unwrap_or(Commands::Run { last_known: false }) {
        Commands::Run { last_known } => run_daemon(settings, last_known).await,
        Commands::Scan { seconds } => scan(settings, Duration::from_secs(seconds)).await,
        Commands::Settings => print_settings(&settings.lock()),
    }
}

/// In-memory peripheral with a beacon that walks into range.
fn demo_peripheral(settings: &Arc<Mutex<SettingsService>>) -> SimulatedPeripheral {
    let name = format!("{}-X", settings.lock().get().presence.target_pattern);
    let peripheral = SimulatedPeripheral::new();
    peripheral.spawn_beacon(
        PeerId::new("C4:7D:46:00:11:22"),
        name,
        vec![-85, -72, -61, -58, -50, -47, -45, -44],
        Duration::from_millis(500),
    );
    peripheral
}

async fn run_daemon(settings: Arc<Mutex<SettingsService>>, last_known: bool) -> Result<()> {
    let peripheral = Arc::new(demo_peripheral(&settings));
    let service = RideSyncService::new(peripheral, settings)?;

    let mut transitions = service.subscribe_transitions();
    let mut battery = service.subscribe_battery_level();
    let presence = service.start_presence();
    let mut presence_status = presence.subscribe_status();

    if last_known {
        match service.connect_last_known() {
            Ok(peer) => info!("Connecting to last known peer {}", peer),
            Err(e) => warn!("{}, waiting for presence", e),
        }
    }

    info!("RideSync daemon ready");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            state = transitions.recv() => match state {
                Ok(state) => info!("Link: {}", state),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} link transitions", skipped),
                Err(RecvError::Closed) => break,
            },
            changed = battery.changed() => {
                if changed.is_err() {
                    break;
                }
                match *battery.borrow_and_update() {
                    Some(level) => info!("Battery: {}%", level),
                    None => info!("Battery: unknown"),
                }
            }
            changed = presence_status.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = presence_status.borrow_and_update().clone();
                info!("Presence: {:?}", status);
            }
        }
    }

    presence.stop();
    service.disconnect();
    Ok(())
}

async fn scan(settings: Arc<Mutex<SettingsService>>, duration: Duration) -> Result<()> {
    let peripheral = Arc::new(demo_peripheral(&settings));
    let service = RideSyncService::new(peripheral, settings)?;
    let mut session = service.scan_devices(None);
    let mut devices = DeviceList::new();

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = session.next() => match event {
                Some(DiscoveryEvent::Loading) => info!("Scanning for {:?}...", duration),
                Some(DiscoveryEvent::Found(device)) => devices.update(device),
                Some(DiscoveryEvent::Error(reason)) => anyhow::bail!("Scan failed: {}", reason),
                None => break,
            },
        }
    }
    drop(session);

    for device in devices.sorted_by_signal() {
        println!("{:>5} dBm  {}  {}", device.rssi, device.id, device.name);
    }
    Ok(())
}

fn print_settings(settings: &SettingsService) -> Result<()> {
    println!("{}", settings.path().display());
    println!("{}", serde_json::to_string_pretty(settings.get())?);
    Ok(())
}
