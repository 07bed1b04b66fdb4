//! BLE provisioning tool for NEBU toys
//!
//! Scans for toys, provisions WiFi credentials and registers the toy with
//! the ownership backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use nebu_ble_controller::{BtleRadio, Connector, PeripheralHandle, ScanFilter, Scanner};
use nebu_pairing::{HttpRegistrar, OwnershipApi, PairingConfig, PairingContext, SessionState};
use nebu_proto::api::{DeviceStatus, StatusUpdate};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Environment variable holding the WiFi passphrase when no file is given
const PASSPHRASE_ENV: &str = "NEBU_WIFI_PASSPHRASE";

#[derive(Parser)]
#[command(name = "nebu-ble")]
#[command(about = "BLE provisioning tool for NEBU toys")]
struct Cli {
    /// Configuration file (default: $NEBU_HOME/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ownership backend url
    #[arg(long, global = true)]
    backend: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for NEBU toys
    Scan {
        /// Scan duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,
        /// Advertised name prefix to match, repeatable
        #[arg(short, long = "prefix")]
        prefixes: Vec<String>,
    },
    /// Provision WiFi credentials and register the toy
    Pair {
        /// Peripheral address or advertised name
        #[arg(short, long)]
        device: String,
        #[arg(short, long)]
        ssid: String,
        /// File whose first line is the passphrase, otherwise $NEBU_WIFI_PASSPHRASE
        #[arg(long)]
        passphrase_file: Option<PathBuf>,
        /// Account that will own the toy
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Report a toy's status to the backend
    Status {
        #[arg(short, long)]
        device: String,
        /// inactive, active, connected, disconnected, maintenance, error or blocked
        #[arg(short, long)]
        status: DeviceStatus,
        /// Battery level 0-100
        #[arg(short, long)]
        battery: Option<u8>,
        /// Signal strength in dBm
        #[arg(long, allow_hyphen_values = true)]
        signal: Option<i16>,
    },
    /// Reset a toy (clear stored WiFi and ownership state)
    Reset {
        /// Peripheral address or advertised name
        #[arg(short, long)]
        device: String,
    },
    /// Release a toy from its owner
    Unregister {
        #[arg(short, long)]
        device: String,
        #[arg(short, long)]
        user: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => PairingConfig::load_from(path)?,
        None => PairingConfig::load()?,
    };
    if let Some(url) = cli.backend {
        config.backend_url = url;
    }

    match cli.command {
        Commands::Scan { duration, prefixes } => {
            let mut filter = config.scan_filter();
            if !prefixes.is_empty() {
                filter = ScanFilter::names(prefixes);
            }
            let duration = duration.map(Duration::from_secs).unwrap_or(config.scan_duration());
            scan_devices(filter, duration).await?;
        }
        Commands::Pair { device, ssid, passphrase_file, user } => {
            if user.is_some() {
                config.user_id = user;
            }
            let passphrase = read_passphrase(passphrase_file.as_ref())?;
            pair_device(config, &device, &ssid, &passphrase).await?;
        }
        Commands::Reset { device } => {
            reset_device(&config, &device).await?;
        }
        Commands::Status { device, status, battery, signal } => {
            let update = StatusUpdate { status, battery_level: battery, signal_strength: signal };
            let record = registrar(&config)?.update_status(&device, &update).await?;
            println!("{} is {:?}", record.device_id, record.status);
        }
        Commands::Unregister { device, user } => {
            let user = user.or(config.user_id.clone()).ok_or("no user given (--user or userId in config)")?;
            let response = registrar(&config)?.unregister(&device, &user).await?;
            if !response.success {
                return Err(response.error.unwrap_or_else(|| "unregister refused".to_string()).into());
            }
            println!("{device} released");
        }
    }

    Ok(())
}

fn registrar(config: &PairingConfig) -> Result<HttpRegistrar, Box<dyn std::error::Error>> {
    Ok(HttpRegistrar::new(&config.backend_url, config.backend_timeout())?)
}

/// An empty passphrase means an open network
fn read_passphrase(file: Option<&PathBuf>) -> Result<Zeroizing<String>, Box<dyn std::error::Error>> {
    let Some(file) = file else {
        return Ok(Zeroizing::new(std::env::var(PASSPHRASE_ENV).unwrap_or_default()));
    };
    let content = Zeroizing::new(std::fs::read_to_string(file)?);
    let line = content.lines().next().unwrap_or_default();
    Ok(Zeroizing::new(line.trim_end_matches('\r').to_string()))
}

async fn scan_devices(filter: ScanFilter, duration: Duration) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for NEBU toys ({} seconds)...", duration.as_secs());

    let radio = Arc::new(BtleRadio::new().await?);
    let scanner = Scanner::new(radio);
    let mut scan = scanner.start_scan(filter, Some(duration)).await?;

    let mut found = 0;
    while let Some(handle) = scan.next().await {
        found += 1;
        let name = handle.name.as_deref().unwrap_or("Unknown");
        let rssi = handle.rssi.map(|r| format!("{r} dBm")).unwrap_or_else(|| "N/A".to_string());
        println!("  {name} ({}) RSSI: {rssi}", handle.id);
    }

    println!("\nFound {found} toys");
    Ok(())
}

fn is_target(handle: &PeripheralHandle, target: &str) -> bool {
    handle.id == target || handle.name.as_deref() == Some(target)
}

async fn find_device(
    radio: Arc<BtleRadio>,
    config: &PairingConfig,
    target: &str,
) -> Result<PeripheralHandle, Box<dyn std::error::Error>> {
    println!("Looking for {target}...");
    let scanner = Scanner::new(radio);
    let mut scan = scanner.start_scan(config.scan_filter(), Some(config.scan_duration())).await?;
    while let Some(handle) = scan.next().await {
        if is_target(&handle, target) {
            scan.stop().await;
            return Ok(handle);
        }
    }
    Err(format!("{target} not found").into())
}

async fn reset_device(config: &PairingConfig, target: &str) -> Result<(), Box<dyn std::error::Error>> {
    let radio = Arc::new(BtleRadio::new().await?);
    let handle = find_device(radio.clone(), config, target).await?;
    let connector = Connector::new(radio);

    println!("Connecting...");
    let session = connector.connect(&handle, config.connect_timeout()).await?;
    let result = async {
        let capabilities = tokio::time::timeout(config.capability_timeout(), nebu_ble_controller::verify(&session))
            .await
            .map_err(|_| "capability check timed out")??;
        println!("Sending reset command...");
        nebu_ble_controller::reset(&session, &capabilities, config.provision_timeout()).await?;
        Ok::<_, Box<dyn std::error::Error>>(())
    }
    .await;

    // the toy drops the link itself after a reset
    if tokio::time::timeout(config.connect_timeout(), connector.disconnect(session)).await.is_err() {
        debug!("disconnect timed out");
    }
    result?;
    println!("Reset command sent! {} will clear its settings and restart.", handle.id);
    Ok(())
}

async fn pair_device(
    config: PairingConfig,
    target: &str,
    ssid: &str,
    passphrase: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let radio = Arc::new(BtleRadio::new().await?);
    let registrar = Arc::new(registrar(&config)?);
    let ctx = PairingContext::new(radio, registrar, config)?;
    let mut session = ctx.session();

    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, cancelling");
            cancel.cancel();
        }
    });

    session.provide_credential(ssid, passphrase).await?;
    session.start().await?;

    println!("Looking for {target}...");
    let mut selected = None;
    while let Some(handle) = session.next_discovery().await? {
        debug!(peripheral = %handle.id, name = ?handle.name, "candidate");
        if is_target(&handle, target) {
            println!("Found {} ({})", handle.name.as_deref().unwrap_or("Unknown"), handle.id);
            selected = Some(handle.id);
            break;
        }
    }

    let Some(id) = selected else {
        session.cancel().await;
        return Err(format!("{target} not found").into());
    };
    session.select(&id).await?;

    let snapshot = session.snapshot();
    match snapshot.state {
        SessionState::Complete => {
            let device_id = snapshot.device.map(|d| d.device_id).unwrap_or(id);
            println!("{device_id} joined {ssid} and is registered");
            if snapshot.firmware_update_required {
                println!("A firmware update is required for this toy");
            }
            Ok(())
        }
        SessionState::Cancelled => Err("cancelled".into()),
        state => {
            let message = snapshot.last_error.map(|e| e.to_string()).unwrap_or_else(|| state.to_string());
            Err(message.into())
        }
    }
}
