use std::net::SocketAddr;
use std::sync::Arc;

use nebu_proto::api::{DeviceStatus, OwnershipRecord};

#[derive(clap::Parser)]
#[command(name = "nebu-hub")]
#[command(about = "NEBU ownership backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run the server
    Run {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:9000")]
        addr: SocketAddr,
        /// Device ids refused by validation and registration
        #[arg(long = "block")]
        blocked: Vec<String>,
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

    let cli: Cli = clap::Parser::parse();
    match cli.command {
        Commands::Run { addr, blocked } => {
            let store = Arc::new(nebu_hub::OwnershipStore::new());
            for device_id in blocked {
                store.insert(OwnershipRecord {
                    device_id,
                    user_id: None,
                    status: DeviceStatus::Blocked,
                    battery_level: None,
                    signal_strength: None,
                    registered_at: 0,
                    updated_at: 0,
                });
            }
            nebu_hub::run_server(addr, store).await?;
        }
    }
    Ok(())
}
