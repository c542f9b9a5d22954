use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "openwire",
    version,
    about = "Userspace WireGuard client with SOCKS5/HTTP/TCP/UDP proxy routines"
)]
struct Cli {
    /// Config file path
    #[arg(short, long)]
    config: String,

    /// Validate the config file and exit
    #[arg(short = 'n', long)]
    check: bool,

    /// Bind address for the /readyz and /metrics endpoints
    #[arg(short, long)]
    info: Option<SocketAddr>,

    /// Suppress informational logging
    #[arg(short, long)]
    silent: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.silent { "error" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match openwire::config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config '{}' has errors:\n  {}", cli.config, e);
            std::process::exit(1);
        }
    };

    if cli.check {
        println!("config '{}' is valid", cli.config);
        println!("{}", openwire::config::summarize(&config));
        return Ok(());
    }

    let vt = match openwire::tun::VirtualTun::new(config.device.clone()).await {
        Ok(vt) => vt,
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };
    info!("wireguard device up");

    let _routines = openwire::proxy::spawn_routines(vt.clone(), config.routines);

    openwire::health::start_pinger(vt.clone());
    if let Some(info_addr) = cli.info {
        let vt = vt.clone();
        tokio::spawn(async move {
            if let Err(e) = openwire::health::serve(info_addr, vt).await {
                error!(error = %e, "health endpoint failed");
                std::process::exit(1);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
