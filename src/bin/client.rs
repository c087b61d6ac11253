//! Shade Tunnel Client
//!
//! Runs local listeners whose connections are carried through the tunnel:
//! - A SOCKS5 listener, negotiated at the server end
//! - One listener per configured port mapping
//!
//! The first connection negotiates a session; later ones resume it.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use clap::Parser;
use shade_tunnel::{
    client::TunnelClient,
    config::{Config, LoggingConfig},
    protocol::ClientIdentity,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Shade Tunnel Client - censorship-resistant tunneling
#[derive(Parser, Debug)]
#[command(name = "shade-client")]
#[command(about = "Shade Tunnel Client - censorship-resistant tunneling")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Generate a new client identity and exit
    #[arg(long)]
    generate_identity: bool,

    /// Log level or filter (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_identity {
        return generate_identity();
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    init_logging(&config.logging, args.log_level.as_deref());

    let client_config = config
        .client
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;

    let client = Arc::new(TunnelClient::from_config(&client_config).context("Invalid client configuration")?);

    info!("Shade Tunnel Client v{}", shade_tunnel::VERSION);
    info!("Server: {}", client.current_server());

    let tasks = client
        .spawn_listeners(&client_config)
        .await
        .context("Failed to start local listeners")?;
    if tasks.is_empty() {
        warn!("No socks5_listen or port_mappings configured - nothing to do");
        return Ok(());
    }

    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
    info!("Shutting down...");
    for task in tasks {
        task.abort();
    }
    info!("{} handshake(s) this run", client.handshakes());
    Ok(())
}

fn init_logging(logging: &LoggingConfig, override_level: Option<&str>) {
    let filter = tracing_subscriber::EnvFilter::new(override_level.unwrap_or(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}

/// Generate and print a new client identity
fn generate_identity() -> Result<()> {
    let (identity, seed) = ClientIdentity::generate();
    let b64 = base64::engine::general_purpose::STANDARD;
    let id = b64.encode(identity.id());
    let public = identity.public().to_base64();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              Shade Tunnel Client Identity Generated          ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Add to the [client] section of config.toml (keep the seed secret):");
    println!("  id = \"{}\"", id);
    println!("  seed = \"{}\"", b64.encode(&seed[..]));
    println!();
    println!("Register with the server admin:");
    println!("  shade-server --add-client {}:{}", id, public);

    Ok(())
}
