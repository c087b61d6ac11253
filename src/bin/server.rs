//! Shade Tunnel Server
//!
//! Serves the tunnel, TLS and a decoy web site on a single port:
//! - Runs the post-quantum handshake for registered clients
//! - Resumes sessions from single-use ids
//! - Relays SOCKS5 and port-mapping tunnels to their destinations

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use clap::Parser;
use shade_tunnel::{
    config::{Config, LoggingConfig},
    crypto::{random_array, KemPublicKey},
    protocol::{ServerIdentity, CLIENT_ID_LEN},
    server::TunnelServer,
};
use tokio::net::TcpListener;
use tracing::info;

/// Shade Tunnel Server - censorship-resistant tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "shade-server")]
#[command(about = "Shade Tunnel Server - censorship-resistant tunneling")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Generate a new server seed and print its client key, then exit
    #[arg(long)]
    generate_key: bool,

    /// Register a client as ID:PUBLIC_KEY in the config file, then exit
    #[arg(long, value_name = "ID:PUBLIC_KEY")]
    add_client: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level or filter (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_key {
        return generate_key();
    }

    let mut config = Config::load(&args.config).context("Failed to load configuration")?;

    if let Some(entry) = &args.add_client {
        return add_client(&mut config, &args.config, entry);
    }

    init_logging(&config.logging, args.log_level.as_deref());

    let server_config = config
        .server
        .as_mut()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    let generated = server_config.seed.is_empty();
    if generated {
        info!("No server seed configured - generating one...");
        server_config.seed = base64::engine::general_purpose::STANDARD.encode(random_array::<32>());
    }
    let server_config = server_config.clone();
    if generated {
        config.save(&args.config).context("Failed to save config with new seed")?;
        info!("Generated and saved new seed to config file");
    }

    run(server_config, args.listen).await
}

async fn run(server_config: shade_tunnel::config::ServerConfig, listen: Option<String>) -> Result<()> {
    let server = TunnelServer::from_config(&server_config).context("Invalid server configuration")?;
    let listen_addr = listen.unwrap_or(server_config.listen);

    info!("Shade Tunnel Server v{}", shade_tunnel::VERSION);
    info!("Listening on {}", listen_addr);
    info!("Client key: {}", server.client_key());

    let listener = TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind to address")?;

    server
        .run(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let stats = server.stats();
    info!(
        "Served {} connection(s): {} handshake(s), {} resumption(s), {} decoy(s), {} rejected",
        stats.accepted, stats.handshakes, stats.resumptions, stats.decoys, stats.rejected
    );
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

/// Generate and print a new server seed
fn generate_key() -> Result<()> {
    let seed = zeroize::Zeroizing::new(random_array::<32>());
    let identity = ServerIdentity::from_seed(&seed);
    let seed_b64 = base64::engine::general_purpose::STANDARD.encode(&seed[..]);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                Shade Tunnel Server Key Generated             ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Add to the [server] section of config.toml (keep secret):");
    println!("  seed = \"{}\"", seed_b64);
    println!();
    println!("Give clients this client key (server_key in their config):");
    println!("  \"{}\"", identity.client_key());

    Ok(())
}

/// Register a client id and public key in the config file
fn add_client(config: &mut Config, path: &str, entry: &str) -> Result<()> {
    let (id, public) = entry
        .split_once(':')
        .ok_or_else(|| anyhow!("Expected ID:PUBLIC_KEY, got '{}'", entry))?;
    let server = config
        .server
        .as_mut()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    let (id, public) = (id.trim(), public.trim());

    let id_len = base64::engine::general_purpose::STANDARD
        .decode(id)
        .context("Client id is not base64")?
        .len();
    if id_len != CLIENT_ID_LEN {
        bail!("Client id must be {} bytes, got {}", CLIENT_ID_LEN, id_len);
    }
    KemPublicKey::from_base64(public).context("Invalid client public key")?;

    server.clients.insert(id.to_string(), public.to_string());
    let total = server.clients.len();
    config.save(path).context("Failed to save config")?;

    println!("Registered client {} ({} client(s) total)", id, total);
    Ok(())
}
