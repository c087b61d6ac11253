//! # Shade Tunnel
//!
//! A censorship-resistant tunnel whose traffic carries no fixed bytes for a
//! classifier to match on.
//!
//! ## Features
//!
//! - **Post-quantum handshake** with ML-KEM: four messages, masked
//!   ephemeral keys, random-length tails, no identity on the wire
//! - **Cascade encryption** through two or three stream ciphers chosen per
//!   session from a catalog of combinations
//! - **Session resumption** with single-use ids, so most connections skip
//!   the handshake entirely
//! - **Port unification**: TLS, resumption, handshake and a decoy web server
//!   all share one port
//! - **Traffic shaping** with split writes, padding and decoy frames
//! - **SOCKS5 and port mapping** relays
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Application Layer                   │
//! │           (SOCKS5, port mapping, decoy HTTP)         │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Layer                       │
//! │        (Frames, cascade ciphers, relay, targets)     │
//! ├─────────────────────────────────────────────────────┤
//! │              Session / Handshake Layer               │
//! │       (ML-KEM handshake, session ids, replay)        │
//! ├─────────────────────────────────────────────────────┤
//! │                 Obfuscation Layer                    │
//! │         (Split writes, padding, decoy timing)        │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │           (TCP, TLS, connection demultiplexing)      │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod obfuscation;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default listen port
pub const DEFAULT_PORT: u16 = 443;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] protocol::HandshakeError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Client error: {0}")]
    Client(#[from] client::ClientError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
