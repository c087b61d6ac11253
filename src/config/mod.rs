//! Configuration management

use crate::crypto::{CryptoError, KemPublicKey};
use crate::obfuscation::{ObfuscationConfig, PaddingConfig, DEFAULT_MAX_PADDING};
use crate::protocol::{parse_client_key, ClientId, ClientIdentity, ServerIdentity, CLIENT_ID_LEN};
use crate::proxy::Whitelist;
use crate::transport::{ServerUrl, TransportConfig, DEFAULT_ALPN};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to write config: {0}")]
    Write(#[source] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(ConfigError::Write)
    }
}

fn decode_fixed<const N: usize>(field: &'static str, value: &str) -> Result<[u8; N], ConfigError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|e| ConfigError::invalid(field, e))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| ConfigError::invalid(field, format!("expected {} bytes, got {}", N, b.len())))
}

fn default_alpn() -> Vec<String> {
    DEFAULT_ALPN.iter().map(|s| s.to_string()).collect()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Seed of the server key pair (base64, 32 bytes)
    pub seed: String,
    /// Authorized clients: id (base64) to public key (base64)
    pub clients: BTreeMap<String, String>,
    /// Allowed SOCKS5 and port-mapping destinations (`host` or `host:port`)
    pub socks_whitelist: Vec<String>,
    pub tcp_nodelay: bool,
    /// Upper bound of the random forwarding delay
    pub write_delay_ms: u64,
    pub split_handshake: bool,
    pub decoy_packets: bool,
    pub max_padding: usize,
    /// Evict sessions unused for this long
    pub session_idle_secs: u64,
    /// Evict sessions older than this, whether or not they are in use
    pub key_rotation_secs: Option<u64>,
    /// TLS certificate path; a self-signed certificate is used without one
    pub tls_cert: Option<String>,
    /// TLS key path
    pub tls_key: Option<String>,
    /// Names on the self-signed certificate
    pub tls_names: Vec<String>,
    pub alpn: Vec<String>,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Concurrent KEM operations
    pub crypto_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:443".to_string(),
            seed: String::new(),
            clients: BTreeMap::new(),
            socks_whitelist: Vec::new(),
            tcp_nodelay: true,
            write_delay_ms: 0,
            split_handshake: true,
            decoy_packets: true,
            max_padding: DEFAULT_MAX_PADDING,
            session_idle_secs: 3600,
            key_rotation_secs: None,
            tls_cert: None,
            tls_key: None,
            tls_names: vec!["localhost".to_string()],
            alpn: default_alpn(),
            max_connections: 1000,
            crypto_workers: 4,
        }
    }
}

impl ServerConfig {
    /// Server key pair plus every configured client
    pub fn identity(&self) -> Result<ServerIdentity, ConfigError> {
        let seed = zeroize::Zeroizing::new(decode_fixed::<32>("server.seed", &self.seed)?);
        let mut identity = ServerIdentity::from_seed(&seed);
        for (id, public) in &self.clients {
            let id: ClientId = decode_fixed::<CLIENT_ID_LEN>("server.clients id", id)?;
            let public = KemPublicKey::from_base64(public)
                .map_err(|e: CryptoError| ConfigError::invalid("server.clients key", e))?;
            identity.add_client(id, public);
        }
        Ok(identity)
    }

    pub fn obfuscation(&self) -> ObfuscationConfig {
        ObfuscationConfig {
            split_handshake: self.split_handshake,
            decoy_packets: self.decoy_packets,
            write_delay_ms: self.write_delay_ms,
            padding: PaddingConfig {
                max_padding: self.max_padding,
            },
        }
    }

    pub fn whitelist(&self) -> Whitelist {
        Whitelist::new(&self.socks_whitelist)
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            nodelay: self.tcp_nodelay,
            ..TransportConfig::default()
        }
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn key_rotation(&self) -> Option<Duration> {
        self.key_rotation_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }
}

/// Local listener forwarding to a fixed remote destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Local listen address
    pub local: String,
    /// Remote `host:port`, reached from the server
    pub remote: String,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server URLs, tried in order (`tcp://host:port` or `tls://host:port`)
    pub servers: Vec<String>,
    /// Client id (base64, 16 bytes)
    pub id: String,
    /// Seed of the client key pair (base64, 32 bytes)
    pub seed: String,
    /// Server client key (base64 fingerprint)
    pub server_key: String,
    pub tcp_nodelay: bool,
    pub write_delay_ms: u64,
    pub split_handshake: bool,
    pub decoy_packets: bool,
    pub max_padding: usize,
    /// Local SOCKS5 listen address
    pub socks5_listen: Option<String>,
    pub port_mappings: Vec<PortMapping>,
    /// Renegotiate after this long
    pub key_rotation_secs: Option<u64>,
    /// Relay idle timeout requested from the server (0 = none)
    pub relay_idle_secs: u64,
    pub alpn: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec!["tcp://127.0.0.1:443".to_string()],
            id: String::new(),
            seed: String::new(),
            server_key: String::new(),
            tcp_nodelay: true,
            write_delay_ms: 0,
            split_handshake: true,
            decoy_packets: true,
            max_padding: DEFAULT_MAX_PADDING,
            socks5_listen: Some("127.0.0.1:1080".to_string()),
            port_mappings: Vec::new(),
            key_rotation_secs: None,
            relay_idle_secs: 0,
            alpn: default_alpn(),
        }
    }
}

impl ClientConfig {
    pub fn identity(&self) -> Result<ClientIdentity, ConfigError> {
        let id = decode_fixed::<CLIENT_ID_LEN>("client.id", &self.id)?;
        let seed = zeroize::Zeroizing::new(decode_fixed::<32>("client.seed", &self.seed)?);
        Ok(ClientIdentity::from_seed(id, &seed))
    }

    pub fn server_fingerprint(&self) -> Result<[u8; 32], ConfigError> {
        parse_client_key(&self.server_key).map_err(|e| ConfigError::invalid("client.server_key", e))
    }

    pub fn server_urls(&self) -> Result<Vec<ServerUrl>, ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::invalid("client.servers", "no servers configured"));
        }
        self.servers
            .iter()
            .map(|s| s.parse().map_err(|e| ConfigError::invalid("client.servers", e)))
            .collect()
    }

    pub fn obfuscation(&self) -> ObfuscationConfig {
        ObfuscationConfig {
            split_handshake: self.split_handshake,
            decoy_packets: self.decoy_packets,
            write_delay_ms: self.write_delay_ms,
            padding: PaddingConfig {
                max_padding: self.max_padding,
            },
        }
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            nodelay: self.tcp_nodelay,
            ..TransportConfig::default()
        }
    }

    pub fn key_rotation(&self) -> Option<Duration> {
        self.key_rotation_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig {
            port_mappings: vec![PortMapping {
                local: "127.0.0.1:2222".to_string(),
                remote: "127.0.0.1:22".to_string(),
            }],
            ..ClientConfig::default()
        }),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_array;

    fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn test_example_round_trips_through_toml() {
        let config = generate_example_config();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();

        let client = parsed.client.unwrap();
        assert_eq!(client.port_mappings.len(), 1);
        assert_eq!(parsed.server.unwrap().session_idle_secs, 3600);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            "#,
        )
        .unwrap();
        let server = parsed.server.unwrap();
        assert_eq!(server.listen, "127.0.0.1:9000");
        assert_eq!(server.max_padding, DEFAULT_MAX_PADDING);
        assert!(server.decoy_packets);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn test_identities_from_config() {
        let seed: [u8; 32] = random_array();
        let (client_identity, client_seed) = ClientIdentity::generate();

        let mut server = ServerConfig {
            seed: b64(&seed),
            ..ServerConfig::default()
        };
        server
            .clients
            .insert(b64(client_identity.id()), client_identity.public().to_base64());
        let server_identity = server.identity().unwrap();
        assert_eq!(server_identity.client_count(), 1);

        let client = ClientConfig {
            id: b64(client_identity.id()),
            seed: b64(&client_seed[..]),
            server_key: server_identity.client_key(),
            ..ClientConfig::default()
        };
        assert_eq!(client.identity().unwrap().id(), client_identity.id());
        assert_eq!(&client.server_fingerprint().unwrap(), server_identity.fingerprint());
        assert_eq!(client.server_urls().unwrap().len(), 1);
    }

    #[test]
    fn test_bad_values_rejected() {
        let server = ServerConfig {
            seed: b64(&[1, 2, 3]),
            ..ServerConfig::default()
        };
        assert!(matches!(server.identity(), Err(ConfigError::Invalid { .. })));

        let client = ClientConfig {
            servers: vec!["ftp://nowhere:1".to_string()],
            ..ClientConfig::default()
        };
        assert!(client.server_urls().is_err());
    }
}
