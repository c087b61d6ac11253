//! Tunnel client
//!
//! Holds at most one negotiated session at a time. Every tunnel is its own
//! TCP connection: the first one after startup (or after the session is
//! dropped) runs the four-message handshake and then sends an opener on the
//! same socket; later ones send the next pooled opener straight away.
//!
//! Local listeners bind accepted sockets to tunnels. SOCKS5 sockets are
//! relayed raw and negotiated at the server end; port-mapping sockets name
//! their remote destination in the target header.

use crate::config::ClientConfig;
use crate::obfuscation::{retry_jitter, watchdog_timeout, ObfuscationConfig};
use crate::protocol::{
    run_handshake, ClientHandshake, ClientIdentity, CryptoPool, HandshakeError, HandshakeOptions,
    MAX_TIMEOUT_HINT,
};
use crate::proxy::ProxyError;
use crate::session::{ClientSession, DEFAULT_IDLE_TIMEOUT};
use crate::transport::{BoxedStream, ServerUrl, TlsClient, TransportConfig, TransportError};
use crate::tunnel::{
    open_channel, relay, spawn_relay, RelayOptions, Side, TunnelError, TunnelReader, TunnelTarget,
    TunnelWriter,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Handshake attempts per server before `open` gives up
const ATTEMPTS_PER_SERVER: usize = 2;

/// Inbound half of a client tunnel
pub type ClientReader = TunnelReader<ReadHalf<BoxedStream>>;

/// Outbound half of a client tunnel
pub type ClientWriter = TunnelWriter<WriteHalf<BoxedStream>>;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("No server URLs configured")]
    NoServers,

    #[error("Handshake failed on every server: {0}")]
    Unreachable(String),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Client behaviour
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub obfuscation: ObfuscationConfig,
    pub transport: TransportConfig,
    /// Relay idle timeout requested from the server, in seconds (0 = none)
    pub relay_idle_secs: u64,
    /// Renegotiate once the session is this old
    pub key_rotation: Option<Duration>,
    /// Renegotiate once the session has been unused this long; should not
    /// exceed the server's idle eviction
    pub session_idle: Duration,
    pub alpn: Vec<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            obfuscation: ObfuscationConfig::default(),
            transport: TransportConfig::default(),
            relay_idle_secs: 0,
            key_rotation: None,
            session_idle: DEFAULT_IDLE_TIMEOUT / 2,
            alpn: crate::transport::DEFAULT_ALPN.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ClientSettings {
    fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            obfuscation: self.obfuscation,
            idle_timeout: (self.relay_idle_secs > 0)
                .then(|| Duration::from_secs(self.relay_idle_secs.min(MAX_TIMEOUT_HINT))),
        }
    }
}

/// Client connected to one of a list of servers
pub struct TunnelClient {
    identity: Arc<ClientIdentity>,
    fingerprint: [u8; 32],
    servers: Vec<ServerUrl>,
    /// Index of the server currently in use
    current: AtomicUsize,
    tls: TlsClient,
    settings: ClientSettings,
    pool: CryptoPool,
    session: RwLock<Option<Arc<ClientSession>>>,
    /// Held while a handshake is in flight
    negotiating: Mutex<()>,
    handshakes: AtomicU64,
}

impl TunnelClient {
    pub fn new(
        identity: ClientIdentity,
        fingerprint: [u8; 32],
        servers: Vec<ServerUrl>,
        settings: ClientSettings,
    ) -> Result<Self, ClientError> {
        if servers.is_empty() {
            return Err(ClientError::NoServers);
        }
        let tls = TlsClient::new(&settings.alpn)?;
        Ok(Self {
            identity: Arc::new(identity),
            fingerprint,
            servers,
            current: AtomicUsize::new(0),
            tls,
            settings,
            pool: CryptoPool::new(1),
            session: RwLock::new(None),
            negotiating: Mutex::new(()),
            handshakes: AtomicU64::new(0),
        })
    }

    /// Build a client from its configuration section
    pub fn from_config(config: &ClientConfig) -> crate::Result<Self> {
        let settings = ClientSettings {
            obfuscation: config.obfuscation(),
            transport: config.transport(),
            relay_idle_secs: config.relay_idle_secs,
            key_rotation: config.key_rotation(),
            alpn: config.alpn.clone(),
            ..ClientSettings::default()
        };
        let client = Self::new(
            config.identity()?,
            config.server_fingerprint()?,
            config.server_urls()?,
            settings,
        )?;
        Ok(client)
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Completed handshakes since startup
    pub fn handshakes(&self) -> u64 {
        self.handshakes.load(Ordering::Relaxed)
    }

    /// The server URL currently in use
    pub fn current_server(&self) -> &ServerUrl {
        &self.servers[self.current.load(Ordering::Relaxed) % self.servers.len()]
    }

    /// Forget the current session; the next tunnel renegotiates
    pub fn invalidate_session(&self) {
        if self.session.write().take().is_some() {
            debug!("Session dropped");
        }
    }

    /// The current session, unless it is due for renegotiation
    fn live_session(&self) -> Option<Arc<ClientSession>> {
        let guard = self.session.read();
        let session = guard.as_ref()?;
        let rotated = self
            .settings
            .key_rotation
            .is_some_and(|limit| session.age() >= limit);
        if rotated || session.idle_for() >= self.settings.session_idle {
            return None;
        }
        Some(Arc::clone(session))
    }

    /// Open a tunnel to `target`
    pub async fn open(&self, target: &TunnelTarget) -> Result<(ClientReader, ClientWriter), ClientError> {
        let (session, stream) = match self.live_session() {
            Some(session) => {
                let stream = self.current_server().connect(&self.settings.transport, &self.tls).await?;
                (session, stream)
            }
            None => self.negotiate().await?,
        };

        let id = session.next_id();
        let (read_half, mut write_half) = tokio::io::split(stream);
        write_half.write_all(&id.opener()).await?;

        let (reader, mut writer) = open_channel(
            Side::Client,
            session.keys(),
            &id,
            read_half,
            write_half,
            self.settings.obfuscation.padding,
        )?;
        writer.send_target(target).await?;
        debug!("Tunnel to {} opened with id {}", target, id.index());
        Ok((reader, writer))
    }

    /// Open a tunnel and relay it in the background, returning the local end
    pub async fn connect(&self, target: &TunnelTarget) -> Result<DuplexStream, ClientError> {
        let (reader, writer) = self.open(target).await?;
        Ok(spawn_relay(reader, writer, self.settings.relay_options()))
    }

    /// Run a handshake, rotating through the server list on failure
    ///
    /// Returns the new session and the connection it was negotiated on,
    /// which is reused for the first tunnel.
    async fn negotiate(&self) -> Result<(Arc<ClientSession>, BoxedStream), ClientError> {
        let _guard = self.negotiating.lock().await;

        // Another task may have finished a handshake while we waited
        if let Some(session) = self.live_session() {
            let stream = self.current_server().connect(&self.settings.transport, &self.tls).await?;
            return Ok((session, stream));
        }

        let mut last_error = String::new();
        for attempt in 0..self.servers.len() * ATTEMPTS_PER_SERVER {
            if attempt > 0 {
                tokio::time::sleep(retry_jitter()).await;
            }
            let index = self.current.load(Ordering::Relaxed) % self.servers.len();
            let server = &self.servers[index];

            match tokio::time::timeout(watchdog_timeout(), self.handshake_with(server)).await {
                Ok(Ok(negotiated)) => return Ok(negotiated),
                Ok(Err(e)) => {
                    warn!("Handshake with {} failed: {}", server, e);
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!("Handshake with {} timed out", server);
                    last_error = HandshakeError::Timeout.to_string();
                }
            }
            self.current.store((index + 1) % self.servers.len(), Ordering::Relaxed);
        }

        Err(ClientError::Unreachable(last_error))
    }

    async fn handshake_with(&self, server: &ServerUrl) -> Result<(Arc<ClientSession>, BoxedStream), ClientError> {
        debug!("Connecting to {}", server);
        let mut stream = server.connect(&self.settings.transport, &self.tls).await?;

        let machine = ClientHandshake::new(Arc::clone(&self.identity), self.fingerprint)
            .with_timeout_hint(self.settings.relay_idle_secs);
        let options = HandshakeOptions {
            split_writes: self.settings.obfuscation.split_handshake,
        };
        let (_, keys) = run_handshake(machine, stream.as_mut(), &self.pool, options).await?;

        let session = Arc::new(ClientSession::new(keys));
        *self.session.write() = Some(Arc::clone(&session));
        self.handshakes.fetch_add(1, Ordering::Relaxed);
        info!("Handshake with {} complete", server);
        Ok((session, stream))
    }

    /// Bind every connection accepted on `listener` to a tunnel for `target`
    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener, target: TunnelTarget) {
        if let Ok(addr) = listener.local_addr() {
            info!("Listening on {} for {}", addr, target);
        }
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            };
            let _ = socket.set_nodelay(self.settings.transport.nodelay);
            let client = Arc::clone(&self);
            let target = target.clone();
            tokio::spawn(async move {
                debug!("Local connection from {} for {}", peer, target);
                if let Err(e) = client.bind_local(socket, &target).await {
                    debug!("Local connection from {} ended: {}", peer, e);
                }
            });
        }
    }

    async fn bind_local(&self, socket: tokio::net::TcpStream, target: &TunnelTarget) -> Result<(), ClientError> {
        let (reader, writer) = self.open(target).await?;
        match relay(reader, writer, socket, self.settings.relay_options()).await {
            Ok(stats) => {
                debug!("{} closed, {} in, {} out", target, stats.bytes_in, stats.bytes_out);
                Ok(())
            }
            Err(TunnelError::IdleTimeout) => Err(TunnelError::IdleTimeout.into()),
            Err(e) => {
                // The server closes silently on an unknown opener
                self.invalidate_session();
                Err(e.into())
            }
        }
    }

    /// Start the SOCKS5 and port-mapping listeners named in `config`
    pub async fn spawn_listeners(
        self: &Arc<Self>,
        config: &ClientConfig,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>, ClientError> {
        let mut tasks = Vec::new();
        if let Some(addr) = &config.socks5_listen {
            let listener = TcpListener::bind(addr).await?;
            tasks.push(tokio::spawn(Arc::clone(self).serve_listener(listener, TunnelTarget::Socks5)));
        }
        for mapping in &config.port_mappings {
            let listener = TcpListener::bind(&mapping.local).await?;
            let target = TunnelTarget::PortMapping(mapping.remote.clone());
            tasks.push(tokio::spawn(Arc::clone(self).serve_listener(listener, target)));
        }
        Ok(tasks)
    }
}
