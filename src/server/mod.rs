//! Tunnel server
//!
//! One TCP port serves everything. Each accepted socket goes through the
//! [`Demultiplexer`], which decides between TLS unwrapping, session
//! resumption, a fresh handshake and the decoy web server. Bound connections
//! are relayed to their SOCKS5 or port-mapping destination.

mod decoy;
mod demux;

pub use decoy::{looks_like_http, serve_decoy};
pub use demux::{Demultiplexer, Outcome, RejectReason};

use crate::config::ServerConfig;
use crate::obfuscation::ObfuscationConfig;
use crate::protocol::{CryptoPool, ServerIdentity};
use crate::proxy::Whitelist;
use crate::session::{ReplayGuard, SessionStore, DEFAULT_IDLE_TIMEOUT};
use crate::transport::{configure_tcp, TlsServer, TransportConfig};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// How often idle sessions are swept
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Server behaviour
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub obfuscation: ObfuscationConfig,
    pub transport: TransportConfig,
    pub whitelist: Whitelist,
    /// Evict sessions unused for this long
    pub session_idle: Duration,
    /// Evict sessions older than this
    pub key_rotation: Option<Duration>,
    pub max_connections: usize,
    /// Time allowed from accept until a connection is bound
    pub classify_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            obfuscation: ObfuscationConfig::default(),
            transport: TransportConfig::default(),
            whitelist: Whitelist::default(),
            session_idle: DEFAULT_IDLE_TIMEOUT,
            key_rotation: None,
            max_connections: 1000,
            classify_timeout: Duration::from_secs(30),
        }
    }
}

/// Connection counters
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    handshakes: AtomicU64,
    resumptions: AtomicU64,
    decoys: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    /// Completed handshakes
    pub handshakes: u64,
    /// Connections bound without a handshake
    pub resumptions: u64,
    /// Connections answered by the decoy web server
    pub decoys: u64,
    /// Connections closed without a response
    pub rejected: u64,
}

impl ServerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            handshakes: self.handshakes.load(Ordering::Relaxed),
            resumptions: self.resumptions.load(Ordering::Relaxed),
            decoys: self.decoys.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// State shared by every connection
pub struct ServerContext {
    pub identity: Arc<ServerIdentity>,
    pub store: SessionStore,
    pub replay: Arc<ReplayGuard>,
    pub pool: CryptoPool,
    pub tls: Option<TlsServer>,
    pub settings: ServerSettings,
    pub stats: ServerStats,
}

/// Listening tunnel server
pub struct TunnelServer {
    ctx: Arc<ServerContext>,
}

impl TunnelServer {
    pub fn new(
        identity: ServerIdentity,
        settings: ServerSettings,
        tls: Option<TlsServer>,
        crypto_workers: usize,
    ) -> Self {
        if identity.client_count() == 0 {
            warn!("No clients configured - server will reject all handshakes");
        } else {
            info!("Loaded {} client(s)", identity.client_count());
        }

        Self {
            ctx: Arc::new(ServerContext {
                identity: Arc::new(identity),
                store: SessionStore::new(),
                replay: Arc::new(ReplayGuard::default()),
                pool: CryptoPool::new(crypto_workers),
                tls,
                settings,
                stats: ServerStats::default(),
            }),
        }
    }

    /// Build a server from its configuration section
    pub fn from_config(config: &ServerConfig) -> crate::Result<Self> {
        let identity = config.identity()?;

        let tls = match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => TlsServer::from_pem(Path::new(cert), Path::new(key), &config.alpn)?,
            _ => TlsServer::self_signed(&config.tls_names, &config.alpn)?,
        };

        let settings = ServerSettings {
            obfuscation: config.obfuscation(),
            transport: config.transport(),
            whitelist: config.whitelist(),
            session_idle: config.session_idle(),
            key_rotation: config.key_rotation(),
            max_connections: config.max_connections,
            ..ServerSettings::default()
        };

        Ok(Self::new(identity, settings, Some(tls), config.crypto_workers))
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// The client key string for this server
    pub fn client_key(&self) -> String {
        self.ctx.identity.client_key()
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run<F>(&self, listener: TcpListener, shutdown: F) -> crate::Result<()>
    where
        F: Future<Output = ()>,
    {
        let limit = Arc::new(Semaphore::new(self.ctx.settings.max_connections.max(1)));
        let eviction = self.spawn_eviction();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let permit = match limit.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!("Connection limit reached, dropping {}", peer_addr);
                                    continue;
                                }
                            };
                            debug!("New connection from {}", peer_addr);
                            ServerStats::bump(&self.ctx.stats.accepted);
                            configure_tcp(&stream, &self.ctx.settings.transport);

                            let demux = Demultiplexer::new(Arc::clone(&self.ctx), peer_addr);
                            tokio::spawn(async move {
                                demux.run(Box::new(stream)).await;
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        eviction.abort();
        Ok(())
    }

    /// Accept connections forever
    pub async fn serve(&self, listener: TcpListener) -> crate::Result<()> {
        self.run(listener, std::future::pending()).await
    }

    fn spawn_eviction(&self) -> tokio::task::JoinHandle<()> {
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = ctx
                    .store
                    .evict(ctx.settings.session_idle, ctx.settings.key_rotation);
                if evicted > 0 {
                    debug!("{} session(s) remain", ctx.store.len());
                }
            }
        })
    }
}
