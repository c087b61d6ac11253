//! Port-unification demultiplexer
//!
//! State machine per accepted connection:
//!
//! ```text
//! Sniffing --TLS record--> TlsWrap --> Sniffing
//!    |  \--HTTP request--> Decoy
//!    v
//! ResumptionCheck --known opener--> Bound
//!    |        ^
//!    v        | (handshake complete, client sends an opener next)
//! Handshake --/
//! ```
//!
//! TLS is unwrapped at most once and a handshake runs at most once per
//! connection. Anything that fails classification, including a timeout, is
//! held open for a random delay with its input discarded and nothing
//! written, then closed, so an observer learns nothing from timing or content. Bytes consumed while classifying are pushed back in front of the
//! stream for whichever stage handles it next.

use super::decoy::{looks_like_http, serve_decoy, HTTP_SNIFF_LEN};
use super::{ServerContext, ServerStats};
use crate::obfuscation::close_delay;
use crate::protocol::{run_handshake, HandshakeError, HandshakeOptions, ServerHandshake, OPENER_LEN};
use crate::proxy::{serve_port_mapping, serve_socks5};
use crate::session::{Resumed, SessionError};
use crate::transport::{looks_like_tls, BoxedStream, HeldStream, PrefixedStream};
use crate::tunnel::{open_channel, relay, RelayOptions, Side, TunnelError, TunnelTarget};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Bytes needed before the first classification
const SNIFF_LEN: usize = HTTP_SNIFF_LEN;

/// Time allowed for the target header once bound
const TARGET_TIMEOUT: Duration = Duration::from_secs(15);

/// In-process pipe between the relay and the destination handler
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Sniffing,
    TlsWrap,
    ResumptionCheck,
    Handshake,
}

/// Why a connection was closed without a response
#[derive(Debug)]
pub enum RejectReason {
    Handshake(HandshakeError),
    Session(SessionError),
    Tls(String),
    Io(std::io::Error),
    Timeout,
    UnexpectedTls,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Handshake(e) => write!(f, "handshake failed: {}", e),
            RejectReason::Session(e) => write!(f, "session lookup failed: {}", e),
            RejectReason::Tls(e) => write!(f, "TLS failed: {}", e),
            RejectReason::Io(e) => write!(f, "IO error: {}", e),
            RejectReason::Timeout => write!(f, "classification timed out"),
            RejectReason::UnexpectedTls => write!(f, "unexpected TLS record"),
        }
    }
}

/// Terminal classification of a connection
pub enum Outcome {
    /// Resumed onto a session; `handshake` is set when this connection
    /// also negotiated it
    Bound {
        stream: BoxedStream,
        resumed: Resumed,
        handshake: bool,
    },
    /// Looks like HTTP; answer as a web server
    Decoy(BoxedStream),
    /// Hold open for a random delay, then close
    Rejected(RejectReason),
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Bound { handshake, .. } => write!(f, "Bound(handshake: {})", handshake),
            Outcome::Decoy(_) => write!(f, "Decoy"),
            Outcome::Rejected(reason) => write!(f, "Rejected({})", reason),
        }
    }
}

/// Classifies and serves one accepted connection
pub struct Demultiplexer {
    ctx: Arc<ServerContext>,
    peer: SocketAddr,
    /// Bytes read but not yet consumed
    buffered: Vec<u8>,
    tls_done: bool,
    handshake_done: bool,
}

impl Demultiplexer {
    pub fn new(ctx: Arc<ServerContext>, peer: SocketAddr) -> Self {
        Self {
            ctx,
            peer,
            buffered: Vec::new(),
            tls_done: false,
            handshake_done: false,
        }
    }

    /// Classify and serve the connection to completion
    pub async fn run(mut self, stream: BoxedStream) {
        // Wrappers built while classifying only hold handles on the socket
        let held = HeldStream::new(stream);
        let timeout = self.ctx.settings.classify_timeout;
        let outcome = match tokio::time::timeout(timeout, self.classify(Box::new(held.handle()))).await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Rejected(RejectReason::Timeout),
        };
        trace!("{} classified as {:?}", self.peer, outcome);

        let ctx = Arc::clone(&self.ctx);
        match outcome {
            Outcome::Bound {
                stream,
                resumed,
                handshake,
            } => {
                if !handshake {
                    ServerStats::bump(&ctx.stats.resumptions);
                }
                if let Err(e) = self.serve_bound(stream, resumed).await {
                    debug!("{}: tunnel ended: {}", self.peer, e);
                }
            }
            Outcome::Decoy(mut stream) => {
                ServerStats::bump(&ctx.stats.decoys);
                if let Err(e) = serve_decoy(stream.as_mut()).await {
                    trace!("{}: decoy response failed: {}", self.peer, e);
                }
            }
            Outcome::Rejected(reason) => {
                ServerStats::bump(&ctx.stats.rejected);
                match &reason {
                    RejectReason::Handshake(HandshakeError::ReplayDetected)
                    | RejectReason::Session(SessionError::ReplayDetected) => {
                        warn!("{}: replay detected, closing", self.peer)
                    }
                    _ => debug!("{}: rejected: {}", self.peer, reason),
                }
                match HeldStream::take(&held) {
                    Some(raw) => linger(raw, close_delay()).await,
                    None => tokio::time::sleep(close_delay()).await,
                }
            }
        }
    }

    /// Read until `len` bytes are buffered
    async fn fill_to(&mut self, stream: &mut BoxedStream, len: usize) -> std::io::Result<()> {
        let mut chunk = [0u8; 4096];
        while self.buffered.len() < len {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            self.buffered.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    /// Push unconsumed bytes back in front of `stream`
    fn rewind(&mut self, stream: BoxedStream) -> BoxedStream {
        if self.buffered.is_empty() {
            stream
        } else {
            Box::new(PrefixedStream::new(std::mem::take(&mut self.buffered), stream))
        }
    }

    /// Drive the state machine until the connection is bound, handed to the
    /// decoy, or rejected
    pub async fn classify(&mut self, mut stream: BoxedStream) -> Outcome {
        let mut state = State::Sniffing;
        loop {
            trace!("{}: {:?}", self.peer, state);
            state = match state {
                State::Sniffing => {
                    if let Err(e) = self.fill_to(&mut stream, SNIFF_LEN).await {
                        return Outcome::Rejected(RejectReason::Io(e));
                    }
                    if looks_like_tls(&self.buffered) {
                        if self.tls_done || self.ctx.tls.is_none() {
                            return Outcome::Rejected(RejectReason::UnexpectedTls);
                        }
                        State::TlsWrap
                    } else if looks_like_http(&self.buffered) {
                        return Outcome::Decoy(self.rewind(stream));
                    } else {
                        State::ResumptionCheck
                    }
                }
                State::TlsWrap => {
                    let Some(tls) = self.ctx.tls.clone() else {
                        return Outcome::Rejected(RejectReason::UnexpectedTls);
                    };
                    let raw = self.rewind(stream);
                    match tls.accept(raw).await {
                        Ok(tls_stream) => {
                            self.tls_done = true;
                            stream = Box::new(tls_stream);
                            State::Sniffing
                        }
                        Err(e) => return Outcome::Rejected(RejectReason::Tls(e.to_string())),
                    }
                }
                State::ResumptionCheck => {
                    if let Err(e) = self.fill_to(&mut stream, OPENER_LEN).await {
                        return Outcome::Rejected(RejectReason::Io(e));
                    }
                    match self.ctx.store.take(&self.buffered[..OPENER_LEN]) {
                        Ok(resumed) => {
                            self.buffered.drain(..OPENER_LEN);
                            debug!(
                                "{}: session {} id {} resumed",
                                self.peer,
                                resumed.session().serial(),
                                resumed.id.index()
                            );
                            return Outcome::Bound {
                                stream: self.rewind(stream),
                                resumed,
                                handshake: self.handshake_done,
                            };
                        }
                        Err(e @ SessionError::ReplayDetected) => {
                            return Outcome::Rejected(RejectReason::Session(e));
                        }
                        Err(e) if self.handshake_done => {
                            return Outcome::Rejected(RejectReason::Session(e));
                        }
                        Err(e) => {
                            trace!("{}: not a resumption ({}), trying handshake", self.peer, e);
                            State::Handshake
                        }
                    }
                }
                State::Handshake => {
                    let mut rewound = self.rewind(stream);
                    let machine = ServerHandshake::new(
                        Arc::clone(&self.ctx.identity),
                        Arc::clone(&self.ctx.replay),
                    );
                    let options = HandshakeOptions {
                        split_writes: self.ctx.settings.obfuscation.split_handshake,
                    };
                    match run_handshake(machine, rewound.as_mut(), &self.ctx.pool, options).await {
                        Ok((machine, keys)) => {
                            let session = self.ctx.store.put(keys, machine.peer().copied());
                            ServerStats::bump(&self.ctx.stats.handshakes);
                            info!("{}: handshake complete, session {}", self.peer, session.serial());
                            self.handshake_done = true;
                            stream = rewound;
                            State::ResumptionCheck
                        }
                        Err(e) => return Outcome::Rejected(RejectReason::Handshake(e)),
                    }
                }
            };
        }
    }

    /// Read the target header and relay to the destination
    async fn serve_bound(&self, stream: BoxedStream, resumed: Resumed) -> Result<(), TunnelError> {
        let session = Arc::clone(resumed.session());
        let keys = session.keys();
        let settings = &self.ctx.settings;

        let (read_half, write_half) = tokio::io::split(stream);
        let (mut reader, writer) = open_channel(
            Side::Server,
            keys,
            &resumed.id,
            read_half,
            write_half,
            settings.obfuscation.padding,
        )?;

        let target = tokio::time::timeout(TARGET_TIMEOUT, reader.read_target())
            .await
            .map_err(|_| TunnelError::Closed)??;
        debug!("{}: tunnel target {}", self.peer, target);

        let options = RelayOptions {
            obfuscation: settings.obfuscation,
            idle_timeout: keys.relay_idle(),
        };
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);

        let relayed = relay(reader, writer, remote, options);
        let destination = async {
            let result = match &target {
                TunnelTarget::Socks5 => serve_socks5(local, &settings.whitelist, &settings.transport).await,
                TunnelTarget::PortMapping(addr) => {
                    serve_port_mapping(local, addr, &settings.whitelist, &settings.transport).await
                }
            };
            if let Err(e) = &result {
                debug!("{}: {} failed: {}", self.peer, target, e);
            }
            result
        };

        let (relay_result, _) = tokio::join!(relayed, destination);
        // Held until the relay is done so eviction skips the session
        drop(resumed);

        let stats = relay_result?;
        debug!(
            "{}: tunnel closed, {} bytes in, {} bytes out",
            self.peer, stats.bytes_in, stats.bytes_out
        );
        Ok(())
    }
}

/// Keep `stream` open for `delay`, discarding input, then drop it
async fn linger(mut stream: BoxedStream, delay: Duration) {
    let deadline = Instant::now() + delay;
    let mut sink = [0u8; 4096];
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut sink)).await {
            Ok(Ok(n)) if n > 0 => continue,
            // Peer closed or errored; still wait out the delay
            Ok(_) => {
                tokio::time::sleep_until(deadline).await;
                break;
            }
            Err(_) => break,
        }
    }
}
