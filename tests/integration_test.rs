//! Integration tests for Shade Tunnel
//!
//! Runs a real server on loopback and drives it with the library client:
//! - Handshake, then session resumption on later connections
//! - Port mapping and SOCKS5 relays end to end
//! - Replay, stranger and decoy behaviour seen from the outside
//! - TLS port unification

use shade_tunnel::client::{ClientSettings, TunnelClient};
use shade_tunnel::obfuscation::ObfuscationConfig;
use shade_tunnel::protocol::{ClientHandshake, ClientIdentity, HandshakeMachine, ServerIdentity, Step};
use shade_tunnel::proxy::Whitelist;
use shade_tunnel::server::{ServerSettings, TunnelServer};
use shade_tunnel::transport::{TlsServer, DEFAULT_ALPN};
use shade_tunnel::tunnel::TunnelTarget;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct Harness {
    server: Arc<TunnelServer>,
    addr: SocketAddr,
    identity: ClientIdentity,
    fingerprint: [u8; 32],
}

impl Harness {
    async fn start(whitelist: &[&str], tls: Option<TlsServer>) -> Self {
        let (identity, _) = ClientIdentity::generate();
        let server_identity = ServerIdentity::from_seed(&shade_tunnel::crypto::random_array())
            .with_client(*identity.id(), identity.public().clone());
        let fingerprint = *server_identity.fingerprint();

        let settings = ServerSettings {
            obfuscation: ObfuscationConfig::disabled(),
            whitelist: Whitelist::new(whitelist),
            ..ServerSettings::default()
        };
        let server = Arc::new(TunnelServer::new(server_identity, settings, tls, 2));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let running = Arc::clone(&server);
        tokio::spawn(async move { running.serve(listener).await });

        Self {
            server,
            addr,
            identity,
            fingerprint,
        }
    }

    fn client(&self, scheme: &str) -> TunnelClient {
        let settings = ClientSettings {
            obfuscation: ObfuscationConfig::disabled(),
            ..ClientSettings::default()
        };
        let url = format!("{}://{}", scheme, self.addr).parse().unwrap();
        TunnelClient::new(self.identity.clone(), self.fingerprint, vec![url], settings).unwrap()
    }
}

/// Echo server for relay destinations
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn assert_echo<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(10), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(buf, payload);
}

/// Whether the server neither writes nor closes within `wait`
async fn stays_open_and_silent(stream: &mut TcpStream, wait: Duration) -> bool {
    let mut buf = [0u8; 1];
    tokio::time::timeout(wait, stream.read(&mut buf)).await.is_err()
}

#[tokio::test]
async fn test_port_mapping_through_tunnel() {
    let echo = echo_server().await;
    let harness = Harness::start(&[], None).await;
    let client = harness.client("tcp");

    let mut stream = client
        .connect(&TunnelTarget::PortMapping(echo.to_string()))
        .await
        .unwrap();
    assert_echo(&mut stream, b"hello through the tunnel").await;

    let big: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
    assert_echo(&mut stream, &big).await;

    assert_eq!(client.handshakes(), 1);
    assert_eq!(harness.server.stats().handshakes, 1);
}

#[tokio::test]
async fn test_later_connections_resume_session() {
    let echo = echo_server().await;
    let harness = Harness::start(&[], None).await;
    let client = harness.client("tcp");
    let target = TunnelTarget::PortMapping(echo.to_string());

    for i in 0..3u8 {
        let mut stream = client.connect(&target).await.unwrap();
        assert_echo(&mut stream, &[i; 32]).await;
    }

    let stats = harness.server.stats();
    assert_eq!(client.handshakes(), 1);
    assert_eq!(stats.handshakes, 1);
    assert_eq!(stats.resumptions, 2);
    assert_eq!(stats.accepted, 3);
}

#[tokio::test]
async fn test_socks5_through_tunnel() {
    let echo = echo_server().await;
    let harness = Harness::start(&[], None).await;
    let client = harness.client("tcp");

    let mut stream = client.connect(&TunnelTarget::Socks5).await.unwrap();

    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let SocketAddr::V4(v4) = echo else {
        panic!("echo server is IPv4");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x00, "CONNECT should succeed");

    assert_echo(&mut stream, b"socks payload").await;
}

#[tokio::test]
async fn test_socks5_whitelist_enforced() {
    let echo = echo_server().await;
    let harness = Harness::start(&["allowed.example"], None).await;
    let client = harness.client("tcp");

    let mut stream = client.connect(&TunnelTarget::Socks5).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();

    let SocketAddr::V4(v4) = echo else {
        panic!("echo server is IPv4");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x02], "connection not allowed by ruleset");
}

#[tokio::test]
async fn test_replayed_first_message_gets_no_response() {
    let harness = Harness::start(&[], None).await;

    let mut machine = ClientHandshake::new(Arc::new(harness.identity.clone()), harness.fingerprint);
    let message1 = match machine.advance().unwrap() {
        Step::Send(message) => message,
        _ => panic!("client opens with a message"),
    };

    // Genuine first use gets message 2 back
    let mut first = TcpStream::connect(harness.addr).await.unwrap();
    first.write_all(&message1).await.unwrap();
    let mut reply = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(10), first.read(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert!(n > 0);

    // The same bytes again are silently dropped
    let mut replay = TcpStream::connect(harness.addr).await.unwrap();
    replay.write_all(&message1).await.unwrap();
    assert!(stays_open_and_silent(&mut replay, Duration::from_millis(1500)).await);
    assert_eq!(harness.server.stats().handshakes, 0);
}

#[tokio::test]
async fn test_random_input_gets_no_response() {
    let harness = Harness::start(&[], None).await;

    let mut stranger = TcpStream::connect(harness.addr).await.unwrap();
    let junk: [u8; 512] = shade_tunnel::crypto::random_array();
    stranger.write_all(&junk).await.unwrap();
    stranger.shutdown().await.unwrap();

    assert!(stays_open_and_silent(&mut stranger, Duration::from_millis(1500)).await);
    assert_eq!(harness.server.stats().rejected, 1);
}

#[tokio::test]
async fn test_full_length_garbage_held_open() {
    let harness = Harness::start(&[], None).await;

    // Long enough to be judged as a first handshake message
    let mut stranger = TcpStream::connect(harness.addr).await.unwrap();
    stranger.write_all(&[0x42u8; 1300]).await.unwrap();

    let started = std::time::Instant::now();
    assert!(stays_open_and_silent(&mut stranger, Duration::from_millis(1500)).await);
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(15), stranger.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_http_request_sees_web_server() {
    let harness = Harness::start(&[], None).await;

    let mut stranger = TcpStream::connect(harness.addr).await.unwrap();
    stranger
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stranger.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();

    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("Server: nginx"));
    assert_eq!(harness.server.stats().decoys, 1);
}

#[tokio::test]
async fn test_tunnel_over_tls() {
    let echo = echo_server().await;
    let alpn: Vec<String> = DEFAULT_ALPN.iter().map(|s| s.to_string()).collect();
    let tls = TlsServer::self_signed(&["localhost".to_string()], &alpn).unwrap();
    let harness = Harness::start(&[], Some(tls)).await;
    let client = harness.client("tls");

    for _ in 0..2 {
        let mut stream = client
            .connect(&TunnelTarget::PortMapping(echo.to_string()))
            .await
            .unwrap();
        assert_echo(&mut stream, b"wrapped twice").await;
    }

    let stats = harness.server.stats();
    assert_eq!(stats.handshakes, 1);
    assert_eq!(stats.resumptions, 1);
}
