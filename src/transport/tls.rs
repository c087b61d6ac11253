//! TLS wrapping for port unification
//!
//! The server terminates TLS on the same port as the raw protocol: when the
//! first bytes of a connection look like a TLS record, the socket goes
//! through the acceptor and classification starts again on the decrypted
//! stream. Certificates come from PEM files or are generated self-signed.
//!
//! Clients reaching a `tls://` URL accept whatever certificate the server
//! presents. TLS is camouflage here; peer authentication happens in the
//! tunnel handshake.

use super::TransportError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring as ring_provider, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::info;

/// ALPN protocols offered and accepted, in browser order
pub const DEFAULT_ALPN: &[&str] = &["h2", "http/1.1"];

/// TLS record type of a handshake message
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Whether `prefix` starts like a TLS handshake record
///
/// Needs three bytes: content type, then a `3.x` record version.
pub fn looks_like_tls(prefix: &[u8]) -> bool {
    prefix.len() >= 3 && prefix[0] == CONTENT_TYPE_HANDSHAKE && prefix[1] == 0x03 && prefix[2] <= 0x04
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring_provider::default_provider())
}

fn alpn_list(alpn: &[String]) -> Vec<Vec<u8>> {
    alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
}

/// Server-side TLS acceptor
#[derive(Clone)]
pub struct TlsServer {
    acceptor: TlsAcceptor,
}

impl TlsServer {
    fn build(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        alpn: &[String],
    ) -> Result<Self, TransportError> {
        let mut config = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::Tls(format!("Failed to build TLS server config: {}", e)))?;
        config.alpn_protocols = alpn_list(alpn);

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Load a certificate chain and private key from PEM files
    pub fn from_pem(cert_path: &Path, key_path: &Path, alpn: &[String]) -> Result<Self, TransportError> {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        info!("TLS enabled with cert: {}", cert_path.display());
        Self::build(certs, key, alpn)
    }

    /// Generate a self-signed certificate for `names`
    pub fn self_signed(names: &[String], alpn: &[String]) -> Result<Self, TransportError> {
        let certified = rcgen::generate_simple_self_signed(names.to_vec())
            .map_err(|e| TransportError::Tls(format!("Failed to generate certificate: {}", e)))?;
        let cert = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
        info!("TLS enabled with self-signed certificate for {:?}", names);
        Self::build(vec![cert], key, alpn)
    }

    /// Run the server side of a TLS handshake on `stream`
    pub async fn accept<S>(&self, stream: S) -> Result<server::TlsStream<S>, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.acceptor
            .accept(stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))
    }
}

/// Load TLS certificate chain from PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("Failed to parse PEM certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    info!("Loaded {} certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

/// Load TLS private key from PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut file)
        .map_err(|e| TransportError::Tls(format!("Failed to parse PEM private key: {}", e)))?
        .ok_or_else(|| TransportError::Tls(format!("No private key found in {}", path.display())))
}

/// Accepts any server certificate while still checking handshake signatures
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Client-side TLS connector
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
}

impl TlsClient {
    pub fn new(alpn: &[String]) -> Result<Self, TransportError> {
        let provider = provider();
        let mut config = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth();
        config.alpn_protocols = alpn_list(alpn);

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Run the client side of a TLS handshake, sending `host` as SNI
    pub async fn connect<S>(&self, host: &str, stream: S) -> Result<client::TlsStream<S>, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| TransportError::Tls(format!("Invalid SNI: {}", e)))?;
        self.connector
            .connect(server_name, stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn alpn() -> Vec<String> {
        DEFAULT_ALPN.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tls_detection() {
        assert!(looks_like_tls(&[0x16, 0x03, 0x01, 0x02, 0x00]));
        assert!(!looks_like_tls(&[0x16, 0x03]));
        assert!(!looks_like_tls(b"GET / HTTP/1.1"));
        assert!(!looks_like_tls(&[0x17, 0x03, 0x03]));
    }

    #[tokio::test]
    async fn test_self_signed_round_trip() {
        let server = TlsServer::self_signed(&["localhost".to_string()], &alpn()).unwrap();
        let client = TlsClient::new(&alpn()).unwrap();
        let (a, b) = tokio::io::duplex(64 * 1024);

        let server_task = tokio::spawn(async move {
            let mut stream = server.accept(b).await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
            let (_, conn) = stream.get_ref();
            conn.alpn_protocol().map(|p| p.to_vec())
        });

        let mut stream = client.connect("localhost", a).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        assert_eq!(server_task.await.unwrap(), Some(b"h2".to_vec()));
    }
}
