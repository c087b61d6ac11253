//! Bridges a tunnel channel to a local byte stream
//!
//! Inbound frames are written to the local side, decoys dropped, and a Close
//! frame shuts the local write side down. Local bytes go out as data frames,
//! optionally held for a random forwarding delay; while the local side is
//! quiet, decoy frames are injected on a randomized timer. Local EOF sends
//! Close. The relay ends when both directions have closed, on the first
//! error, or once neither direction carried data for the idle timeout.

use super::channel::{TunnelReader, TunnelWriter};
use super::frame::{FrameType, MAX_PAYLOAD_SIZE};
use super::TunnelError;
use crate::obfuscation::{forward_delay, DecoyScheduler, ObfuscationConfig};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

/// Buffer size of the in-process pipe handed out by [`spawn_relay`]
const PIPE_CAPACITY: usize = 64 * 1024;

/// Relay behaviour
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayOptions {
    pub obfuscation: ObfuscationConfig,
    /// Close the relay after this long without data in either direction
    pub idle_timeout: Option<Duration>,
}

/// Bytes moved by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Tunnel to local
    pub bytes_in: u64,
    /// Local to tunnel
    pub bytes_out: u64,
}

/// Relay between the tunnel halves and `local` until both sides close
pub async fn relay<R, W, L>(
    mut reader: TunnelReader<R>,
    mut writer: TunnelWriter<W>,
    local: L,
    options: RelayOptions,
) -> Result<RelayStats, TunnelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    L: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_r, mut local_w) = tokio::io::split(local);
    let last_data = Mutex::new(Instant::now());
    let touch = || *last_data.lock() = Instant::now();

    let inbound = async {
        let mut bytes = 0u64;
        while let Some(frame) = reader.read_frame().await? {
            match frame.frame_type {
                FrameType::Data => {
                    touch();
                    local_w.write_all(&frame.payload).await?;
                    bytes += frame.payload.len() as u64;
                }
                FrameType::Decoy => trace!("Dropped decoy frame"),
                FrameType::Close => break,
            }
        }
        let _ = local_w.shutdown().await;
        Ok::<u64, TunnelError>(bytes)
    };

    let outbound = async {
        let shaping = options.obfuscation;
        let mut scheduler = DecoyScheduler::new();
        let mut buf = vec![0u8; MAX_PAYLOAD_SIZE];
        let mut bytes = 0u64;
        loop {
            let decoy_after = scheduler.next_interval();
            tokio::select! {
                read = local_r.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        writer.send_close().await?;
                        break;
                    }
                    touch();
                    let delay = forward_delay(shaping.write_delay_ms);
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    writer.send_data(&buf[..n]).await?;
                    scheduler.record(n);
                    bytes += n as u64;
                }
                _ = sleep(decoy_after), if shaping.decoy_packets => {
                    writer.send_decoy().await?;
                }
            }
        }
        Ok::<u64, TunnelError>(bytes)
    };

    let both = async { tokio::try_join!(inbound, outbound) };

    let (bytes_in, bytes_out) = match options.idle_timeout {
        Some(idle) => {
            let watchdog = async {
                loop {
                    // An idle period past the clock's range never expires
                    let Some(deadline) = last_data.lock().checked_add(idle) else {
                        std::future::pending::<()>().await;
                        break;
                    };
                    if Instant::now() >= deadline {
                        break;
                    }
                    tokio::time::sleep_until(deadline).await;
                }
            };
            tokio::select! {
                result = both => result?,
                _ = watchdog => {
                    debug!("Relay idle for {:?}, closing", idle);
                    return Err(TunnelError::IdleTimeout);
                }
            }
        }
        None => both.await?,
    };
    let _ = writer.shutdown().await;

    Ok(RelayStats { bytes_in, bytes_out })
}

/// Run a relay in the background and hand back the local end as a stream
///
/// Used where the local side is produced in-process, such as the server's
/// SOCKS5 negotiation running over the tunnel.
pub fn spawn_relay<R, W>(
    reader: TunnelReader<R>,
    writer: TunnelWriter<W>,
    options: RelayOptions,
) -> DuplexStream
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
    tokio::spawn(async move {
        match relay(reader, writer, theirs, options).await {
            Ok(stats) => debug!("Relay finished: {} in, {} out", stats.bytes_in, stats.bytes_out),
            Err(e) => debug!("Relay ended: {}", e),
        }
    });
    ours
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::PaddingConfig;
    use crate::protocol::test_pair;
    use crate::tunnel::{open_channel, Side};

    /// Client and server channel halves over an in-memory socket
    fn channel_pair(
        padding: PaddingConfig,
    ) -> (
        (TunnelReader<tokio::io::ReadHalf<DuplexStream>>, TunnelWriter<tokio::io::WriteHalf<DuplexStream>>),
        (TunnelReader<tokio::io::ReadHalf<DuplexStream>>, TunnelWriter<tokio::io::WriteHalf<DuplexStream>>),
    ) {
        let (client_keys, server_keys) = test_pair();
        let (c, s) = tokio::io::duplex(256 * 1024);
        let (cr, cw) = tokio::io::split(c);
        let (sr, sw) = tokio::io::split(s);
        let client = open_channel(Side::Client, &client_keys, &client_keys.mint(), cr, cw, padding).unwrap();
        let server = open_channel(Side::Server, &server_keys, &server_keys.mint(), sr, sw, padding).unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_relay_both_directions() {
        let ((cr, cw), (sr, sw)) = channel_pair(PaddingConfig { max_padding: 64 });
        let options = RelayOptions {
            obfuscation: ObfuscationConfig::default().with_write_delay(5),
            idle_timeout: None,
        };

        let mut client_app = spawn_relay(cr, cw, options);
        let mut server_app = spawn_relay(sr, sw, options);

        client_app.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server_app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server_app.write_all(b"pong").await.unwrap();
        server_app.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client_app.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"pong");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_relay() {
        let ((cr, cw), (sr, sw)) = channel_pair(PaddingConfig::disabled());
        let options = RelayOptions {
            obfuscation: ObfuscationConfig::disabled().with_decoys(true),
            idle_timeout: Some(Duration::from_secs(30)),
        };

        let (_client_app, theirs) = tokio::io::duplex(1024);
        let relay_task = tokio::spawn(relay(cr, cw, theirs, options));
        let _server_app = spawn_relay(sr, sw, RelayOptions::default());

        let result = relay_task.await.unwrap();
        assert!(matches!(result, Err(TunnelError::IdleTimeout)));
    }

    #[tokio::test]
    async fn test_unbounded_idle_timeout_relays() {
        let ((cr, cw), (sr, sw)) = channel_pair(PaddingConfig::disabled());
        let options = RelayOptions {
            obfuscation: ObfuscationConfig::disabled(),
            idle_timeout: Some(Duration::from_secs(u64::MAX)),
        };

        let (mut client_app, theirs) = tokio::io::duplex(1024);
        let relay_task = tokio::spawn(relay(cr, cw, theirs, options));
        let mut server_app = spawn_relay(sr, sw, options);

        client_app.write_all(b"still here").await.unwrap();
        client_app.shutdown().await.unwrap();
        let mut buf = Vec::new();
        server_app.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"still here");
        server_app.shutdown().await.unwrap();

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.bytes_out, 10);
    }
}
