//! Async driver for the handshake state machines
//!
//! Reads each message's fixed part, lets the machine verify it, discards the
//! tail, then runs the expensive step on the crypto pool and writes whatever
//! the machine produced. The event loop never blocks on KEM work.

use super::{CryptoPool, HandshakeError, HandshakeMachine, SessionKeys, Step};
use crate::obfuscation::write_split;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::trace;

/// Write-side behaviour of the handshake
#[derive(Debug, Clone, Copy)]
pub struct HandshakeOptions {
    /// Split messages into jittered segments
    pub split_writes: bool,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self { split_writes: true }
    }
}

/// Run `machine` to completion over `stream`
///
/// Returns the finished machine alongside the session keys so the caller
/// can inspect it (the server reads the peer id from it).
pub async fn run_handshake<M, S>(
    mut machine: M,
    stream: &mut S,
    pool: &CryptoPool,
    options: HandshakeOptions,
) -> Result<(M, SessionKeys), HandshakeError>
where
    M: HandshakeMachine,
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    loop {
        let fixed_len = machine.expected_len();
        if fixed_len > 0 {
            let mut fixed = vec![0u8; fixed_len];
            stream.read_exact(&mut fixed).await?;
            let tail = machine.check(&fixed)?;

            let mut tail_buf = vec![0u8; tail];
            stream.read_exact(&mut tail_buf).await?;
            trace!("{}: accepted {} + {} bytes", machine.state_name(), fixed_len, tail);
        }

        let (returned, step) = pool
            .run(move || {
                let step = machine.advance();
                (machine, step)
            })
            .await?;
        machine = returned;

        match step? {
            Step::Send(message) => {
                write_split(stream, &message, options.split_writes).await?;
            }
            Step::Complete { reply, keys } => {
                if let Some(reply) = reply {
                    write_split(stream, &reply, options.split_writes).await?;
                }
                return Ok((machine, keys));
            }
        }
    }
}
