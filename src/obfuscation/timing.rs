//! Timing obfuscation
//!
//! Censors fingerprint tunnels by packet sizes and inter-packet timing.
//! This module splits handshake writes into jittered segments, schedules
//! decoy frames while a relay is idle, and supplies the randomized delays
//! used around connection setup and teardown.

use rand::Rng;
use std::io;
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, Instant};

/// Delay between split segments, in milliseconds
pub const SEGMENT_DELAY_MS: RangeInclusive<u64> = 10..=500;

/// Most segments a split write produces
pub const MAX_SEGMENTS: usize = 5;

/// Delay before closing a rejected connection, in milliseconds
pub const CLOSE_DELAY_MS: RangeInclusive<u64> = 2_000..=10_000;

/// Delay before a client retries a failed handshake, in milliseconds
pub const RETRY_JITTER_MS: RangeInclusive<u64> = 0..=3_000;

/// Handshake watchdog range, in milliseconds
pub const WATCHDOG_MS: RangeInclusive<u64> = 15_000..=30_000;

/// Bytes per decoy window above which traffic counts as busy
pub const BUSY_THRESHOLD: u64 = 64 * 1024;

fn random_millis(range: RangeInclusive<u64>) -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(range))
}

/// Write `data`, split two times in three into random segments with
/// jittered pauses between them
pub async fn write_split<S>(stream: &mut S, data: &[u8], enabled: bool) -> io::Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let segments = if enabled { split_sizes(data.len()) } else { Vec::new() };

    if segments.len() < 2 {
        stream.write_all(data).await?;
        return stream.flush().await;
    }

    let mut offset = 0;
    for (i, size) in segments.iter().enumerate() {
        if i > 0 {
            sleep(random_millis(SEGMENT_DELAY_MS)).await;
        }
        stream.write_all(&data[offset..offset + size]).await?;
        stream.flush().await?;
        offset += size;
    }
    Ok(())
}

/// Segment sizes for one write, or empty when it goes out whole
fn split_sizes(len: usize) -> Vec<usize> {
    let mut rng = rand::thread_rng();
    if len < 2 || rng.gen_range(0..3) == 0 {
        return Vec::new();
    }

    let count = rng.gen_range(2..=MAX_SEGMENTS.min(len));
    let mut cuts: Vec<usize> = Vec::with_capacity(count + 1);
    while cuts.len() < count - 1 {
        let cut = rng.gen_range(1..len);
        if !cuts.contains(&cut) {
            cuts.push(cut);
        }
    }
    cuts.sort_unstable();
    cuts.push(len);

    let mut prev = 0;
    cuts.into_iter()
        .map(|cut| {
            let size = cut - prev;
            prev = cut;
            size
        })
        .collect()
}

/// Pause before closing a connection that failed classification
pub fn close_delay() -> Duration {
    random_millis(CLOSE_DELAY_MS)
}

/// Pause before the client retries a handshake
pub fn retry_jitter() -> Duration {
    random_millis(RETRY_JITTER_MS)
}

/// Handshake watchdog for one attempt
pub fn watchdog_timeout() -> Duration {
    random_millis(WATCHDOG_MS)
}

/// Hold time for relayed bytes, `0..=max_ms`
pub fn forward_delay(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    random_millis(0..=max_ms)
}

/// Decides when an idle relay direction emits its next decoy frame
#[derive(Debug)]
pub struct DecoyScheduler {
    window_start: Instant,
    window_bytes: u64,
    busy: bool,
}

impl DecoyScheduler {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
            busy: false,
        }
    }

    /// Account for relayed bytes
    pub fn record(&mut self, bytes: usize) {
        self.roll_window();
        self.window_bytes += bytes as u64;
        if self.window_bytes >= BUSY_THRESHOLD {
            self.busy = true;
        }
    }

    fn roll_window(&mut self) {
        if self.window_start.elapsed() >= Duration::from_secs(4) {
            self.busy = self.window_bytes >= BUSY_THRESHOLD;
            self.window_bytes = 0;
            self.window_start = Instant::now();
        }
    }

    /// Whether recent throughput was high
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Time until the next decoy: up to 2s when busy, 4s otherwise
    pub fn next_interval(&mut self) -> Duration {
        self.roll_window();
        let max = if self.busy { 2_000 } else { 4_000 };
        // Zero would spin the idle timer
        random_millis(1..=max)
    }
}

impl Default for DecoyScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_split_sizes_sum() {
        for len in [2usize, 3, 10, 1184, 3000] {
            for _ in 0..50 {
                let sizes = split_sizes(len);
                if sizes.is_empty() {
                    continue;
                }
                assert!(sizes.len() >= 2 && sizes.len() <= MAX_SEGMENTS);
                assert!(sizes.iter().all(|&s| s > 0));
                assert_eq!(sizes.iter().sum::<usize>(), len);
            }
        }
        assert!(split_sizes(1).is_empty());
    }

    #[test]
    fn test_split_probability() {
        let split = (0..3000).filter(|_| !split_sizes(100).is_empty()).count();
        // Expected 2000
        assert!((1700..2300).contains(&split), "split {split} of 3000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_split_delivers_everything() {
        let data: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        let (mut a, mut b) = tokio::io::duplex(8192);

        for _ in 0..5 {
            write_split(&mut a, &data, true).await.unwrap();
            let mut out = vec![0u8; data.len()];
            b.read_exact(&mut out).await.unwrap();
            assert_eq!(out, data);
        }
    }

    #[test]
    fn test_delay_ranges() {
        for _ in 0..100 {
            let d = close_delay();
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(10));
            assert!(retry_jitter() <= Duration::from_secs(3));
            let w = watchdog_timeout();
            assert!(w >= Duration::from_secs(15) && w <= Duration::from_secs(30));
            assert!(forward_delay(20) <= Duration::from_millis(20));
        }
        assert_eq!(forward_delay(0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decoy_interval_shrinks_when_busy() {
        let mut scheduler = DecoyScheduler::new();
        assert!(!scheduler.is_busy());
        for _ in 0..20 {
            assert!(scheduler.next_interval() <= Duration::from_secs(4));
        }

        scheduler.record(BUSY_THRESHOLD as usize);
        assert!(scheduler.is_busy());
        for _ in 0..20 {
            assert!(scheduler.next_interval() <= Duration::from_secs(2));
        }

        // A quiet window clears the busy flag
        tokio::time::advance(Duration::from_secs(5)).await;
        scheduler.record(0);
        tokio::time::advance(Duration::from_secs(5)).await;
        scheduler.record(0);
        assert!(!scheduler.is_busy());
    }
}
