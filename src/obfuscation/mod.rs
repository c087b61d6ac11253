//! Traffic obfuscation layer
//!
//! Provides:
//! - Random padding (handshake tails derived from MAC bits, data-frame padding)
//! - Handshake write splitting with jittered delays
//! - Decoy frames on idle relays and randomized forwarding delay
//!
//! None of this adds secrecy. It removes the fixed sizes and regular timing
//! a classifier would otherwise match on.

mod padding;
mod timing;

pub use padding::{
    handshake_tail_len, random_padding, PaddingConfig, DEFAULT_MAX_PADDING, MAX_HANDSHAKE_TAIL,
};
pub use timing::{
    close_delay, forward_delay, retry_jitter, watchdog_timeout, write_split, DecoyScheduler,
};

/// Traffic shaping applied to one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObfuscationConfig {
    /// Split handshake writes into jittered segments
    pub split_handshake: bool,
    /// Inject decoy frames while a relay direction is idle
    pub decoy_packets: bool,
    /// Upper bound of the forwarding delay (0 disables it)
    pub write_delay_ms: u64,
    /// Data-frame padding
    pub padding: PaddingConfig,
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            split_handshake: true,
            decoy_packets: true,
            write_delay_ms: 0,
            padding: PaddingConfig::default(),
        }
    }
}

impl ObfuscationConfig {
    /// No splitting, decoys, delay or padding (for testing)
    pub fn disabled() -> Self {
        Self {
            split_handshake: false,
            decoy_packets: false,
            write_delay_ms: 0,
            padding: PaddingConfig::disabled(),
        }
    }

    pub fn with_decoys(mut self, enabled: bool) -> Self {
        self.decoy_packets = enabled;
        self
    }

    pub fn with_write_delay(mut self, max_ms: u64) -> Self {
        self.write_delay_ms = max_ms;
        self
    }

    pub fn with_max_padding(mut self, max_padding: usize) -> Self {
        self.padding = PaddingConfig { max_padding };
        self
    }
}
