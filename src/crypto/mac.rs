//! Message authentication and digests
//!
//! HMAC-SHA256 and SHA-256 over multi-part inputs, plus helpers for the
//! truncated tags used on the wire.

use ring::{digest, hmac};
use subtle::ConstantTimeEq;

/// Length of a full HMAC-SHA256 / SHA-256 output
pub const MAC_LEN: usize = 32;

/// HMAC-SHA256 over the concatenation of `parts`
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; MAC_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let mut ctx = hmac::Context::with_key(&key);
    for part in parts {
        ctx.update(part);
    }
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(ctx.sign().as_ref());
    out
}

/// SHA-256 over the concatenation of `parts`
pub fn sha256(parts: &[&[u8]]) -> [u8; MAC_LEN] {
    let mut ctx = digest::Context::new(&digest::SHA256);
    for part in parts {
        ctx.update(part);
    }
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(ctx.finish().as_ref());
    out
}

/// Constant-time comparison of two byte strings
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// 64-bit identifier of a truncated tag, used by the replay guards
pub fn tag_id(tag: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = tag.len().min(8);
    buf[..n].copy_from_slice(&tag[..n]);
    u64::from_be_bytes(buf)
}
