//! # Peer Identity and Message Ids
//!
//! - [`Identity`]: 32-byte public key the host exposes as this peer's identifier
//! - [`IdGenerator`]: injected source of envelope ids
//!
//! ## Identity Model
//!
//! Sidechannel never owns keys. The host process supplies its public key
//! through [`IdentityProvider`](crate::protocols::IdentityProvider); the
//! hex encoding of that key is written into `from`, `origin` and `relayedBy`
//! of every envelope this peer produces, and is the key used in diagnostics
//! about remote peers.
//!
//! ## Message Ids
//!
//! Envelope ids only need to be unique per sender instance: they drive the
//! dedup cache, not any security decision. [`RandomIds`] draws a random
//! per-process prefix once from the OS CSPRNG and appends a counter, so id
//! generation is deterministic after construction and never touches global
//! randomness on the send path.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns current time as milliseconds since Unix epoch.
/// Used for envelope `ts` fields.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short form for log lines (first 8 bytes).
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hex key of an optional identity, or `"unknown"` when the host has none.
pub(crate) fn key_or_unknown(identity: Option<Identity>) -> String {
    identity.map(Identity::to_hex).unwrap_or_else(|| "unknown".to_string())
}

// ============================================================================
// Envelope Id Generation
// ============================================================================

/// Source of envelope ids.
///
/// Implementations must return a distinct id for every call within one
/// process. `from` is the sender's hex identity (or `"anon"`), `ts` the
/// envelope timestamp in milliseconds.
pub trait IdGenerator: Send + 'static {
    fn next_id(&mut self, from: &str, ts: u64) -> String;
}

/// Default generator: `"{from}:{ts}:{prefix}{counter}"`.
#[derive(Debug, Clone)]
pub struct RandomIds {
    prefix: String,
    counter: u64,
}

impl RandomIds {
    /// Draw a fresh 8-byte prefix from the OS CSPRNG.
    ///
    /// Falls back to a time-derived prefix if the CSPRNG is unavailable;
    /// ids stay unique within the process either way because of the counter.
    pub fn new() -> Self {
        let mut seed = [0u8; 8];
        let prefix = match getrandom::getrandom(&mut seed) {
            Ok(()) => hex::encode(seed),
            Err(_) => format!("{:016x}", now_ms()),
        };
        Self::with_prefix(prefix)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), counter: 0 }
    }
}

impl Default for RandomIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for RandomIds {
    fn next_id(&mut self, from: &str, ts: u64) -> String {
        self.counter = self.counter.wrapping_add(1);
        format!("{}:{}:{}{:x}", from, ts, self.prefix, self.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hex_roundtrip() {
        let id = Identity::from_bytes([7u8; 32]);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Identity::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn identity_hex_rejects_invalid() {
        assert!(Identity::from_hex("zz").is_err());
        assert!(Identity::from_hex(&"ab".repeat(16)).is_err());
    }

    #[test]
    fn key_or_unknown_falls_back() {
        assert_eq!(key_or_unknown(None), "unknown");
        let id = Identity::from_bytes([1u8; 32]);
        assert_eq!(key_or_unknown(Some(id)), id.to_hex());
    }

    #[test]
    fn random_ids_are_unique_within_generator() {
        let mut ids = RandomIds::with_prefix("abcd");
        let a = ids.next_id("anon", 1000);
        let b = ids.next_id("anon", 1000);
        assert_ne!(a, b);
        assert!(a.starts_with("anon:1000:abcd"));
    }

    #[test]
    fn random_ids_prefixes_differ_between_instances() {
        let mut a = RandomIds::new();
        let mut b = RandomIds::new();
        assert_ne!(a.next_id("x", 1), b.next_id("x", 1));
    }
}
