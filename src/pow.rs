//! # Proof-of-Work Gate
//!
//! Optional anti-spam stamp on envelopes. A sender searches for a nonce such
//! that `SHA-256(basis)` has at least `difficulty` leading zero bits, where
//! the basis is the canonical serialization of
//!
//! ```text
//! { channel, from, id, message, nonce, origin, ts }
//! ```
//!
//! with object keys sorted at every level and absent fields rendered as
//! `null`. `ttl` and `relayedBy` are deliberately outside the basis so relays
//! can rewrite them without invalidating the stamp.
//!
//! Verification always uses the locally configured difficulty, never the
//! `difficulty` claimed in the stamp.
//!
//! ## Interop
//!
//! Scalars are rendered by `serde_json`. Integers and strings match other
//! JSON encoders byte for byte, but a float with an integral value renders
//! as `1.0` where JavaScript writes `1`. A stamp over such a message does not
//! verify across the two encoders. Unknown envelope fields are not hashed.

use std::collections::HashSet;

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::messages::{Envelope, PowStamp};

/// Number of bits in a SHA-256 digest; higher difficulties are unattainable.
pub const MAX_POW_DIFFICULTY: u32 = 256;

/// Which channels require a stamp.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PowPolicy {
    pub enabled: bool,
    pub difficulty: u32,
    /// Only the entry channel requires PoW (ignored when `required_channels` is set).
    pub require_entry: bool,
    pub entry_channel: Option<String>,
    /// Explicit allow-list of channels requiring PoW.
    pub required_channels: Option<HashSet<String>>,
}

impl PowPolicy {
    pub fn is_required(&self, channel: &str) -> bool {
        if !self.enabled || self.difficulty == 0 {
            return false;
        }
        if let Some(required) = &self.required_channels {
            return required.contains(channel);
        }
        if self.require_entry {
            return self.entry_channel.as_deref() == Some(channel);
        }
        true
    }

    /// Difficulty to mine for an outbound envelope on `channel`, if any.
    pub fn difficulty_for(&self, channel: &str) -> Option<u32> {
        self.is_required(channel).then_some(self.difficulty)
    }

    /// Inbound gate. `session_channel` is the channel the frame arrived on.
    pub fn admits(&self, envelope: &Envelope, session_channel: &str) -> bool {
        if !self.is_required(session_channel) {
            return true;
        }
        verify(envelope, self.difficulty)
    }
}

/// Sorted-key JSON rendering used for hashing.
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_stable(value, &mut out);
    out
}

fn write_stable(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_stable(&map[key], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Canonical PoW basis for `envelope` with the given nonce.
pub fn canonical_basis(envelope: &Envelope, nonce: u64) -> String {
    let basis = json!({
        "id": envelope.id,
        "channel": envelope.channel,
        "from": envelope.from,
        "origin": envelope.origin,
        "message": envelope.message,
        "ts": envelope.ts,
        "nonce": nonce,
    });
    stable_stringify(&basis)
}

pub fn digest(basis: &str) -> [u8; 32] {
    Sha256::digest(basis.as_bytes()).into()
}

pub fn count_leading_zero_bits(hash: &[u8; 32]) -> u32 {
    let mut zeros = 0u32;
    for byte in hash {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}

fn meets_difficulty(envelope: &Envelope, nonce: u64, difficulty: u32) -> bool {
    count_leading_zero_bits(&digest(&canonical_basis(envelope, nonce))) >= difficulty
}

/// Search nonces upward from zero until one meets `difficulty`.
///
/// CPU-bound and unbounded in time; callers run it on a blocking worker.
/// Returns `None` only for difficulties no digest can satisfy.
pub fn mine(envelope: &Envelope, difficulty: u32) -> Option<PowStamp> {
    if difficulty > MAX_POW_DIFFICULTY {
        return None;
    }
    let mut nonce = 0u64;
    loop {
        if meets_difficulty(envelope, nonce, difficulty) {
            return Some(PowStamp { nonce, difficulty });
        }
        nonce = nonce.wrapping_add(1);
    }
}

/// Check the envelope's stamp against the configured `difficulty`.
/// Fails closed when the stamp is missing or `difficulty` is zero.
pub fn verify(envelope: &Envelope, difficulty: u32) -> bool {
    let Some(stamp) = envelope.pow else {
        return false;
    };
    if difficulty == 0 {
        return false;
    }
    meets_difficulty(envelope, stamp.nonce, difficulty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn envelope(id: &str, channel: &str) -> Envelope {
        Envelope::new(
            id.to_string(),
            channel,
            Some(Identity::from_bytes([9u8; 32])),
            json!({"text": "hello", "n": [1, 2, 3]}),
            1_700_000_000_000,
            3,
        )
    }

    fn stamped(id: &str, channel: &str, difficulty: u32) -> Envelope {
        let mut env = envelope(id, channel);
        env.pow = mine(&env, difficulty);
        env
    }

    #[test]
    fn stable_stringify_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"d": null, "c": [true, "x"]}});
        assert_eq!(stable_stringify(&value), r#"{"a":{"c":[true,"x"],"d":null},"b":1}"#);
    }

    #[test]
    fn stable_stringify_escapes_keys_and_strings() {
        let value = json!({"q\"k": "line\nbreak"});
        assert_eq!(stable_stringify(&value), r#"{"q\"k":"line\nbreak"}"#);
    }

    #[test]
    fn basis_renders_absent_fields_as_null() {
        let env = Envelope::from_value(json!({})).unwrap();
        assert_eq!(
            canonical_basis(&env, 7),
            r#"{"channel":null,"from":null,"id":null,"message":null,"nonce":7,"origin":null,"ts":null}"#
        );
    }

    #[test]
    fn basis_ignores_ttl_and_relayer() {
        let a = envelope("id", "general");
        let mut b = a.clone();
        b.ttl = 0;
        b.relayed_by = Some("relay".into());
        assert_eq!(canonical_basis(&a, 1), canonical_basis(&b, 1));
    }

    #[test]
    fn basis_ignores_unknown_fields() {
        let a = envelope("id", "general");
        let mut b = a.clone();
        b.extra.insert("hint".into(), json!("carried"));
        assert_eq!(canonical_basis(&a, 1), canonical_basis(&b, 1));
    }

    #[test]
    fn integral_floats_render_with_fraction() {
        assert_eq!(stable_stringify(&json!({"n": 1.0, "m": 1})), r#"{"m":1,"n":1.0}"#);
    }

    #[test]
    fn leading_zero_bits() {
        let mut hash = [0xffu8; 32];
        assert_eq!(count_leading_zero_bits(&hash), 0);
        hash[0] = 0;
        hash[1] = 0x10;
        assert_eq!(count_leading_zero_bits(&hash), 11);
        assert_eq!(count_leading_zero_bits(&[0u8; 32]), 256);
    }

    #[test]
    fn mined_stamp_verifies() {
        let env = stamped("m-1", "general", 12);
        let stamp = env.pow.unwrap();
        assert_eq!(stamp.difficulty, 12);
        assert!(verify(&env, 12));
        assert!(verify(&env, 1));
    }

    #[test]
    fn mutations_invalidate_stamp() {
        let env = stamped("m-2", "general", 16);

        let mut changed = env.clone();
        changed.message = json!({"text": "hellO", "n": [1, 2, 3]});
        assert!(!verify(&changed, 16));

        let mut changed = env.clone();
        changed.ts = Some(1_700_000_000_001);
        assert!(!verify(&changed, 16));

        let mut changed = env.clone();
        changed.channel = Some("other".into());
        assert!(!verify(&changed, 16));
    }

    #[test]
    fn missing_stamp_or_zero_difficulty_fails_closed() {
        assert!(!verify(&envelope("x", "general"), 8));
        let env = stamped("y", "general", 4);
        assert!(!verify(&env, 0));
    }

    #[test]
    fn unattainable_difficulty_is_refused() {
        assert_eq!(mine(&envelope("z", "general"), MAX_POW_DIFFICULTY + 1), None);
    }

    #[test]
    fn general_channel_difficulty_eight_rejects_nonce_bit_flip() {
        let policy = PowPolicy { enabled: true, difficulty: 8, ..Default::default() };

        // Mining returns the smallest passing nonce, so clearing one of its
        // set bits yields a smaller nonce that is guaranteed to fail.
        let env = (0..64)
            .map(|i| stamped(&format!("general-{i}"), "general", 8))
            .find(|env| env.pow.is_some_and(|stamp| stamp.nonce > 0))
            .unwrap();
        assert!(policy.admits(&env, "general"));

        let mut tampered = env.clone();
        let stamp = tampered.pow.as_mut().unwrap();
        stamp.nonce &= stamp.nonce - 1;
        assert!(!policy.admits(&tampered, "general"));

        let mut unstamped = env;
        unstamped.pow = None;
        assert!(!policy.admits(&unstamped, "general"));
    }

    #[test]
    fn policy_applicability() {
        let mut policy = PowPolicy { enabled: true, difficulty: 4, ..Default::default() };
        assert!(policy.is_required("anything"));

        policy.require_entry = true;
        policy.entry_channel = Some("lobby".into());
        assert!(policy.is_required("lobby"));
        assert!(!policy.is_required("general"));

        policy.required_channels = Some(["general".to_string()].into_iter().collect());
        assert!(policy.is_required("general"));
        assert!(!policy.is_required("lobby"));

        policy.difficulty = 0;
        assert!(!policy.is_required("general"));

        let disabled = PowPolicy { enabled: false, difficulty: 8, ..Default::default() };
        assert!(!disabled.is_required("general"));
        assert!(disabled.admits(&envelope("x", "general"), "general"));
    }
}
