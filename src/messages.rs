//! # Wire Envelope
//!
//! Every sidechannel message is a JSON object carried over the channel's
//! negotiated multiplexer protocol:
//!
//! ```text
//! { "type": "sidechannel", "id": "...", "channel": "general",
//!   "from": "<hex>", "origin": "<hex>", "message": <any JSON>,
//!   "ts": 1700000000000, "ttl": 3,
//!   "pow": { "nonce": 41, "difficulty": 8 },      // optional
//!   "relayedBy": "<hex>" }                         // set by relays
//! ```
//!
//! Unknown top-level fields are kept in [`Envelope::extra`] and written back
//! out, so relays forward them unchanged.
//!
//! Inbound frames come from untrusted peers, so parsing is lenient about
//! absent fields (they take defaults) but strict about shape: a frame that is
//! not an object, or whose `pow` is not `{nonce: u64, difficulty: u32}`, is
//! rejected as malformed.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};

use crate::identity::Identity;

/// Constant `type` tag of every envelope.
pub const ENVELOPE_TYPE: &str = "sidechannel";

/// `message.control` value of a channel open request.
pub const CONTROL_OPEN_CHANNEL: &str = "open_channel";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowStamp {
    pub nonce: u64,
    pub difficulty: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    /// Hex identity of the peer that built this envelope.
    #[serde(default)]
    pub from: Option<String>,
    /// Hex identity of the original author. Never rewritten by relays.
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub message: Value,
    /// Creation time, milliseconds since Unix epoch.
    #[serde(default)]
    pub ts: Option<u64>,
    /// Remaining relay hops.
    #[serde(default, deserialize_with = "lenient_ttl")]
    pub ttl: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pow: Option<PowStamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relayed_by: Option<String>,
    /// Fields this peer does not know. Carried through relays untouched and
    /// left out of the proof-of-work basis.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_kind() -> String {
    ENVELOPE_TYPE.to_string()
}

/// Non-integer or null hop counts are treated as exhausted.
fn lenient_ttl<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_i64().unwrap_or(0))
}

impl Envelope {
    /// Build a fresh envelope authored by `author`.
    pub fn new(
        id: String,
        channel: &str,
        author: Option<Identity>,
        message: Value,
        ts: u64,
        ttl: i64,
    ) -> Self {
        let author = author.map(Identity::to_hex);
        Self {
            kind: default_kind(),
            id: Some(id),
            channel: Some(channel.to_string()),
            from: author.clone(),
            origin: author,
            message,
            ts: Some(ts),
            ttl,
            pow: None,
            relayed_by: None,
            extra: Map::new(),
        }
    }

    /// Parse an inbound frame.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Serialized JSON size in bytes.
    pub fn encoded_len(&self) -> Result<usize, serde_json::Error> {
        serde_json::to_vec(self).map(|bytes| bytes.len())
    }

    /// Key used for duplicate suppression.
    ///
    /// Uses `id` when present. Otherwise falls back to
    /// `"{from}:{ts}:{channel}"`, which is coarser than a real id: two
    /// id-less messages from one sender in the same millisecond collide.
    pub fn dedup_key(&self, session_channel: &str) -> String {
        if let Some(id) = &self.id {
            return id.clone();
        }
        format!(
            "{}:{}:{}",
            self.from.as_deref().unwrap_or("unknown"),
            self.ts.unwrap_or(0),
            self.channel.as_deref().unwrap_or(session_channel),
        )
    }

    /// Control request carried in `message`, if any.
    pub fn control_request(&self) -> Option<ControlRequest> {
        ControlRequest::parse(&self.message)
    }
}

/// In-band control messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    /// Ask receivers to join `channel`. The name is untrimmed as received.
    OpenChannel { channel: String },
}

impl ControlRequest {
    pub fn parse(message: &Value) -> Option<Self> {
        let control = message.get("control")?.as_str()?;
        match control {
            CONTROL_OPEN_CHANNEL => {
                let channel = message.get("channel")?.as_str()?;
                Some(Self::OpenChannel { channel: channel.to_string() })
            }
            _ => None,
        }
    }

    pub fn to_message(&self) -> Value {
        match self {
            Self::OpenChannel { channel } => json!({
                "control": CONTROL_OPEN_CHANNEL,
                "channel": channel,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new(
            "id-1".to_string(),
            "general",
            Some(Identity::from_bytes([3u8; 32])),
            json!({"text": "hi"}),
            1_700_000_000_000,
            3,
        )
    }

    #[test]
    fn envelope_wire_shape() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["type"], "sidechannel");
        assert_eq!(value["channel"], "general");
        assert_eq!(value["ttl"], 3);
        assert_eq!(value["from"], value["origin"]);
        assert!(value.get("pow").is_none());
        assert!(value.get("relayedBy").is_none());
    }

    #[test]
    fn anonymous_sender_serializes_null() {
        let env = Envelope::new("x".into(), "c", None, Value::Null, 1, 0);
        let value = serde_json::to_value(env).unwrap();
        assert!(value["from"].is_null());
        assert!(value["origin"].is_null());
    }

    #[test]
    fn relayed_by_uses_camel_case() {
        let mut env = sample();
        env.relayed_by = Some("abc".into());
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["relayedBy"], "abc");
        let back = Envelope::from_value(value).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn unknown_fields_survive_roundtrip() {
        let env = Envelope::from_value(json!({
            "id": "x",
            "ttl": 2,
            "hint": {"lang": "en"},
        }))
        .unwrap();
        assert_eq!(env.extra.get("hint"), Some(&json!({"lang": "en"})));
        assert!(!env.extra.contains_key("ttl"));

        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["hint"], json!({"lang": "en"}));
        assert_eq!(value["ttl"], 2);
    }

    #[test]
    fn lenient_parse_fills_defaults() {
        let env = Envelope::from_value(json!({"message": "hello"})).unwrap();
        assert_eq!(env.kind, ENVELOPE_TYPE);
        assert_eq!(env.id, None);
        assert_eq!(env.ttl, 0);
        assert_eq!(env.message, json!("hello"));
    }

    #[test]
    fn non_integer_ttl_is_exhausted() {
        let env = Envelope::from_value(json!({"ttl": "lots"})).unwrap();
        assert_eq!(env.ttl, 0);
        let env = Envelope::from_value(json!({"ttl": null})).unwrap();
        assert_eq!(env.ttl, 0);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(Envelope::from_value(json!("not an object")).is_err());
        assert!(Envelope::from_value(json!({"pow": {"nonce": "7", "difficulty": 8}})).is_err());
    }

    #[test]
    fn dedup_key_prefers_id() {
        assert_eq!(sample().dedup_key("general"), "id-1");
    }

    #[test]
    fn dedup_key_fallback_combines_sender_ts_channel() {
        let env = Envelope::from_value(json!({"from": "aa", "ts": 42})).unwrap();
        assert_eq!(env.dedup_key("general"), "aa:42:general");
        let env = Envelope::from_value(json!({})).unwrap();
        assert_eq!(env.dedup_key("general"), "unknown:0:general");
    }

    #[test]
    fn control_request_roundtrip() {
        let request = ControlRequest::OpenChannel { channel: "news".into() };
        let parsed = ControlRequest::parse(&request.to_message());
        assert_eq!(parsed, Some(request));
    }

    #[test]
    fn control_request_requires_string_channel() {
        assert_eq!(ControlRequest::parse(&json!({"control": "open_channel", "channel": 5})), None);
        let unknown = json!({"control": "close_channel", "channel": "x"});
        assert_eq!(ControlRequest::parse(&unknown), None);
        assert_eq!(ControlRequest::parse(&json!("open_channel")), None);
    }
}
