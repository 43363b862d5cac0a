//! # Channel Registry
//!
//! Maps human-readable channel names to the discovery topic and the
//! multiplexer protocol used to carry them.
//!
//! | Field | Derivation |
//! |-------|------------|
//! | `topic` | `BLAKE3("sidechannel-topic-v1:" \|\| name)` |
//! | `protocol` | `"sidechannel/" + name` |
//!
//! Both are pure functions of the trimmed name, so every process that
//! registers the same name meets on the same topic and protocol.
//!
//! ## Interop
//!
//! The topic is a domain-separated hash. Peers that derive topics by filling
//! a 32-byte buffer with the raw name bytes land on different topics, so
//! discovery is only shared with peers using this derivation. The protocol
//! name is unaffected.

use std::collections::HashMap;

/// Domain separation prefix for topic derivation.
const TOPIC_HASH_DOMAIN: &[u8] = b"sidechannel-topic-v1:";

/// Prefix of the per-channel multiplexer protocol name.
pub const PROTOCOL_PREFIX: &str = "sidechannel/";

/// Maximum number of channels a registry will hold.
/// SECURITY: Remote open requests can register channels; this bounds growth.
pub const MAX_CHANNELS: usize = 10_000;

/// 32-byte discovery topic.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TopicId([u8; 32]);

impl TopicId {
    pub fn for_channel(name: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(TOPIC_HASH_DOMAIN);
        hasher.update(name.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Raw topic bytes, for swarm implementations.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for TopicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TopicId({})", hex::encode(&self.0[..8]))
    }
}

/// Trim a channel name; `None` if nothing is left.
pub fn normalize_channel_name(name: &str) -> Option<&str> {
    let trimmed = name.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelEntry {
    pub name: String,
    pub topic: TopicId,
    pub protocol: String,
}

impl ChannelEntry {
    fn derive(name: &str) -> Self {
        Self {
            name: name.to_string(),
            topic: TopicId::for_channel(name),
            protocol: format!("{}{}", PROTOCOL_PREFIX, name),
        }
    }
}

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    entries: HashMap<String, ChannelEntry>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel, returning the existing entry if already known.
    ///
    /// Returns `None` for names that are empty after trimming, or when the
    /// registry is full.
    pub fn register(&mut self, name: &str) -> Option<ChannelEntry> {
        let name = normalize_channel_name(name)?;
        if let Some(entry) = self.entries.get(name) {
            return Some(entry.clone());
        }
        if self.entries.len() >= MAX_CHANNELS {
            return None;
        }
        let entry = ChannelEntry::derive(name);
        self.entries.insert(name.to_string(), entry.clone());
        Some(entry)
    }

    pub fn get(&self, name: &str) -> Option<&ChannelEntry> {
        self.entries.get(name.trim())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All registered entries, sorted by name.
    pub fn entries(&self) -> Vec<ChannelEntry> {
        let mut entries: Vec<ChannelEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let mut registry = ChannelRegistry::new();
        let first = registry.register("general").unwrap();
        let second = registry.register("general").unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn register_trims_names() {
        let mut registry = ChannelRegistry::new();
        let entry = registry.register("  general\t").unwrap();
        assert_eq!(entry.name, "general");
        assert_eq!(entry.protocol, "sidechannel/general");
        assert!(registry.contains("general"));
    }

    #[test]
    fn register_rejects_empty_names() {
        let mut registry = ChannelRegistry::new();
        assert!(registry.register("").is_none());
        assert!(registry.register("   ").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn names_are_case_sensitive() {
        let mut registry = ChannelRegistry::new();
        let lower = registry.register("news").unwrap();
        let upper = registry.register("News").unwrap();
        assert_ne!(lower.topic, upper.topic);
        assert_ne!(lower.protocol, upper.protocol);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn topic_derivation_is_deterministic_across_registries() {
        let a = ChannelRegistry::new().register("general").unwrap();
        let b = ChannelRegistry::new().register("general").unwrap();
        assert_eq!(a.topic, b.topic);
        assert_eq!(a.topic, TopicId::for_channel("general"));

        let expected = blake3::hash(b"sidechannel-topic-v1:general");
        assert_eq!(a.topic.as_bytes(), expected.as_bytes());
    }

    #[test]
    fn entries_are_sorted() {
        let mut registry = ChannelRegistry::new();
        registry.register("zeta");
        registry.register("alpha");
        let names: Vec<String> = registry.entries().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
