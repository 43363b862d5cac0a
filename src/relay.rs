//! # Flood-Fill Relay
//!
//! Every accepted inbound envelope is forwarded once to all other connections
//! that have a session on the same channel, with its hop budget reduced:
//!
//! ```text
//!   A ──ttl=3──▶ M ──ttl=2──▶ B ──ttl=1──▶ C   (C does not forward: ttl 0)
//!                 ╲
//!                  ╲ never back to A
//! ```
//!
//! Loops are cut by two independent mechanisms: the hop budget strictly
//! decreases along any path, and every peer's dedup cache drops an id it has
//! already processed. The copy carries `relayedBy` so receivers can tell which
//! neighbour forwarded it; `from`, `origin` and the PoW stamp are untouched,
//! since the stamp basis excludes `ttl` and `relayedBy`.

use crate::identity::Identity;
use crate::messages::Envelope;
use crate::protocols::ConnectionId;

/// Default hop budget of freshly built envelopes.
pub const DEFAULT_RELAY_TTL: i64 = 3;

/// Derived copy for forwarding, or `None` once the hop budget is spent.
///
/// The input is never mutated; it may already have been handed to the
/// application.
pub fn relayed_copy(envelope: &Envelope, relayer: Option<Identity>) -> Option<Envelope> {
    if envelope.ttl <= 0 {
        return None;
    }
    let mut copy = envelope.clone();
    copy.ttl = envelope.ttl - 1;
    copy.relayed_by = relayer.map(Identity::to_hex);
    Some(copy)
}

/// Connections to forward to: every candidate except the one the envelope
/// arrived on.
pub fn relay_targets<I>(candidates: I, origin: ConnectionId) -> Vec<ConnectionId>
where
    I: IntoIterator<Item = ConnectionId>,
{
    let mut targets: Vec<ConnectionId> = candidates
        .into_iter()
        .filter(|conn| *conn != origin)
        .collect();
    targets.sort();
    targets.dedup();
    targets
}
