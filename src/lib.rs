//! # Sidechannel - Gossip Channels over a Peer-to-Peer Swarm
//!
//! Sidechannel lets peers that already share a swarm exchange small JSON
//! messages on named channels, and floods those messages to channel members
//! they are not directly exchanging with:
//!
//! - **Channels**: names map deterministically to a discovery topic and a
//!   multiplexer protocol
//! - **Sessions**: one protocol channel per (connection, channel), opened
//!   with bounded retries
//! - **Relay**: accepted messages are forwarded with a decreasing hop budget
//!
//! ## Architecture
//!
//! The overlay uses the **Actor Pattern**:
//! - [`Sidechannel`] is the public handle, cheap to clone
//! - a private actor owns the registry, sessions, dedup cache and rate limiter
//!   and processes commands sequentially
//! - transport, discovery and identity are injected through the traits in
//!   [`protocols`]
//!
//! ## Security Model
//!
//! Every peer is untrusted. Inbound frames pass a fixed pipeline (block,
//! measure, parse, proof-of-work, rate limit, dedup) and any failure drops the
//! single frame. All per-peer state is bounded: the dedup cache by count and
//! age, the rate limiter by an LRU cap, the registry by [`MAX_CHANNELS`].
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `sidechannel` | Handle, actor, configuration, ingress pipeline |
//! | `channel` | Channel registry, topic and protocol derivation |
//! | `session` | Per-connection session lifecycle and retries |
//! | `seen` | Duplicate suppression |
//! | `ratelimit` | Token buckets with strike escalation |
//! | `pow` | Proof-of-work stamping and verification |
//! | `relay` | Flood-fill forwarding |
//! | `messages` | JSON envelope and control messages |
//! | `identity` | Peer identity, clock, message ids |
//! | `protocols` | Collaborator traits (swarm, connection, multiplexer) |
//! | `memory` | In-process swarm for tests and demos |

/// Per-message diagnostics: `debug` when the overlay runs with `debug`
/// enabled, `trace` otherwise.
macro_rules! diag {
    ($enabled:expr, $($arg:tt)+) => {
        if $enabled {
            ::tracing::debug!($($arg)+)
        } else {
            ::tracing::trace!($($arg)+)
        }
    };
}

pub mod channel;
pub mod identity;
pub mod memory;
pub mod messages;
pub mod pow;
pub mod protocols;
pub mod ratelimit;
pub mod relay;
pub mod seen;
pub mod session;
pub mod sidechannel;

pub use channel::{ChannelEntry, ChannelRegistry, MAX_CHANNELS, TopicId};
pub use identity::{IdGenerator, Identity, RandomIds};
pub use messages::{ControlRequest, Envelope, PowStamp};
pub use protocols::{
    Connection, ConnectionId, IdentityProvider, JoinOptions, MessageChannel, MessageHandler,
    MessageSender, Multiplexer, Swarm, SwarmEvent,
};
pub use sidechannel::{
    BroadcastRejection, ChannelHandler, DropReason, ReceivedMessage, Sidechannel,
    SidechannelConfig, SidechannelStats,
};
