//! Collaborator interfaces consumed by Sidechannel.
//!
//! Sidechannel does not own a transport. The host injects these traits and
//! the overlay drives them; nothing here is implemented by the core itself
//! (see [`crate::memory`] for an in-process implementation).
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Host identity | [`IdentityProvider`] | `from`/`origin` stamping |
//! | Discovery | [`Swarm`] | topic join, flush, live connections, events |
//! | Connection | [`Connection`] | stable id, remote key, multiplexer |
//! | Multiplexer | [`Multiplexer`] | protocol pairing, channel creation |
//! | Protocol channel | [`MessageChannel`] | open handshake, framed messages |
//! | Outbound frames | [`MessageSender`] | send one JSON envelope |
//! | Application | [`MessageHandler`] | accepted inbound messages |

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::channel::TopicId;
use crate::identity::Identity;
use crate::messages::Envelope;

/// Stable handle for a live connection, assigned by the swarm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Supplies the local peer's public identity.
pub trait IdentityProvider: Send + Sync + 'static {
    fn public_key(&self) -> Option<Identity>;
}

impl IdentityProvider for Identity {
    fn public_key(&self) -> Option<Identity> {
        Some(*self)
    }
}

impl IdentityProvider for Option<Identity> {
    fn public_key(&self) -> Option<Identity> {
        *self
    }
}

/// Roles requested when joining a discovery topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinOptions {
    pub server: bool,
    pub client: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self { server: true, client: true }
    }
}

/// Connection lifecycle notifications emitted by the swarm.
#[derive(Clone)]
pub enum SwarmEvent {
    Connected(Arc<dyn Connection>),
    Closed(ConnectionId),
}

impl std::fmt::Debug for SwarmEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwarmEvent::Connected(conn) => write!(f, "Connected({})", conn.id()),
            SwarmEvent::Closed(id) => write!(f, "Closed({})", id),
        }
    }
}

/// Discovery layer: resolves topics into live connections.
#[async_trait]
pub trait Swarm: Send + Sync + 'static {
    /// Announce and look up peers on a topic.
    async fn join(&self, topic: TopicId, options: JoinOptions) -> Result<()>;

    /// Wait until pending joins have propagated.
    async fn flush(&self) -> Result<()>;

    /// Snapshot of currently live connections.
    fn connections(&self) -> Vec<Arc<dyn Connection>>;

    /// Subscribe to connection open/close events.
    fn events(&self) -> broadcast::Receiver<SwarmEvent>;
}

pub trait Connection: Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    fn remote_public_key(&self) -> Option<Identity>;

    /// The connection's multiplexer, or `None` while it is still being set up.
    fn mux(&self) -> Option<Arc<dyn Multiplexer>>;
}

/// Per-connection protocol multiplexer.
#[async_trait]
pub trait Multiplexer: Send + Sync + 'static {
    /// Negotiate `protocol` with the remote side. Resolves once paired.
    /// Calling it again for an already paired protocol is harmless.
    async fn pair(&self, protocol: &str);

    /// Create the channel for `protocol`, or `None` if this side already has
    /// a live one on this connection.
    fn create_channel(&self, protocol: &str) -> Option<Arc<dyn MessageChannel>>;
}

/// Inbound frames of a protocol channel, already decoded from JSON.
pub type InboundFrames = mpsc::UnboundedReceiver<serde_json::Value>;

/// A negotiated protocol channel on one connection.
#[async_trait]
pub trait MessageChannel: Send + Sync + 'static {
    /// Start the open handshake.
    fn open(&self);

    /// `true` once both sides have opened.
    fn is_opened(&self) -> bool;

    /// Resolves `true` when the channel is fully open, `false` if the open
    /// failed or the channel closed first. May be awaited more than once.
    async fn fully_opened(&self) -> bool;

    /// Register the JSON message type. Returns `None` if it was already taken.
    fn add_message(&self) -> Option<(Arc<dyn MessageSender>, InboundFrames)>;

    fn close(&self);
}

pub trait MessageSender: Send + Sync + 'static {
    /// Transmit one envelope. Errors are transport-level and never retried.
    fn send(&self, envelope: &Envelope) -> Result<()>;
}

/// Application callback for accepted, non-control inbound messages.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, channel: &str, envelope: &Envelope, connection: ConnectionId);
}

impl<F> MessageHandler for F
where
    F: Fn(&str, &Envelope, ConnectionId) + Send + Sync + 'static,
{
    fn on_message(&self, channel: &str, envelope: &Envelope, connection: ConnectionId) {
        self(channel, envelope, connection)
    }
}
