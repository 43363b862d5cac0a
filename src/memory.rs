//! In-process swarm: every collaborator trait over shared memory.
//!
//! [`connect`] links two [`MemorySwarm`]s with a pair of
//! [`MemoryConnection`]s, one per side, and announces them on both swarms'
//! event streams. Protocol channels on a connection pair up by protocol name
//! and become fully open once both ends have called `open()`.
//!
//! Failure knobs:
//! - [`MemoryConnection::set_mux_ready`] hides the multiplexer.
//! - [`MemoryConnection::reject_opens`] fails the next N open handshakes.
//! - [`disconnect`] tears a connection down on both sides.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};

use crate::channel::TopicId;
use crate::identity::Identity;
use crate::messages::Envelope;
use crate::protocols::{
    Connection, ConnectionId, InboundFrames, JoinOptions, MessageChannel, MessageSender,
    Multiplexer, Swarm, SwarmEvent,
};

/// Capacity of each swarm's event stream.
const EVENT_CAPACITY: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Swarm
// ============================================================================

pub struct MemorySwarm {
    identity: Option<Identity>,
    connections: Mutex<HashMap<ConnectionId, Arc<MemoryConnection>>>,
    events: broadcast::Sender<SwarmEvent>,
    joined: Mutex<Vec<(TopicId, JoinOptions)>>,
    flushes: AtomicUsize,
}

impl MemorySwarm {
    pub fn new(identity: Option<Identity>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            identity,
            connections: Mutex::new(HashMap::new()),
            events,
            joined: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
        })
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity
    }

    /// Topics joined so far, in call order.
    pub fn joined(&self) -> Vec<(TopicId, JoinOptions)> {
        lock(&self.joined).clone()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    fn attach(&self, connection: Arc<MemoryConnection>) {
        lock(&self.connections).insert(connection.id, connection.clone());
        let _ = self.events.send(SwarmEvent::Connected(connection));
    }

    fn detach(&self, id: ConnectionId) {
        if lock(&self.connections).remove(&id).is_some() {
            let _ = self.events.send(SwarmEvent::Closed(id));
        }
    }
}

#[async_trait]
impl Swarm for MemorySwarm {
    async fn join(&self, topic: TopicId, options: JoinOptions) -> Result<()> {
        lock(&self.joined).push((topic, options));
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn connections(&self) -> Vec<Arc<dyn Connection>> {
        let mut connections: Vec<Arc<MemoryConnection>> =
            lock(&self.connections).values().cloned().collect();
        connections.sort_by_key(|c| c.id);
        connections
            .into_iter()
            .map(|c| c as Arc<dyn Connection>)
            .collect()
    }

    fn events(&self) -> broadcast::Receiver<SwarmEvent> {
        self.events.subscribe()
    }
}

/// Link two swarms. Returns `(a's view, b's view)` of the new connection.
pub fn connect(
    a: &Arc<MemorySwarm>,
    b: &Arc<MemorySwarm>,
) -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
    let ids = [
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst)),
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst)),
    ];
    let wire = Arc::new(Wire {
        swarms: [Arc::downgrade(a), Arc::downgrade(b)],
        ids,
        links: Mutex::new(HashMap::new()),
        rejects: Mutex::new(HashMap::new()),
        pairs: Mutex::new(HashMap::new()),
        closed: AtomicBool::new(false),
    });
    let a_side = Arc::new(MemoryConnection {
        id: ids[0],
        side: 0,
        remote: b.identity,
        wire: wire.clone(),
        mux_ready: AtomicBool::new(true),
    });
    let b_side = Arc::new(MemoryConnection {
        id: ids[1],
        side: 1,
        remote: a.identity,
        wire,
        mux_ready: AtomicBool::new(true),
    });
    a.attach(a_side.clone());
    b.attach(b_side.clone());
    (a_side, b_side)
}

/// Close a connection on both sides.
pub fn disconnect(connection: &MemoryConnection) {
    connection.wire.close();
}

// ============================================================================
// Connection and Multiplexer
// ============================================================================

struct Wire {
    swarms: [Weak<MemorySwarm>; 2],
    ids: [ConnectionId; 2],
    /// Current link per protocol.
    links: Mutex<HashMap<String, Arc<Link>>>,
    /// Open handshakes left to fail, per protocol.
    rejects: Mutex<HashMap<String, u32>>,
    /// `pair` calls per (side, protocol).
    pairs: Mutex<HashMap<(usize, String), usize>>,
    closed: AtomicBool,
}

impl Wire {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (_, link) in lock(&self.links).drain() {
            link.fail();
        }
        for (side, swarm) in self.swarms.iter().enumerate() {
            if let Some(swarm) = swarm.upgrade() {
                swarm.detach(self.ids[side]);
            }
        }
    }

    fn take_reject(&self, protocol: &str) -> bool {
        let mut rejects = lock(&self.rejects);
        match rejects.get_mut(protocol) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

pub struct MemoryConnection {
    id: ConnectionId,
    side: usize,
    remote: Option<Identity>,
    wire: Arc<Wire>,
    mux_ready: AtomicBool,
}

impl MemoryConnection {
    /// Hide or expose the multiplexer.
    pub fn set_mux_ready(&self, ready: bool) {
        self.mux_ready.store(ready, Ordering::SeqCst);
    }

    /// Fail the next `count` open handshakes of `protocol` on this connection pair.
    pub fn reject_opens(&self, protocol: &str, count: u32) {
        *lock(&self.wire.rejects).entry(protocol.to_string()).or_insert(0) += count;
    }

    /// How often this side paired `protocol`.
    pub fn pair_calls(&self, protocol: &str) -> usize {
        lock(&self.wire.pairs)
            .get(&(self.side, protocol.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.wire.is_closed()
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_public_key(&self) -> Option<Identity> {
        self.remote
    }

    fn mux(&self) -> Option<Arc<dyn Multiplexer>> {
        if !self.mux_ready.load(Ordering::SeqCst) || self.wire.is_closed() {
            return None;
        }
        Some(Arc::new(MemoryMux {
            wire: self.wire.clone(),
            side: self.side,
        }))
    }
}

struct MemoryMux {
    wire: Arc<Wire>,
    side: usize,
}

#[async_trait]
impl Multiplexer for MemoryMux {
    async fn pair(&self, protocol: &str) {
        *lock(&self.wire.pairs)
            .entry((self.side, protocol.to_string()))
            .or_insert(0) += 1;
        tokio::task::yield_now().await;
    }

    fn create_channel(&self, protocol: &str) -> Option<Arc<dyn MessageChannel>> {
        if self.wire.is_closed() {
            return None;
        }
        let mut links = lock(&self.wire.links);
        let link = match links.get(protocol) {
            Some(link) if link.is_live() => {
                if lock(&link.ends)[self.side].created {
                    return None;
                }
                link.clone()
            }
            _ => {
                let link = Link::new();
                links.insert(protocol.to_string(), link.clone());
                link
            }
        };
        lock(&link.ends)[self.side].created = true;
        Some(Arc::new(MemoryChannel {
            wire: self.wire.clone(),
            protocol: protocol.to_string(),
            link,
            side: self.side,
        }))
    }
}

// ============================================================================
// Protocol Channels
// ============================================================================

#[derive(Default)]
struct End {
    created: bool,
    opened: bool,
    message_taken: bool,
    /// Delivers frames to this end's reader.
    inbound: Option<mpsc::UnboundedSender<Value>>,
}

/// Both ends of one protocol channel.
struct Link {
    ends: Mutex<[End; 2]>,
    /// `None` while the handshake is pending.
    state: watch::Sender<Option<bool>>,
}

impl Link {
    fn new() -> Arc<Self> {
        let (state, _) = watch::channel(None);
        Arc::new(Self {
            ends: Mutex::new([End::default(), End::default()]),
            state,
        })
    }

    fn is_live(&self) -> bool {
        *self.state.borrow() != Some(false)
    }

    fn is_open(&self) -> bool {
        *self.state.borrow() == Some(true)
    }

    fn fail(&self) {
        self.state.send_replace(Some(false));
        let mut ends = lock(&self.ends);
        for end in ends.iter_mut() {
            end.inbound = None;
        }
    }
}

struct MemoryChannel {
    wire: Arc<Wire>,
    protocol: String,
    link: Arc<Link>,
    side: usize,
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    fn open(&self) {
        if !self.link.is_live() {
            return;
        }
        if self.wire.take_reject(&self.protocol) {
            self.link.fail();
            return;
        }
        let both = {
            let mut ends = lock(&self.link.ends);
            ends[self.side].opened = true;
            ends[0].opened && ends[1].opened
        };
        if both {
            self.link.state.send_replace(Some(true));
        }
    }

    fn is_opened(&self) -> bool {
        self.link.is_open()
    }

    async fn fully_opened(&self) -> bool {
        let mut state = self.link.state.subscribe();
        let opened = state
            .wait_for(|s| s.is_some())
            .await
            .map(|resolved| *resolved == Some(true));
        opened.unwrap_or(false)
    }

    fn add_message(&self) -> Option<(Arc<dyn MessageSender>, InboundFrames)> {
        let mut ends = lock(&self.link.ends);
        let end = &mut ends[self.side];
        if end.message_taken {
            return None;
        }
        end.message_taken = true;
        let (tx, rx) = mpsc::unbounded_channel();
        end.inbound = Some(tx);
        let sender = MemorySender {
            link: self.link.clone(),
            side: self.side,
        };
        Some((Arc::new(sender), rx))
    }

    fn close(&self) {
        self.link.fail();
    }
}

struct MemorySender {
    link: Arc<Link>,
    side: usize,
}

impl MessageSender for MemorySender {
    fn send(&self, envelope: &Envelope) -> Result<()> {
        if !self.link.is_open() {
            return Err(anyhow!("channel not open"));
        }
        let value = serde_json::to_value(envelope)?;
        let ends = lock(&self.link.ends);
        let remote = ends[1 - self.side]
            .inbound
            .as_ref()
            .ok_or_else(|| anyhow!("remote end has no reader"))?;
        remote
            .send(value)
            .map_err(|_| anyhow!("remote end closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(text: &str) -> Envelope {
        Envelope::new("m".into(), "general", None, json!(text), 1, 0)
    }

    #[tokio::test]
    async fn connect_registers_both_sides_and_emits_events() {
        let a = MemorySwarm::new(Some(Identity::from_bytes([1u8; 32])));
        let b = MemorySwarm::new(Some(Identity::from_bytes([2u8; 32])));
        let mut a_events = a.events();

        let (a_conn, b_conn) = connect(&a, &b);
        assert_eq!(a.connection_count(), 1);
        assert_eq!(b.connection_count(), 1);
        assert_eq!(a_conn.remote_public_key(), b.identity());
        assert_eq!(b_conn.remote_public_key(), a.identity());

        match a_events.recv().await.unwrap() {
            SwarmEvent::Connected(conn) => assert_eq!(conn.id(), a_conn.id()),
            other => panic!("unexpected event {other:?}"),
        }

        disconnect(&b_conn);
        assert!(a_conn.is_closed());
        assert_eq!(a.connection_count(), 0);
        match a_events.recv().await.unwrap() {
            SwarmEvent::Closed(id) => assert_eq!(id, a_conn.id()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn channel_opens_when_both_ends_open() {
        let a = MemorySwarm::new(None);
        let b = MemorySwarm::new(None);
        let (a_conn, b_conn) = connect(&a, &b);

        let a_chan = a_conn.mux().unwrap().create_channel("p").unwrap();
        assert!(a_conn.mux().unwrap().create_channel("p").is_none());
        let b_chan = b_conn.mux().unwrap().create_channel("p").unwrap();

        let (a_tx, _a_rx) = a_chan.add_message().unwrap();
        let (_b_tx, mut b_rx) = b_chan.add_message().unwrap();
        assert!(a_chan.add_message().is_none());

        a_chan.open();
        assert!(!a_chan.is_opened());
        assert!(a_tx.send(&envelope("early")).is_err());

        b_chan.open();
        assert!(a_chan.fully_opened().await);
        assert!(b_chan.is_opened());

        a_tx.send(&envelope("hello")).unwrap();
        let frame = b_rx.recv().await.unwrap();
        assert_eq!(frame["message"], "hello");
    }

    #[tokio::test]
    async fn rejected_open_resolves_false_and_allows_new_channel() {
        let a = MemorySwarm::new(None);
        let b = MemorySwarm::new(None);
        let (a_conn, _b_conn) = connect(&a, &b);
        a_conn.reject_opens("p", 1);

        let chan = a_conn.mux().unwrap().create_channel("p").unwrap();
        chan.open();
        assert!(!chan.fully_opened().await);
        chan.close();

        assert!(a_conn.mux().unwrap().create_channel("p").is_some());
    }

    #[tokio::test]
    async fn mux_hidden_until_ready() {
        let a = MemorySwarm::new(None);
        let b = MemorySwarm::new(None);
        let (a_conn, _) = connect(&a, &b);
        a_conn.set_mux_ready(false);
        assert!(a_conn.mux().is_none());
        a_conn.set_mux_ready(true);
        assert!(a_conn.mux().is_some());
    }

    #[tokio::test]
    async fn join_and_flush_are_recorded() {
        let swarm = MemorySwarm::new(None);
        let topic = TopicId::for_channel("general");
        swarm.join(topic, JoinOptions::default()).await.unwrap();
        swarm.flush().await.unwrap();
        assert_eq!(swarm.joined(), vec![(topic, JoinOptions::default())]);
        assert_eq!(swarm.flush_count(), 1);
    }
}
