//! # Sidechannel Overlay
//!
//! Gossip-style pub/sub over named channels, layered on a host swarm.
//!
//! ## Architecture
//!
//! - [`Sidechannel`]: the public handle (cheap to clone, sends commands)
//! - `SidechannelActor`: owns all state, processes commands and session
//!   events sequentially
//!
//! | State | Owner | Bound |
//! |-------|-------|-------|
//! | Channel registry | actor | [`MAX_CHANNELS`] |
//! | Sessions per connection | `SessionManager` | one per (connection, channel) |
//! | Dedup cache | actor | `max_seen` entries, `seen_ttl` age |
//! | Rate limiter | actor | [`MAX_RATE_LIMIT_ENTRIES`](crate::ratelimit::MAX_RATE_LIMIT_ENTRIES) |
//!
//! ## Ingress Pipeline
//!
//! Each inbound frame passes these stages in order; the first failure drops
//! the frame and nothing else:
//!
//! 1. **Block**: connection inside its rate-limit block window
//! 2. **Measure**: serialized JSON size
//! 3. **Parse**: lenient [`Envelope`] decode
//! 4. **PoW**: stamp checked if the arrival channel requires one
//! 5. **Rate**: token bucket charged with the measured size
//! 6. **Dedup**: `id` (or the fallback key) seen before
//!
//! Accepted frames are then either handled as an `open_channel` control
//! request or handed to the [`MessageHandler`], and finally relayed with
//! `ttl - 1` to every other connection on the channel.
//!
//! ## Broadcast
//!
//! Broadcasting is split in two actor round-trips so that proof-of-work
//! mining happens on the blocking pool, outside the actor:
//!
//! ```text
//! handle ──Prepare──▶ actor: validate, register, open sessions, build envelope
//! handle: spawn_blocking(mine) if the channel requires PoW
//! handle ──Dispatch─▶ actor: size check, remember id, send / defer per session
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{ChannelRegistry, MAX_CHANNELS, normalize_channel_name};
use crate::identity::{IdGenerator, Identity, RandomIds, key_or_unknown, now_ms};
use crate::messages::{ControlRequest, Envelope};
use crate::pow::{self, PowPolicy};
use crate::protocols::{
    ConnectionId, IdentityProvider, JoinOptions, MessageHandler, Swarm, SwarmEvent,
};
use crate::ratelimit::{
    DEFAULT_BLOCK_DURATION, DEFAULT_MAX_STRIKES, DEFAULT_RATE_BURST_BYTES,
    DEFAULT_RATE_BYTES_PER_SECOND, DEFAULT_STRIKE_WINDOW, RateDecision, RateLimitConfig,
    RateLimiter,
};
use crate::relay::{self, DEFAULT_RELAY_TTL};
use crate::seen::{DEFAULT_MAX_SEEN, DEFAULT_SEEN_TTL, SeenCache};
use crate::session::{SESSION_EVENT_QUEUE, SessionEvent, SessionManager, SessionStats};

// ============================================================================
// Configuration Defaults
// ============================================================================

/// Largest envelope this peer will broadcast, in serialized bytes.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1_000_000;

/// Capacity of the handle-to-actor command queue.
const COMMAND_QUEUE: usize = 1000;

/// Capacity of the queue behind [`Sidechannel::spawn`]'s message receiver.
pub const MESSAGE_QUEUE: usize = 1000;

/// Milliseconds on the wire, [`Duration`] in memory.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Overlay configuration.
///
/// Every field has a default, so hosts may load partial JSON:
///
/// ```json
/// { "channels": ["general"], "entryChannel": "general", "powEnabled": true, "powDifficulty": 12 }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SidechannelConfig {
    /// Channels registered at spawn.
    pub channels: Vec<String>,
    /// Promote per-message diagnostics from `trace` to `debug`.
    pub debug: bool,
    pub max_message_bytes: usize,
    /// Default channel for [`Sidechannel::request_open`] and the PoW entry rule.
    pub entry_channel: Option<String>,
    /// Honour inbound `open_channel` control messages.
    pub allow_remote_open: bool,
    /// Join the requested channel instead of only logging the request.
    pub auto_join_on_open: bool,
    pub relay_enabled: bool,
    /// Hop budget of envelopes built by this peer.
    pub relay_ttl: i64,
    pub max_seen: usize,
    #[serde(rename = "seenTtlMs", with = "duration_ms")]
    pub seen_ttl: Duration,
    pub rate_bytes_per_second: u64,
    pub rate_burst_bytes: u64,
    pub max_strikes: u32,
    #[serde(rename = "strikeWindowMs", with = "duration_ms")]
    pub strike_window: Duration,
    #[serde(rename = "blockMs", with = "duration_ms")]
    pub block_duration: Duration,
    pub pow_enabled: bool,
    pub pow_difficulty: u32,
    /// Require PoW only on the entry channel.
    pub pow_require_entry: bool,
    /// Require PoW exactly on these channels. Takes precedence over `pow_require_entry`.
    pub pow_required_channels: Option<Vec<String>>,
}

impl Default for SidechannelConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            debug: false,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            entry_channel: None,
            allow_remote_open: true,
            auto_join_on_open: false,
            relay_enabled: true,
            relay_ttl: DEFAULT_RELAY_TTL,
            max_seen: DEFAULT_MAX_SEEN,
            seen_ttl: DEFAULT_SEEN_TTL,
            rate_bytes_per_second: DEFAULT_RATE_BYTES_PER_SECOND,
            rate_burst_bytes: DEFAULT_RATE_BURST_BYTES,
            max_strikes: DEFAULT_MAX_STRIKES,
            strike_window: DEFAULT_STRIKE_WINDOW,
            block_duration: DEFAULT_BLOCK_DURATION,
            pow_enabled: false,
            pow_difficulty: 0,
            pow_require_entry: false,
            pow_required_channels: None,
        }
    }
}

impl SidechannelConfig {
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            bytes_per_second: self.rate_bytes_per_second,
            burst_bytes: self.rate_burst_bytes,
            max_strikes: self.max_strikes,
            strike_window: self.strike_window,
            block_duration: self.block_duration,
        }
    }

    pub fn pow_policy(&self) -> PowPolicy {
        PowPolicy {
            enabled: self.pow_enabled,
            difficulty: self.pow_difficulty,
            require_entry: self.pow_require_entry,
            entry_channel: self.entry_channel.clone(),
            required_channels: self
                .pow_required_channels
                .as_ref()
                .map(|channels| channels.iter().cloned().collect::<HashSet<String>>()),
        }
    }
}

// ============================================================================
// Rejections and Statistics
// ============================================================================

/// Why [`Sidechannel::try_broadcast`] refused a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastRejection {
    /// Channel name is empty after trimming.
    EmptyChannel,
    /// The registry already holds [`MAX_CHANNELS`] channels.
    ChannelLimit,
    /// The envelope could not be serialized to JSON.
    NotSerializable,
    /// Serialized envelope exceeds `max_message_bytes`.
    TooLarge { bytes: usize, max: usize },
    /// Configured PoW difficulty exceeds the digest width.
    PowUnattainable { difficulty: u32 },
    /// The actor is gone.
    Closed,
}

impl std::fmt::Display for BroadcastRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyChannel => write!(f, "channel name is empty"),
            Self::ChannelLimit => write!(f, "channel limit reached (max {})", MAX_CHANNELS),
            Self::NotSerializable => write!(f, "non-serializable payload"),
            Self::TooLarge { bytes, max } => {
                write!(f, "message too large ({} bytes > {})", bytes, max)
            }
            Self::PowUnattainable { difficulty } => {
                write!(f, "proof-of-work difficulty {} is unattainable", difficulty)
            }
            Self::Closed => write!(f, "sidechannel actor closed"),
        }
    }
}

impl std::error::Error for BroadcastRejection {}

/// Why an inbound frame was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    Blocked,
    /// The frame could not be re-serialized for size accounting.
    Unmeasurable,
    Malformed,
    InvalidPow,
    RateLimited,
    Duplicate,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocked => write!(f, "connection blocked"),
            Self::Unmeasurable => write!(f, "unmeasurable payload"),
            Self::Malformed => write!(f, "malformed envelope"),
            Self::InvalidPow => write!(f, "invalid pow"),
            Self::RateLimited => write!(f, "rate limit"),
            Self::Duplicate => write!(f, "duplicate"),
        }
    }
}

impl std::error::Error for DropReason {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SidechannelStats {
    pub channels: usize,
    pub connections: usize,
    /// Inbound frames seen on live connections.
    pub received: u64,
    /// Frames handed to the application.
    pub delivered: u64,
    pub control_requests: u64,
    pub auto_joined: u64,
    /// Relay copies handed to sessions.
    pub relayed: u64,
    pub broadcasts: u64,
    pub broadcasts_rejected: u64,
    /// Broadcast copies handed to sessions, sent or deferred.
    pub sent: u64,
    pub send_failures: u64,
    pub dropped_blocked: u64,
    pub dropped_unmeasurable: u64,
    pub dropped_malformed: u64,
    pub dropped_pow: u64,
    pub dropped_rate: u64,
    pub dropped_duplicate: u64,
    pub rate_blocks: u64,
    pub sessions: SessionStats,
}

impl SidechannelStats {
    fn record_drop(&mut self, reason: DropReason) {
        let counter = match reason {
            DropReason::Blocked => &mut self.dropped_blocked,
            DropReason::Unmeasurable => &mut self.dropped_unmeasurable,
            DropReason::Malformed => &mut self.dropped_malformed,
            DropReason::InvalidPow => &mut self.dropped_pow,
            DropReason::RateLimited => &mut self.dropped_rate,
            DropReason::Duplicate => &mut self.dropped_duplicate,
        };
        *counter += 1;
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        match reason {
            DropReason::Blocked => self.dropped_blocked,
            DropReason::Unmeasurable => self.dropped_unmeasurable,
            DropReason::Malformed => self.dropped_malformed,
            DropReason::InvalidPow => self.dropped_pow,
            DropReason::RateLimited => self.dropped_rate,
            DropReason::Duplicate => self.dropped_duplicate,
        }
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped_blocked
            + self.dropped_unmeasurable
            + self.dropped_malformed
            + self.dropped_pow
            + self.dropped_rate
            + self.dropped_duplicate
    }
}

// ============================================================================
// Application Delivery
// ============================================================================

#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub channel: String,
    pub envelope: Envelope,
    pub connection: ConnectionId,
    pub received_at: Instant,
}

/// [`MessageHandler`] that forwards into a bounded queue.
/// A full queue drops the message with a warning rather than stalling ingress.
pub struct ChannelHandler {
    tx: mpsc::Sender<ReceivedMessage>,
}

impl ChannelHandler {
    pub fn new(tx: mpsc::Sender<ReceivedMessage>) -> Self {
        Self { tx }
    }
}

impl MessageHandler for ChannelHandler {
    fn on_message(&self, channel: &str, envelope: &Envelope, connection: ConnectionId) {
        let message = ReceivedMessage {
            channel: channel.to_string(),
            envelope: envelope.clone(),
            connection,
            received_at: Instant::now(),
        };
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(channel = %channel, "message queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

struct PreparedBroadcast {
    envelope: Envelope,
    pow_difficulty: Option<u32>,
}

enum Command {
    Start(oneshot::Sender<anyhow::Result<()>>),
    Stop(oneshot::Sender<()>),
    AddChannel(String, oneshot::Sender<anyhow::Result<bool>>),
    PrepareBroadcast {
        channel: String,
        message: Value,
        reply: oneshot::Sender<Result<PreparedBroadcast, BroadcastRejection>>,
    },
    Dispatch {
        envelope: Envelope,
        reply: oneshot::Sender<Result<usize, BroadcastRejection>>,
    },
    /// Forwarded by the swarm event pump.
    Swarm(SwarmEvent),
    GetChannels(oneshot::Sender<Vec<String>>),
    GetStats(oneshot::Sender<SidechannelStats>),
    GetSessionCount(String, oneshot::Sender<usize>),
    IsStarted(oneshot::Sender<bool>),
    Quit,
}

// ============================================================================
// Sidechannel Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct Sidechannel {
    cmd_tx: mpsc::Sender<Command>,
    entry_channel: Option<String>,
}

impl Sidechannel {
    /// Spawn with accepted messages delivered to the returned receiver.
    ///
    /// `swarm` may be `None` for a peer that only builds envelopes; such a
    /// peer cannot [`start`](Self::start).
    pub fn spawn(
        config: SidechannelConfig,
        identity: Arc<dyn IdentityProvider>,
        swarm: Option<Arc<dyn Swarm>>,
    ) -> (Self, mpsc::Receiver<ReceivedMessage>) {
        let (msg_tx, msg_rx) = mpsc::channel(MESSAGE_QUEUE);
        let handler: Arc<dyn MessageHandler> = Arc::new(ChannelHandler::new(msg_tx));
        let handle = Self::spawn_with(
            config,
            identity,
            swarm,
            Some(handler),
            Box::new(RandomIds::new()),
        );
        (handle, msg_rx)
    }

    /// Spawn with an explicit handler and id source.
    /// Without a handler, accepted messages are logged at `info`.
    pub fn spawn_with(
        config: SidechannelConfig,
        identity: Arc<dyn IdentityProvider>,
        swarm: Option<Arc<dyn Swarm>>,
        handler: Option<Arc<dyn MessageHandler>>,
        ids: Box<dyn IdGenerator>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (session_tx, session_rx) = mpsc::channel(SESSION_EVENT_QUEUE);
        let entry_channel = config.entry_channel.clone();

        let actor = SidechannelActor::new(
            config,
            identity,
            swarm,
            handler,
            ids,
            cmd_tx.downgrade(),
            session_tx,
        );
        tokio::spawn(actor.run(cmd_rx, session_rx));

        Self { cmd_tx, entry_channel }
    }

    /// Join every registered channel and open sessions on live connections.
    /// Idempotent. Fails if no swarm was supplied.
    pub async fn start(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Start(tx)).await
            .map_err(|_| anyhow::anyhow!("Sidechannel actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("Sidechannel actor closed"))?
    }

    /// Close every session and stop reacting to swarm events.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Stop(tx)).await
            .map_err(|_| anyhow::anyhow!("Sidechannel actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("Sidechannel actor closed"))
    }

    /// Register a channel; once started, also join its topic and open sessions.
    /// `Ok(false)` if the name is empty or the registry is full.
    pub async fn add_channel(&self, name: &str) -> anyhow::Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::AddChannel(name.to_string(), tx)).await
            .map_err(|_| anyhow::anyhow!("Sidechannel actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("Sidechannel actor closed"))?
    }

    /// Publish `message` on `channel`. `false` if it was rejected.
    pub async fn broadcast(&self, channel: &str, message: Value) -> bool {
        match self.try_broadcast(channel, message).await {
            Ok(_) => true,
            Err(rejection) => {
                debug!(channel = %channel, reason = %rejection, "broadcast rejected");
                false
            }
        }
    }

    /// Publish `message` on `channel`, returning how many sessions it was handed to.
    pub async fn try_broadcast(
        &self,
        channel: &str,
        message: Value,
    ) -> Result<usize, BroadcastRejection> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::PrepareBroadcast {
                channel: channel.to_string(),
                message,
                reply: tx,
            })
            .await
            .map_err(|_| BroadcastRejection::Closed)?;
        let PreparedBroadcast {
            mut envelope,
            pow_difficulty,
        } = rx.await.map_err(|_| BroadcastRejection::Closed)??;

        if let Some(difficulty) = pow_difficulty {
            let unstamped = envelope.clone();
            let stamp = tokio::task::spawn_blocking(move || pow::mine(&unstamped, difficulty))
                .await
                .map_err(|_| BroadcastRejection::Closed)?;
            envelope.pow = Some(stamp.ok_or(BroadcastRejection::PowUnattainable { difficulty })?);
        }

        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Dispatch { envelope, reply: tx })
            .await
            .map_err(|_| BroadcastRejection::Closed)?;
        rx.await.map_err(|_| BroadcastRejection::Closed)?
    }

    /// Ask peers on `via` (default: the entry channel) to open `target`.
    pub async fn request_open(&self, target: &str, via: Option<&str>) -> bool {
        let Some(target) = normalize_channel_name(target) else {
            return false;
        };
        let via = match via {
            Some(via) if !via.is_empty() => Some(via),
            _ => self.entry_channel.as_deref(),
        };
        let Some(via) = via.and_then(normalize_channel_name) else {
            return false;
        };
        let request = ControlRequest::OpenChannel {
            channel: target.to_string(),
        };
        self.broadcast(via, request.to_message()).await
    }

    /// Registered channel names, sorted.
    pub async fn channels(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetChannels(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn stats(&self) -> SidechannelStats {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetStats(tx)).await.is_err() {
            return SidechannelStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Number of connections with a session on `channel`.
    pub async fn session_count(&self, channel: &str) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::GetSessionCount(channel.trim().to_string(), tx))
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or_default()
    }

    pub async fn is_started(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::IsStarted(tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Sidechannel Actor
// ============================================================================

struct SidechannelActor {
    config: SidechannelConfig,
    identity: Arc<dyn IdentityProvider>,
    swarm: Option<Arc<dyn Swarm>>,
    handler: Option<Arc<dyn MessageHandler>>,
    ids: Box<dyn IdGenerator>,
    registry: ChannelRegistry,
    sessions: SessionManager,
    seen: SeenCache,
    limiter: RateLimiter,
    pow: PowPolicy,
    started: bool,
    /// Weak so that dropping every handle still ends the actor.
    self_tx: mpsc::WeakSender<Command>,
    event_pump: Option<JoinHandle<()>>,
    /// Topic joins started by remote open requests.
    join_tasks: Vec<JoinHandle<()>>,
    stats: SidechannelStats,
}

impl SidechannelActor {
    fn new(
        config: SidechannelConfig,
        identity: Arc<dyn IdentityProvider>,
        swarm: Option<Arc<dyn Swarm>>,
        handler: Option<Arc<dyn MessageHandler>>,
        ids: Box<dyn IdGenerator>,
        self_tx: mpsc::WeakSender<Command>,
        session_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let mut registry = ChannelRegistry::new();
        for name in &config.channels {
            if registry.register(name).is_none() {
                warn!(channel = %name, "ignoring configured channel");
            }
        }

        Self {
            sessions: SessionManager::new(session_tx, config.debug),
            seen: SeenCache::new(config.max_seen, config.seen_ttl),
            limiter: RateLimiter::new(config.rate_limit()),
            pow: config.pow_policy(),
            config,
            identity,
            swarm,
            handler,
            ids,
            registry,
            started: false,
            self_tx,
            event_pump: None,
            join_tasks: Vec::new(),
            stats: SidechannelStats::default(),
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut session_rx: mpsc::Receiver<SessionEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Start(reply)) => {
                            let _ = reply.send(self.start().await);
                        }
                        Some(Command::Stop(reply)) => {
                            self.stop();
                            let _ = reply.send(());
                        }
                        Some(Command::AddChannel(name, reply)) => {
                            let _ = reply.send(self.add_channel(&name).await);
                        }
                        Some(Command::PrepareBroadcast { channel, message, reply }) => {
                            let result = self.prepare_broadcast(&channel, message);
                            if result.is_err() {
                                self.stats.broadcasts_rejected += 1;
                            }
                            let _ = reply.send(result);
                        }
                        Some(Command::Dispatch { envelope, reply }) => {
                            let result = self.dispatch(envelope);
                            if result.is_err() {
                                self.stats.broadcasts_rejected += 1;
                            }
                            let _ = reply.send(result);
                        }
                        Some(Command::Swarm(event)) => {
                            self.handle_swarm_event(event);
                        }
                        Some(Command::GetChannels(reply)) => {
                            let names =
                                self.registry.entries().into_iter().map(|e| e.name).collect();
                            let _ = reply.send(names);
                        }
                        Some(Command::GetStats(reply)) => {
                            let _ = reply.send(self.snapshot_stats());
                        }
                        Some(Command::GetSessionCount(channel, reply)) => {
                            let _ = reply.send(self.sessions.session_count(&channel));
                        }
                        Some(Command::IsStarted(reply)) => {
                            let _ = reply.send(self.started);
                        }
                        Some(Command::Quit) => {
                            debug!("Sidechannel actor quitting");
                            break;
                        }
                        None => {
                            debug!("Sidechannel handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                Some(event) = session_rx.recv() => {
                    self.handle_session_event(event);
                }
            }
        }
        self.stop();
    }

    fn diag_enabled(&self) -> bool {
        self.config.debug
    }

    fn snapshot_stats(&self) -> SidechannelStats {
        SidechannelStats {
            channels: self.registry.len(),
            connections: self.sessions.connection_count(),
            sessions: self.sessions.stats(),
            ..self.stats
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    async fn start(&mut self) -> anyhow::Result<()> {
        if self.started {
            return Ok(());
        }
        let Some(swarm) = self.swarm.clone() else {
            anyhow::bail!("Sidechannel requires a swarm to start");
        };

        let entries = self.registry.entries();
        for entry in &entries {
            swarm.join(entry.topic, JoinOptions::default()).await?;
        }
        swarm.flush().await?;

        self.spawn_event_pump(swarm.events());

        let now = Instant::now();
        for connection in swarm.connections() {
            if self.limiter.is_blocked(connection.id(), now) {
                continue;
            }
            self.sessions.track(connection.clone());
            for entry in &entries {
                self.sessions.open(&connection, entry);
            }
        }

        self.started = true;
        info!(channels = entries.len(), "sidechannel started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(pump) = self.event_pump.take() {
            pump.abort();
        }
        for task in self.join_tasks.drain(..) {
            task.abort();
        }
        self.sessions.clear();
        if self.started {
            info!("sidechannel stopped");
        }
        self.started = false;
    }

    fn spawn_event_pump(&mut self, mut events: broadcast::Receiver<SwarmEvent>) {
        if let Some(pump) = self.event_pump.take() {
            pump.abort();
        }
        let self_tx = self.self_tx.clone();
        self.event_pump = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(tx) = self_tx.upgrade() else {
                            break;
                        };
                        if tx.send(Command::Swarm(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "swarm event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent) {
        match event {
            SwarmEvent::Connected(connection) => {
                let id = connection.id();
                if self.limiter.is_blocked(id, Instant::now()) {
                    diag!(self.diag_enabled(), connection = %id, "ignoring blocked connection");
                    return;
                }
                self.sessions.track(connection.clone());
                for entry in self.registry.entries() {
                    self.sessions.open(&connection, &entry);
                }
            }
            SwarmEvent::Closed(id) => {
                self.sessions.close(id);
                self.limiter.remove(id);
            }
        }
    }

    async fn add_channel(&mut self, name: &str) -> anyhow::Result<bool> {
        let Some(entry) = self.registry.register(name) else {
            return Ok(false);
        };
        if self.started
            && let Some(swarm) = self.swarm.clone()
        {
            swarm.join(entry.topic, JoinOptions::default()).await?;
            swarm.flush().await?;
            for connection in self.sessions.connections() {
                self.sessions.open(&connection, &entry);
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Broadcast
    // ------------------------------------------------------------------------

    fn prepare_broadcast(
        &mut self,
        channel: &str,
        message: Value,
    ) -> Result<PreparedBroadcast, BroadcastRejection> {
        let name = normalize_channel_name(channel).ok_or(BroadcastRejection::EmptyChannel)?;
        let entry = self
            .registry
            .register(name)
            .ok_or(BroadcastRejection::ChannelLimit)?;

        // Once stopped, nothing would handle these connections' close events.
        if self.started
            && let Some(swarm) = &self.swarm
        {
            for connection in swarm.connections() {
                self.sessions.open(&connection, &entry);
            }
        }

        let author = self.identity.public_key();
        let ts = now_ms();
        let from = author.map(Identity::to_hex).unwrap_or_else(|| "anon".to_string());
        let id = self.ids.next_id(&from, ts);
        let envelope = Envelope::new(id, &entry.name, author, message, ts, self.config.relay_ttl);

        Ok(PreparedBroadcast {
            envelope,
            pow_difficulty: self.pow.difficulty_for(&entry.name),
        })
    }

    fn dispatch(&mut self, envelope: Envelope) -> Result<usize, BroadcastRejection> {
        let channel = envelope.channel.clone().unwrap_or_default();
        let bytes = envelope
            .encoded_len()
            .map_err(|_| BroadcastRejection::NotSerializable)?;
        let max = self.config.max_message_bytes;
        if bytes > max {
            info!(channel = %channel, bytes, max, "message too large");
            return Err(BroadcastRejection::TooLarge { bytes, max });
        }

        let handles = self.sessions.sessions_on(&channel);
        diag!(self.diag_enabled(), channel = %channel, sessions = handles.len(), bytes, "sending");

        if let Some(id) = &envelope.id {
            self.seen.remember(id, Instant::now());
        }

        let mut handed = 0;
        for handle in &handles {
            if self.sessions.deliver(handle, &envelope) {
                handed += 1;
            } else {
                self.stats.send_failures += 1;
            }
        }
        self.stats.broadcasts += 1;
        self.stats.sent += handed as u64;
        Ok(handed)
    }

    // ------------------------------------------------------------------------
    // Ingress
    // ------------------------------------------------------------------------

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Frame {
                connection,
                channel,
                value,
            } => {
                self.handle_frame(connection, &channel, value);
            }
            SessionEvent::Paired { connection, channel } => {
                if let Some(entry) = self.registry.get(&channel).cloned() {
                    self.sessions.on_paired(connection, &entry);
                }
            }
            SessionEvent::Retry { connection, channel } => {
                if let Some(entry) = self.registry.get(&channel).cloned() {
                    self.sessions.reopen(connection, &entry);
                }
            }
            SessionEvent::OpenCompleted {
                connection,
                channel,
                generation,
                opened,
            } => {
                self.sessions
                    .on_open_completed(connection, &channel, generation, opened);
            }
        }
    }

    fn handle_frame(&mut self, connection: ConnectionId, channel: &str, value: Value) {
        if !self.sessions.is_tracked(connection) {
            return;
        }
        self.stats.received += 1;

        let envelope = match self.admit(connection, channel, value) {
            Ok(envelope) => envelope,
            Err(reason) => {
                self.stats.record_drop(reason);
                diag!(
                    self.diag_enabled(),
                    channel = %channel,
                    remote = %self.sessions.remote_key(connection),
                    reason = %reason,
                    "drop"
                );
                return;
            }
        };

        match envelope.control_request() {
            Some(ControlRequest::OpenChannel { channel: target })
                if self.config.allow_remote_open =>
            {
                self.stats.control_requests += 1;
                self.handle_open_request(&target);
            }
            _ => self.deliver(channel, &envelope, connection),
        }

        self.relay(channel, &envelope, connection);
    }

    /// Block, measure, parse, PoW, rate, dedup.
    fn admit(
        &mut self,
        connection: ConnectionId,
        channel: &str,
        value: Value,
    ) -> Result<Envelope, DropReason> {
        let now = Instant::now();
        if self.limiter.is_blocked(connection, now) {
            return Err(DropReason::Blocked);
        }

        let bytes = serde_json::to_vec(&value)
            .map_err(|_| DropReason::Unmeasurable)?
            .len();
        diag!(
            self.diag_enabled(),
            channel = %channel,
            bytes,
            remote = %self.sessions.remote_key(connection),
            "recv"
        );

        let envelope = Envelope::from_value(value).map_err(|_| DropReason::Malformed)?;

        if !self.pow.admits(&envelope, channel) {
            return Err(DropReason::InvalidPow);
        }

        match self.limiter.check(connection, bytes, now) {
            RateDecision::Allowed => {}
            RateDecision::BlockStarted => {
                self.stats.rate_blocks += 1;
                warn!(
                    remote = %self.sessions.remote_key(connection),
                    block_ms = self.config.block_duration.as_millis() as u64,
                    "rate-limit block"
                );
                return Err(DropReason::RateLimited);
            }
            RateDecision::Refused | RateDecision::Blocked => {
                return Err(DropReason::RateLimited);
            }
        }

        let key = envelope.dedup_key(channel);
        if self.seen.remember(&key, now) {
            return Err(DropReason::Duplicate);
        }

        Ok(envelope)
    }

    /// Remote-triggered join. Registration and session opens happen here.
    /// The topic join and flush run in a task that the actor never awaits.
    fn handle_open_request(&mut self, target: &str) {
        let Some(target) = normalize_channel_name(target) else {
            return;
        };
        if !self.config.auto_join_on_open {
            info!(channel = %target, "channel request received");
            return;
        }
        let Some(entry) = self.registry.register(target) else {
            warn!(channel = %target, "auto-join refused");
            return;
        };
        self.stats.auto_joined += 1;
        info!(channel = %target, "auto-joined channel");

        if !self.started {
            return;
        }
        if let Some(swarm) = self.swarm.clone() {
            let topic = entry.topic;
            let name = entry.name.clone();
            self.join_tasks.retain(|task| !task.is_finished());
            self.join_tasks.push(tokio::spawn(async move {
                let joined = match swarm.join(topic, JoinOptions::default()).await {
                    Ok(()) => swarm.flush().await,
                    Err(e) => Err(e),
                };
                match joined {
                    Ok(()) => debug!(channel = %name, "channel topic joined"),
                    Err(e) => warn!(channel = %name, error = %e, "auto-join failed"),
                }
            }));
        }
        for connection in self.sessions.connections() {
            self.sessions.open(&connection, &entry);
        }
    }

    fn deliver(&mut self, channel: &str, envelope: &Envelope, connection: ConnectionId) {
        self.stats.delivered += 1;
        match &self.handler {
            Some(handler) => handler.on_message(channel, envelope, connection),
            None => {
                let from = envelope.from.as_deref().unwrap_or("unknown");
                info!(
                    channel = %channel,
                    from = %from,
                    payload = %envelope.message,
                    "sidechannel message"
                );
            }
        }
    }

    fn relay(&mut self, channel: &str, envelope: &Envelope, origin: ConnectionId) {
        if !self.config.relay_enabled {
            return;
        }
        let Some(copy) = relay::relayed_copy(envelope, self.identity.public_key()) else {
            return;
        };
        let handles = self.sessions.sessions_on(channel);
        let targets = relay::relay_targets(handles.iter().map(|h| h.connection), origin);
        for handle in handles.iter().filter(|h| targets.contains(&h.connection)) {
            if self.sessions.deliver(handle, &copy) {
                self.stats.relayed += 1;
            } else {
                self.stats.send_failures += 1;
            }
        }
        diag!(
            self.diag_enabled(),
            channel = %channel,
            ttl = copy.ttl,
            targets = targets.len(),
            local = %key_or_unknown(self.identity.public_key()),
            "relayed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_defaults_match_documented_values() {
        let config = SidechannelConfig::default();
        assert_eq!(config.max_message_bytes, 1_000_000);
        assert!(config.allow_remote_open);
        assert!(!config.auto_join_on_open);
        assert!(config.relay_enabled);
        assert_eq!(config.relay_ttl, 3);
        assert_eq!(config.max_seen, 5_000);
        assert_eq!(config.seen_ttl, Duration::from_millis(120_000));
        assert_eq!(config.rate_bytes_per_second, 64_000);
        assert_eq!(config.rate_burst_bytes, 256_000);
        assert_eq!(config.max_strikes, 3);
        assert_eq!(config.strike_window, Duration::from_millis(5_000));
        assert_eq!(config.block_duration, Duration::from_millis(30_000));
        assert!(!config.pow_enabled);
        assert_eq!(config.pow_difficulty, 0);
    }

    #[test]
    fn config_loads_partial_json() {
        let config: SidechannelConfig = serde_json::from_value(json!({
            "channels": ["general"],
            "entryChannel": "general",
            "powEnabled": true,
            "powDifficulty": 12,
            "blockMs": 1500,
        }))
        .unwrap();
        assert_eq!(config.channels, vec!["general"]);
        assert_eq!(config.entry_channel.as_deref(), Some("general"));
        assert_eq!(config.block_duration, Duration::from_millis(1_500));
        assert_eq!(config.relay_ttl, DEFAULT_RELAY_TTL);
        assert!(config.pow_policy().is_required("general"));
    }

    #[test]
    fn config_serializes_durations_as_millis() {
        let value = serde_json::to_value(SidechannelConfig::default()).unwrap();
        assert_eq!(value["seenTtlMs"], 120_000);
        assert_eq!(value["strikeWindowMs"], 5_000);
        assert_eq!(value["blockMs"], 30_000);
    }

    #[test]
    fn pow_allow_list_becomes_set() {
        let config = SidechannelConfig {
            pow_enabled: true,
            pow_difficulty: 4,
            pow_required_channels: Some(vec!["a".into(), "b".into()]),
            ..Default::default()
        };
        let policy = config.pow_policy();
        assert!(policy.is_required("a"));
        assert!(!policy.is_required("c"));
    }

    #[test]
    fn rejection_messages() {
        let rejection = BroadcastRejection::TooLarge { bytes: 2_000_001, max: 1_000_000 };
        assert_eq!(rejection.to_string(), "message too large (2000001 bytes > 1000000)");
        assert_eq!(DropReason::InvalidPow.to_string(), "invalid pow");
    }

    #[test]
    fn drop_counters_are_tracked_per_reason() {
        let mut stats = SidechannelStats::default();
        stats.record_drop(DropReason::Duplicate);
        stats.record_drop(DropReason::Duplicate);
        stats.record_drop(DropReason::RateLimited);
        assert_eq!(stats.dropped(DropReason::Duplicate), 2);
        assert_eq!(stats.dropped(DropReason::RateLimited), 1);
        assert_eq!(stats.total_dropped(), 3);
    }

    #[tokio::test]
    async fn start_without_swarm_fails() {
        let (sidechannel, _rx) =
            Sidechannel::spawn(SidechannelConfig::default(), Arc::new(None::<Identity>), None);
        assert!(sidechannel.start().await.is_err());
        assert!(!sidechannel.is_started().await);
        sidechannel.quit().await;
    }

    #[tokio::test]
    async fn broadcast_without_swarm_registers_channel() {
        let (sidechannel, _rx) =
            Sidechannel::spawn(SidechannelConfig::default(), Arc::new(None::<Identity>), None);
        assert!(sidechannel.broadcast("  news ", json!("hi")).await);
        assert_eq!(sidechannel.channels().await, vec!["news"]);
        assert!(!sidechannel.broadcast("   ", json!("hi")).await);
        assert_eq!(
            sidechannel.try_broadcast("", json!(1)).await,
            Err(BroadcastRejection::EmptyChannel)
        );
        let stats = sidechannel.stats().await;
        assert_eq!(stats.broadcasts, 1);
        assert_eq!(stats.broadcasts_rejected, 2);
    }

    #[tokio::test]
    async fn request_open_validates_names() {
        let config = SidechannelConfig {
            entry_channel: Some("lobby".into()),
            ..Default::default()
        };
        let (sidechannel, _rx) = Sidechannel::spawn(config, Arc::new(None::<Identity>), None);
        assert!(!sidechannel.request_open("  ", None).await);
        assert!(!sidechannel.request_open("news", Some("   ")).await);
        assert!(sidechannel.request_open("news", None).await);
        assert!(sidechannel.request_open("news", Some("")).await);
        assert_eq!(sidechannel.channels().await, vec!["lobby"]);

        let (bare, _rx) =
            Sidechannel::spawn(SidechannelConfig::default(), Arc::new(None::<Identity>), None);
        assert!(!bare.request_open("news", None).await);
    }
}
