//! # Connection Session Manager
//!
//! Owns one [`ConnectionState`] per live connection and, inside it, at most
//! one session per channel. A session is a protocol channel created on the
//! connection's multiplexer with the JSON message type attached.
//!
//! ## Open sequence
//!
//! ```text
//! mux ready? ──no──▶ retry in 50 ms (≤ 5 per channel) ──▶ give up, log
//!     │yes
//! protocol paired? ──no──▶ pair in background, re-open when paired
//!     │
//! session exists? ──yes──▶ done
//!     │no
//! create_channel ──None──▶ another attempt owns it, done
//!     │
//! add_message, open(), register session
//!     │
//! fully_opened ──false──▶ drop session, retry in 100 ms × n (≤ 5), else give up
//! ```
//!
//! Pairing, retry timers and open waiters run as tasks owned by the
//! connection and are aborted when it closes. Each session's open waiter
//! also flushes that session's bounded queue of sends made before the
//! handshake finished.
//! Results come back to the overlay actor as [`SessionEvent`]s, so session
//! state is only ever touched from the actor.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::ChannelEntry;
use crate::identity::key_or_unknown;
use crate::messages::Envelope;
use crate::protocols::{Connection, ConnectionId, MessageChannel, MessageSender};

// ============================================================================
// Retry Policy
// ============================================================================

/// Delay before re-checking a multiplexer that was not ready.
pub const MUX_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Multiplexer readiness checks per (connection, channel) before giving up.
pub const MAX_MUX_RETRIES: u32 = 5;

/// Base delay for re-opening a channel whose open failed; scaled by attempt.
pub const OPEN_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Re-open attempts per (connection, channel) before giving up.
pub const MAX_OPEN_RETRIES: u32 = 5;

/// Envelopes held per session while its handshake is pending.
pub const DEFERRED_SEND_QUEUE: usize = 64;

/// Capacity of the queue from session tasks to the actor.
/// Inbound readers wait on it, which back-pressures a flooding peer.
pub const SESSION_EVENT_QUEUE: usize = 1000;

/// Notifications from session tasks to the overlay actor.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// A decoded inbound frame on `channel`.
    Frame {
        connection: ConnectionId,
        channel: String,
        value: Value,
    },
    /// Protocol pairing finished; try opening again.
    Paired {
        connection: ConnectionId,
        channel: String,
    },
    /// A retry timer fired.
    Retry {
        connection: ConnectionId,
        channel: String,
    },
    /// The open handshake of session `generation` resolved.
    OpenCompleted {
        connection: ConnectionId,
        channel: String,
        generation: u64,
        opened: bool,
    },
}

/// Result of a single open attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Session registered; the handshake is in flight.
    Opening,
    AlreadyOpen,
    /// Multiplexer missing; a retry is scheduled.
    MuxNotReady { attempt: u32 },
    /// Multiplexer still missing after all retries.
    MuxAbandoned,
    /// The multiplexer refused to create the channel.
    ChannelUnavailable,
    /// The channel refused the message type.
    MessageUnavailable,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Handshakes that completed.
    pub opened: u64,
    /// Handshakes that resolved as failed.
    pub open_failures: u64,
    pub open_retries: u64,
    pub mux_retries: u64,
    /// (connection, channel) pairs given up on.
    pub abandoned: u64,
    pub closed_connections: u64,
}

/// Send side of one session, handed out for broadcast and relay.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub connection: ConnectionId,
    pub channel: Arc<dyn MessageChannel>,
    pub sender: Arc<dyn MessageSender>,
    /// Drained by the session's open waiter once the handshake succeeds.
    pub deferred: mpsc::Sender<Envelope>,
}

struct Session {
    channel: Arc<dyn MessageChannel>,
    sender: Arc<dyn MessageSender>,
    deferred: mpsc::Sender<Envelope>,
    generation: u64,
    reader: JoinHandle<()>,
}

impl Session {
    fn close(self) {
        self.reader.abort();
        self.channel.close();
    }
}

struct ConnectionState {
    connection: Arc<dyn Connection>,
    /// Keyed by channel name.
    sessions: HashMap<String, Session>,
    /// Protocols already paired on this connection.
    paired: HashSet<String>,
    mux_tries: HashMap<String, u32>,
    open_retries: HashMap<String, u32>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectionState {
    fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            sessions: HashMap::new(),
            paired: HashSet::new(),
            mux_tries: HashMap::new(),
            open_retries: HashMap::new(),
            tasks: Vec::new(),
        }
    }

    fn remote(&self) -> String {
        key_or_unknown(self.connection.remote_public_key())
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|handle| !handle.is_finished());
        self.tasks.push(tokio::spawn(task));
    }

    fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        for (_, session) in self.sessions {
            session.close();
        }
    }
}

async fn retry_after(
    events: mpsc::Sender<SessionEvent>,
    delay: Duration,
    connection: ConnectionId,
    channel: String,
) {
    tokio::time::sleep(delay).await;
    let _ = events.send(SessionEvent::Retry { connection, channel }).await;
}

pub(crate) struct SessionManager {
    connections: HashMap<ConnectionId, ConnectionState>,
    events_tx: mpsc::Sender<SessionEvent>,
    next_generation: u64,
    stats: SessionStats,
    debug: bool,
}

impl SessionManager {
    pub fn new(events_tx: mpsc::Sender<SessionEvent>, debug: bool) -> Self {
        Self {
            connections: HashMap::new(),
            events_tx,
            next_generation: 0,
            stats: SessionStats::default(),
            debug,
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn is_tracked(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Remote key of a tracked connection, `"unknown"` otherwise.
    pub fn remote_key(&self, id: ConnectionId) -> String {
        self.connections
            .get(&id)
            .map(ConnectionState::remote)
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connections with state, in id order.
    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        let mut ids: Vec<&ConnectionId> = self.connections.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| self.connections[id].connection.clone())
            .collect()
    }

    /// Start tracking a connection without opening anything.
    pub fn track(&mut self, connection: Arc<dyn Connection>) {
        self.connections
            .entry(connection.id())
            .or_insert_with(|| ConnectionState::new(connection));
    }

    /// Re-run the open sequence for a connection that is still tracked.
    /// Used by retry timers and pairing callbacks; closed connections are ignored.
    pub fn reopen(&mut self, id: ConnectionId, entry: &ChannelEntry) -> Option<OpenOutcome> {
        let connection = self.connections.get(&id)?.connection.clone();
        Some(self.open(&connection, entry))
    }

    /// Pairing finished. Re-attempt unless the failed-open retry path
    /// already owns this channel.
    pub fn on_paired(&mut self, id: ConnectionId, entry: &ChannelEntry) -> Option<OpenOutcome> {
        let state = self.connections.get(&id)?;
        if state.open_retries.get(&entry.name).is_some_and(|n| *n > 0) {
            return None;
        }
        self.reopen(id, entry)
    }

    pub fn open(&mut self, connection: &Arc<dyn Connection>, entry: &ChannelEntry) -> OpenOutcome {
        let id = connection.id();
        let debug = self.debug;
        let events = self.events_tx.clone();
        let state = self
            .connections
            .entry(id)
            .or_insert_with(|| ConnectionState::new(connection.clone()));

        let Some(mux) = state.connection.mux() else {
            let tries = state.mux_tries.entry(entry.name.clone()).or_insert(0);
            *tries += 1;
            let attempt = *tries;
            if attempt <= MAX_MUX_RETRIES {
                self.stats.mux_retries += 1;
                state.spawn(retry_after(events, MUX_RETRY_DELAY, id, entry.name.clone()));
                return OpenOutcome::MuxNotReady { attempt };
            }
            self.stats.abandoned += 1;
            diag!(
                debug,
                channel = %entry.name,
                remote = %state.remote(),
                "mux not ready for connection"
            );
            return OpenOutcome::MuxAbandoned;
        };

        if state.paired.insert(entry.protocol.clone()) {
            let mux = mux.clone();
            let protocol = entry.protocol.clone();
            let channel = entry.name.clone();
            let events = events.clone();
            state.spawn(async move {
                mux.pair(&protocol).await;
                let _ = events.send(SessionEvent::Paired { connection: id, channel }).await;
            });
        }

        if state.sessions.contains_key(&entry.name) {
            return OpenOutcome::AlreadyOpen;
        }

        diag!(debug, channel = %entry.name, remote = %state.remote(), "opening channel");

        let Some(channel) = mux.create_channel(&entry.protocol) else {
            diag!(debug, channel = %entry.name, "channel already open or closed");
            return OpenOutcome::ChannelUnavailable;
        };
        let Some((sender, mut frames)) = channel.add_message() else {
            channel.close();
            return OpenOutcome::MessageUnavailable;
        };

        let reader = {
            let events = events.clone();
            let name = entry.name.clone();
            tokio::spawn(async move {
                while let Some(value) = frames.recv().await {
                    let event = SessionEvent::Frame {
                        connection: id,
                        channel: name.clone(),
                        value,
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
            })
        };

        channel.open();

        self.next_generation += 1;
        let generation = self.next_generation;
        let (deferred, mut pending) = mpsc::channel::<Envelope>(DEFERRED_SEND_QUEUE);
        {
            let channel = channel.clone();
            let sender = sender.clone();
            let name = entry.name.clone();
            state.spawn(async move {
                let opened = channel.fully_opened().await;
                let _ = events
                    .send(SessionEvent::OpenCompleted {
                        connection: id,
                        channel: name,
                        generation,
                        opened,
                    })
                    .await;
                if !opened {
                    return;
                }
                // Runs until the session drops its queue sender.
                while let Some(envelope) = pending.recv().await {
                    if let Err(e) = sender.send(&envelope) {
                        diag!(debug, connection = %id, error = %e, "deferred send failed");
                    }
                }
            });
        }

        state.sessions.insert(
            entry.name.clone(),
            Session {
                channel,
                sender,
                deferred,
                generation,
                reader,
            },
        );
        OpenOutcome::Opening
    }

    /// Apply the result of an open handshake. Stale generations are ignored.
    pub fn on_open_completed(
        &mut self,
        id: ConnectionId,
        channel: &str,
        generation: u64,
        opened: bool,
    ) {
        let debug = self.debug;
        let events = self.events_tx.clone();
        let Some(state) = self.connections.get_mut(&id) else {
            return;
        };
        if !state
            .sessions
            .get(channel)
            .is_some_and(|session| session.generation == generation)
        {
            return;
        }

        diag!(debug, channel = %channel, remote = %state.remote(), opened, "channel open result");

        if opened {
            state.open_retries.remove(channel);
            self.stats.opened += 1;
            return;
        }

        self.stats.open_failures += 1;
        if let Some(session) = state.sessions.remove(channel) {
            session.close();
        }
        let retries = state.open_retries.entry(channel.to_string()).or_insert(0);
        *retries += 1;
        let attempt = *retries;
        if attempt <= MAX_OPEN_RETRIES {
            self.stats.open_retries += 1;
            let delay = OPEN_RETRY_BASE_DELAY * attempt;
            state.spawn(retry_after(events, delay, id, channel.to_string()));
        } else {
            self.stats.abandoned += 1;
            diag!(debug, channel = %channel, remote = %state.remote(), "giving up on channel open");
        }
    }

    /// Forget a connection: close its sessions and abort its pending work.
    pub fn close(&mut self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some(state) => {
                state.shutdown();
                self.stats.closed_connections += 1;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        for (_, state) in self.connections.drain() {
            state.shutdown();
        }
    }

    /// Sessions on `channel`, in connection id order.
    pub fn sessions_on(&self, channel: &str) -> Vec<SessionHandle> {
        let mut handles: Vec<SessionHandle> = self
            .connections
            .iter()
            .filter_map(|(id, state)| {
                state.sessions.get(channel).map(|session| SessionHandle {
                    connection: *id,
                    channel: session.channel.clone(),
                    sender: session.sender.clone(),
                    deferred: session.deferred.clone(),
                })
            })
            .collect();
        handles.sort_by_key(|handle| handle.connection);
        handles
    }

    pub fn session_count(&self, channel: &str) -> usize {
        self.connections
            .values()
            .filter(|state| state.sessions.contains_key(channel))
            .count()
    }

    /// Send now if the session is open, otherwise queue it for the
    /// session's open waiter. Returns `false` on a send error, a full
    /// queue or a session that is already gone.
    pub fn deliver(&self, handle: &SessionHandle, envelope: &Envelope) -> bool {
        if handle.channel.is_opened() {
            return match handle.sender.send(envelope) {
                Ok(()) => true,
                Err(e) => {
                    diag!(self.debug, connection = %handle.connection, error = %e, "send failed");
                    false
                }
            };
        }
        match handle.deferred.try_send(envelope.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                diag!(
                    self.debug,
                    connection = %handle.connection,
                    "deferred queue full, dropping"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    #[cfg(test)]
    fn pending_tasks(&self, id: ConnectionId) -> usize {
        self.connections
            .get(&id)
            .map(|state| state.tasks.iter().filter(|t| !t.is_finished()).count())
            .unwrap_or(0)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.clear();
    }
}
