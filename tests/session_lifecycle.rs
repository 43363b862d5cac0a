//! Session lifecycle tests: multiplexer readiness, failed handshakes and
//! teardown, observed through the overlay's statistics.
//!
//! Time is paused, so retry back-off runs instantly and deterministically.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sidechannel::memory::{MemoryConnection, MemorySwarm, connect, disconnect};
use sidechannel::{
    Identity, ReceivedMessage, Sidechannel, SidechannelConfig, SidechannelStats, Swarm,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const PROTOCOL: &str = "sidechannel/general";

// =============================================================================
// Helper Functions
// =============================================================================

fn swarm(n: u8) -> Arc<MemorySwarm> {
    MemorySwarm::new(Some(Identity::from_bytes([n; 32])))
}

async fn start(swarm: &Arc<MemorySwarm>) -> (Sidechannel, mpsc::Receiver<ReceivedMessage>) {
    let config = SidechannelConfig {
        channels: vec!["general".into()],
        debug: true,
        ..Default::default()
    };
    let dyn_swarm: Arc<dyn Swarm> = swarm.clone();
    let (handle, inbox) = Sidechannel::spawn(config, Arc::new(swarm.identity()), Some(dyn_swarm));
    handle.start().await.expect("start failed");
    (handle, inbox)
}

async fn wait_for_stats(
    handle: &Sidechannel,
    done: impl Fn(&SidechannelStats) -> bool,
) -> SidechannelStats {
    timeout(TEST_TIMEOUT, async {
        loop {
            let stats = handle.stats().await;
            if done(&stats) {
                return stats;
            }
            sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .expect("stats condition not reached")
}

/// Two connected swarms. Returns A's view of the connection.
fn pair() -> (Arc<MemorySwarm>, Arc<MemorySwarm>, Arc<MemoryConnection>) {
    let (sa, sb) = (swarm(1), swarm(2));
    let (a_conn, _) = connect(&sa, &sb);
    (sa, sb, a_conn)
}

// =============================================================================
// Test: multiplexer readiness
// =============================================================================

/// A multiplexer that never becomes ready is re-checked a bounded number of
/// times and then given up on.
#[tokio::test(start_paused = true)]
async fn missing_mux_is_abandoned_after_retries() {
    let (sa, _sb, a_conn) = pair();
    a_conn.set_mux_ready(false);
    let (a, _inbox) = start(&sa).await;

    sleep(Duration::from_secs(1)).await;

    let stats = a.stats().await;
    assert_eq!(stats.sessions.mux_retries, 5);
    assert_eq!(stats.sessions.abandoned, 1);
    assert_eq!(a.session_count("general").await, 0);
}

/// A multiplexer that turns ready between retries ends up with a working
/// session.
#[tokio::test(start_paused = true)]
async fn mux_ready_during_retries_opens_session() {
    let (sa, sb, a_conn) = pair();
    a_conn.set_mux_ready(false);
    let (a, mut a_inbox) = start(&sa).await;
    let (b, _b_inbox) = start(&sb).await;

    sleep(Duration::from_millis(120)).await;
    assert!(a.stats().await.sessions.mux_retries >= 2);
    assert_eq!(a.session_count("general").await, 0);

    a_conn.set_mux_ready(true);
    wait_for_stats(&a, |s| s.sessions.opened == 1).await;

    assert!(b.broadcast("general", json!("ready")).await);
    let received = timeout(TEST_TIMEOUT, a_inbox.recv())
        .await
        .expect("timed out waiting for message")
        .expect("inbox closed");
    assert_eq!(received.envelope.message, json!("ready"));
    assert_eq!(a.stats().await.sessions.abandoned, 0);
}

// =============================================================================
// Test: failed handshakes
// =============================================================================

/// Rejected handshakes are retried with back-off until both sides meet on a
/// fresh channel.
#[tokio::test(start_paused = true)]
async fn rejected_opens_recover_through_retries() {
    let (sa, sb, a_conn) = pair();
    a_conn.reject_opens(PROTOCOL, 2);
    let (a, _a_inbox) = start(&sa).await;
    let (b, mut b_inbox) = start(&sb).await;

    let a_stats = wait_for_stats(&a, |s| s.sessions.opened == 1).await;
    let b_stats = wait_for_stats(&b, |s| s.sessions.opened == 1).await;

    let failures = a_stats.sessions.open_failures + b_stats.sessions.open_failures;
    assert!(failures >= 2, "expected both rejections to surface, got {failures}");
    assert_eq!(a_stats.sessions.abandoned + b_stats.sessions.abandoned, 0);

    assert!(a.broadcast("general", json!("recovered")).await);
    let received = timeout(TEST_TIMEOUT, b_inbox.recv())
        .await
        .expect("timed out waiting for message")
        .expect("inbox closed");
    assert_eq!(received.envelope.message, json!("recovered"));
}

/// A handshake that keeps failing is retried five times, then abandoned.
#[tokio::test(start_paused = true)]
async fn persistent_open_failure_is_abandoned() {
    let (sa, _sb, a_conn) = pair();
    a_conn.reject_opens(PROTOCOL, 100);
    let (a, _inbox) = start(&sa).await;

    let stats = wait_for_stats(&a, |s| s.sessions.abandoned == 1).await;
    assert_eq!(stats.sessions.open_failures, 6);
    assert_eq!(stats.sessions.open_retries, 5);

    sleep(Duration::from_secs(5)).await;
    let stats = a.stats().await;
    assert_eq!(stats.sessions.open_failures, 6);
    assert_eq!(stats.sessions.abandoned, 1);
    assert_eq!(a.session_count("general").await, 0);
}

/// Closing the connection cancels a pending retry.
#[tokio::test(start_paused = true)]
async fn close_cancels_pending_retry() {
    let (sa, _sb, a_conn) = pair();
    a_conn.reject_opens(PROTOCOL, 100);
    let (a, _inbox) = start(&sa).await;

    wait_for_stats(&a, |s| s.sessions.open_failures == 1).await;
    disconnect(&a_conn);
    wait_for_stats(&a, |s| s.connections == 0).await;

    sleep(Duration::from_secs(5)).await;
    let stats = a.stats().await;
    assert_eq!(stats.sessions.open_failures, 1);
    assert_eq!(stats.sessions.open_retries, 1);
    assert_eq!(stats.sessions.abandoned, 0);
    assert_eq!(stats.sessions.closed_connections, 1);
}

/// Pairing happens once per protocol and connection, however many opens run.
#[tokio::test(start_paused = true)]
async fn protocol_is_paired_once_per_connection() {
    let (sa, sb, a_conn) = pair();
    a_conn.reject_opens(PROTOCOL, 2);
    let (a, _a_inbox) = start(&sa).await;
    let (_b, _b_inbox) = start(&sb).await;

    wait_for_stats(&a, |s| s.sessions.opened == 1).await;
    assert_eq!(a_conn.pair_calls(PROTOCOL), 1);
}
