use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use sidechannel::memory::{MemorySwarm, connect};
use sidechannel::{Identity, ReceivedMessage, Sidechannel, SidechannelConfig, Swarm};

/// Run a line of in-process peers and flood one message down it.
#[derive(Parser, Debug)]
#[command(name = "sidechannel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of peers, connected as p0 - p1 - ... - pN-1.
    #[arg(short, long, default_value = "4")]
    peers: usize,

    #[arg(short, long, default_value = "general")]
    channel: String,

    #[arg(short, long, default_value = "hello from p0")]
    message: String,

    /// Hop budget of the broadcast envelope.
    #[arg(long, default_value = "3")]
    relay_ttl: i64,

    /// Require proof-of-work with this many leading zero bits (0 disables).
    #[arg(long, default_value = "0")]
    pow_difficulty: u32,

    /// How long to wait for sessions and deliveries, in milliseconds.
    #[arg(long, default_value = "2000")]
    wait_ms: u64,

    /// Log per-message diagnostics at debug level.
    #[arg(long)]
    debug: bool,
}

struct Peer {
    name: String,
    handle: Sidechannel,
    inbox: mpsc::Receiver<ReceivedMessage>,
}

fn short_key<'a>(key: Option<&'a str>, absent: &'a str) -> &'a str {
    key.map(|k| k.get(..16).unwrap_or(k)).unwrap_or(absent)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if args.peers < 2 {
        anyhow::bail!("need at least two peers");
    }
    if args.peers > usize::from(u8::MAX) {
        anyhow::bail!("at most {} peers", u8::MAX);
    }

    let config = SidechannelConfig {
        channels: vec![args.channel.clone()],
        debug: args.debug,
        relay_ttl: args.relay_ttl,
        pow_enabled: args.pow_difficulty > 0,
        pow_difficulty: args.pow_difficulty,
        ..Default::default()
    };

    let swarms: Vec<Arc<MemorySwarm>> = (0..args.peers)
        .map(|i| MemorySwarm::new(Some(Identity::from_bytes([i as u8 + 1; 32]))))
        .collect();
    for pair in swarms.windows(2) {
        connect(&pair[0], &pair[1]);
    }

    let mut peers = Vec::with_capacity(args.peers);
    for (i, swarm) in swarms.iter().enumerate() {
        let identity = swarm.identity().context("peer identity")?;
        let swarm: Arc<dyn Swarm> = swarm.clone();
        let (handle, inbox) = Sidechannel::spawn(config.clone(), Arc::new(identity), Some(swarm));
        handle.start().await?;
        info!(peer = i, identity = %identity.short(), "peer started");
        peers.push(Peer {
            name: format!("p{}", i),
            handle,
            inbox,
        });
    }

    let wait = Duration::from_millis(args.wait_ms);
    let deadline = Instant::now() + wait;
    for (i, peer) in peers.iter().enumerate() {
        let neighbours = if i == 0 || i == args.peers - 1 { 1 } else { 2 };
        while peer.handle.session_count(&args.channel).await < neighbours {
            if Instant::now() >= deadline {
                warn!(peer = %peer.name, "sessions not ready before deadline");
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    let sent = peers[0]
        .handle
        .broadcast(&args.channel, json!({ "text": args.message }))
        .await;
    if !sent {
        anyhow::bail!("broadcast rejected");
    }

    for peer in peers.iter_mut().skip(1) {
        match time::timeout(wait, peer.inbox.recv()).await {
            Ok(Some(received)) => {
                let envelope = &received.envelope;
                println!(
                    "{} <- {} ttl={} relayed_by={}: {}",
                    peer.name,
                    short_key(envelope.origin.as_deref(), "anon"),
                    envelope.ttl,
                    short_key(envelope.relayed_by.as_deref(), "-"),
                    envelope.message,
                );
            }
            _ => println!("{} <- (nothing)", peer.name),
        }
    }

    for peer in &peers {
        let stats = peer.handle.stats().await;
        info!(
            peer = %peer.name,
            received = stats.received,
            delivered = stats.delivered,
            relayed = stats.relayed,
            dropped = stats.total_dropped(),
            "stats"
        );
        peer.handle.quit().await;
    }

    Ok(())
}
