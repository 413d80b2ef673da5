//! Voice Node
//!
//! Answers handshakes from other nodes and, optionally, places a call.
//!
//! ```text
//! voice-node [--config PATH] listen
//! voice-node [--config PATH] probe ADDR...
//! voice-node [--config PATH] call ADDR...
//! ```

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_voice_call::{
    config::AppConfig,
    node::VoiceNode,
    protocol::{PeerAddress, Status},
};

const STATS_INTERVAL: Duration = Duration::from_secs(10);
const PLAYBACK_INTERVAL: Duration = Duration::from_millis(20);

enum Command {
    Listen,
    Probe(Vec<PeerAddress>),
    Call(Vec<PeerAddress>),
}

struct Args {
    config: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut config = None;
    let mut rest = Vec::new();

    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args.next().context("--config needs a path")?;
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg);
        }
    }

    let mut rest = rest.into_iter();
    let command = match rest.next().as_deref() {
        None | Some("listen") => Command::Listen,
        Some(verb @ ("probe" | "call")) => {
            let peers = rest
                .map(|raw| PeerAddress::parse(&raw).with_context(|| format!("bad address {:?}", raw)))
                .collect::<Result<Vec<_>>>()?;
            if peers.is_empty() {
                bail!("{} needs at least one address", verb);
            }
            if verb == "probe" {
                Command::Probe(peers)
            } else {
                Command::Call(peers)
            }
        }
        Some(other) => bail!("unknown command {:?} (expected listen, probe or call)", other),
    };

    Ok(Args { config, command })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    let config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting voice node");

    let mut node = VoiceNode::new(config)?;

    if let Command::Probe(peers) = &args.command {
        for peer in peers {
            println!("{}: {}", peer, node.probe(peer).await);
        }
        return Ok(());
    }

    let bound = node.start().await?;
    match node.local_address() {
        Some(local) => tracing::info!("Listening on {} as {}", bound, local),
        None => tracing::info!("Listening on {}", bound),
    }

    if let Command::Call(peers) = &args.command {
        let participants = node.dial(peers).await?;
        let joined: Vec<_> = participants.iter().map(|p| p.as_str()).collect();
        tracing::info!("In call with {}", joined.join(", "));
    }

    tracing::info!("Press Ctrl+C to stop");
    run_until_interrupted(&node).await;

    if node.status() == Status::Session {
        let report = node.hang_up().await?;
        for (peer, e) in report.failures() {
            tracing::warn!("{} was not told we left: {}", peer, e);
        }
    }
    node.stop().await;

    tracing::info!("Voice node stopped");
    Ok(())
}

/// Drain received audio and log stats until Ctrl+C
async fn run_until_interrupted(node: &VoiceNode) {
    let mut playback = tokio::time::interval(PLAYBACK_INTERVAL);
    let mut stats = tokio::time::interval(STATS_INTERVAL);
    let mut frames_drained: u64 = 0;

    // One listener for the whole run so a signal is never missed between polls
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    tracing::error!("Could not listen for Ctrl+C: {}", e);
                }
                break;
            }
            _ = playback.tick() => {
                // No audio device here; received blocks go straight back to the pool
                if let Some(media) = node.media() {
                    frames_drained += media.drain_playback();
                }
            }
            _ = stats.tick() => {
                let (legs, (received, sent)) = node
                    .media()
                    .map_or((0, (0, 0)), |m| (m.leg_count(), m.traffic()));
                tracing::info!(
                    "Status: {}, {} media legs, {} datagrams in, {} out, {} frames drained",
                    node.status(),
                    legs,
                    received,
                    sent,
                    frames_drained
                );
            }
        }
    }
}
