#![forbid(unsafe_code)]

//! sluice receiver.
//!
//! Binds one UDP socket, optionally negotiates keys with a peer over
//! control frames, and drains validated media from the queue.

mod hooks;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use sluice_core::{spawn_worker, IncomingQueue, QueueConfig};
use sluice_crypto::{NoiseEngine, Role};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::hooks::LoggingHooks;

const DRAIN_INTERVAL_MS: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HandshakeRole {
    Initiator,
    Responder,
    None,
}

#[derive(Parser, Debug)]
#[command(name = "sluice-recv")]
#[command(about = "Receive, decrypt and validate RTP from one UDP socket")]
struct Args {
    /// UDP listen address
    #[arg(long, env = "SLUICE_LISTEN", default_value = "127.0.0.1:5004")]
    listen: SocketAddr,

    /// Peer for key-agreement control frames; learned from traffic if unset
    #[arg(long, env = "SLUICE_PEER")]
    peer: Option<SocketAddr>,

    /// Key-agreement role
    #[arg(long, value_enum, default_value = "responder")]
    role: HandshakeRole,

    /// Static X25519 private key (hex); a fresh one is generated if unset
    #[arg(long, env = "SLUICE_STATIC_KEY", hide_env_values = true)]
    static_key: Option<String>,

    /// JSON queue configuration
    #[arg(long, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,

    /// RTP clock rate in Hz
    #[arg(long)]
    clock_rate: Option<u32>,

    /// In-order packets required before a new source is valid
    #[arg(long)]
    probation: Option<u16>,

    /// Consecutive packets after a sequence jump that restart a stream
    #[arg(long)]
    min_sequential: Option<u16>,

    /// Queue packets that fail authentication instead of dropping them
    #[arg(long, default_value_t = false)]
    admit_unauthenticated: bool,

    /// Seconds between statistics reports
    #[arg(long, default_value_t = 10)]
    stats_interval: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn queue_config(args: &Args) -> Result<QueueConfig> {
    let mut config: QueueConfig = match &args.config {
        Some(path) => sluice_common::load_json(path)?,
        None => QueueConfig::default(),
    };
    if let Some(rate) = args.clock_rate {
        config.clock_rate = rate;
    }
    if let Some(probation) = args.probation {
        config.min_valid_sequence = probation;
    }
    if let Some(run) = args.min_sequential {
        config.min_sequential = run;
    }
    config.handshake_enabled = args.role != HandshakeRole::None;
    Ok(config)
}

fn engine(args: &Args) -> Result<Option<NoiseEngine>> {
    let role = match args.role {
        HandshakeRole::Initiator => Role::Initiator,
        HandshakeRole::Responder => Role::Responder,
        HandshakeRole::None => return Ok(None),
    };
    let engine = match &args.static_key {
        Some(hex_key) => {
            let key = sluice_common::parse_hex_key(hex_key).context("bad --static-key")?;
            NoiseEngine::new(role, key)
        }
        None => NoiseEngine::generate(role),
    };
    Ok(Some(engine))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    sluice_common::init_tracing_with_default(&args.log_level);

    info!("Starting sluice-recv v{}", env!("CARGO_PKG_VERSION"));

    let config = queue_config(&args)?;
    let mut builder = IncomingQueue::builder(config)
        .hooks(Arc::new(LoggingHooks::new(args.admit_unauthenticated)));
    if let Some(engine) = engine(&args)? {
        info!(
            "key agreement as {:?}, static key {}",
            engine.role(),
            hex::encode(engine.local_public_key())
        );
        builder = builder.handshake(Box::new(engine));
    }
    if let Some(peer) = args.peer {
        builder = builder.control_peer(peer);
    }
    let queue = Arc::new(builder.build().context("invalid queue configuration")?);

    let socket = Arc::new(
        UdpSocket::bind(args.listen)
            .await
            .with_context(|| format!("failed to bind {}", args.listen))?,
    );
    info!("listening on {}", socket.local_addr()?);

    let worker = spawn_worker(queue.clone(), socket);
    if args.role == HandshakeRole::Initiator {
        queue.start_handshake(tokio::time::Instant::now().into_std());
    }

    let mut drain = tokio::time::interval(Duration::from_millis(DRAIN_INTERVAL_MS));
    let mut stats = tokio::time::interval(Duration::from_secs(args.stats_interval.max(1)));
    stats.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            _ = drain.tick() => {
                while let Some(packet) = queue.pop_front(None) {
                    debug!(
                        "{:#010x} seq {} ts {} ({} bytes)",
                        packet.ssrc,
                        packet.sequence(),
                        packet.shifted_timestamp,
                        packet.payload().len()
                    );
                }
            }
            _ = stats.tick() => {
                let snapshot = queue.stats();
                info!(
                    "stats: {} sources, {}",
                    queue.sources().len(),
                    serde_json::to_string(&snapshot)?
                );
                for source in queue.sources() {
                    if let Some(report) = queue.loss_report(source.ssrc) {
                        debug!(
                            "{:#010x}: lost {} of {} (fraction {}/256), jitter {}",
                            source.ssrc,
                            report.cumulative_lost,
                            report.expected,
                            report.fraction_lost,
                            report.jitter
                        );
                    }
                }
            }
        }
    }

    worker.shutdown().await?;
    Ok(())
}
