#![forbid(unsafe_code)]

//! Receive-side RTP engine.
//!
//! Datagrams from one socket are split into key-agreement control frames and
//! media. Media is decrypted with a per-source crypto context, validated
//! against the RFC 3550 sequence rules and queued per source until the
//! application extracts it.
//!
//! The engine is sans-IO apart from [`worker`], which drives an
//! [`IncomingQueue`] from any [`worker::Transport`].

pub mod collision;
pub mod config;
pub mod control;
pub mod crypto;
pub mod directory;
pub mod gate;
pub mod handshake;
pub mod hooks;
pub mod queue;
pub mod rtp;
pub mod session;
pub mod source;
pub mod stats;
pub mod worker;

pub use collision::{CollisionCheck, CollisionPolicy, CollisionVerdict, RfcCollisionPolicy};
pub use config::{AutoStartPolicy, ConfigError, QueueConfig};
pub use control::{ControlFrame, ControlFrameError};
pub use crypto::{ContextRegistry, CryptoContext, CryptoError, TEMPLATE_SSRC};
pub use gate::GateState;
pub use handshake::{HandshakeEngine, HandshakeEvent, SecurityPart};
pub use hooks::{NoopHooks, QueueHooks};
pub use queue::QueuedPacket;
pub use rtp::{RtpError, RtpPacket, RtpPacketBuilder};
pub use session::{DropReason, HousekeepingReport, IncomingQueue, IngestOutcome};
pub use source::{LossReport, SourceSnapshot, Validity};
pub use stats::StatsSnapshot;
pub use worker::{spawn_worker, Transport, WorkerHandle};
