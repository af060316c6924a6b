//! Media protection for the sluice receive engine.
//!
//! This crate provides:
//! - a Noise XX key-agreement engine that runs over the control-frame channel
//! - ChaCha20-Poly1305 crypto contexts keyed per SSRC
//! - a sliding replay window
//!
//! The handshake hash is split into one master key per direction. Each
//! master key is installed as a template context; contexts for individual
//! sources are derived from it on first use, so packets are decrypted with
//! an explicit index and may arrive out of order.

#![forbid(unsafe_code)]

pub mod context;
pub mod handshake;
pub mod replay;

pub use context::{ChaChaContext, CIPHER_NAME, TAG_LEN};
pub use handshake::{generate_keypair, NoiseEngine, NoiseError, RetransmitPolicy, Role};
pub use replay::ReplayWindow;
