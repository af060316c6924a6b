//! Interface to the key-agreement engine.
//!
//! The engine is sans-IO: every call returns the events it produced and the
//! queue acts on them under its lock. Outgoing messages are wrapped in
//! control frames by the queue, never by the engine.

use std::time::Instant;

use crate::crypto::CryptoContext;

/// Which direction a crypto context protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityPart {
    Sender,
    Receiver,
}

pub enum HandshakeEvent {
    /// Message for the peer.
    Send(Vec<u8>),
    /// A template context for one direction; installed under SSRC 0.
    SecretsReady {
        part: SecurityPart,
        context: Box<dyn CryptoContext>,
    },
    SecretsOff(SecurityPart),
    SecureOn {
        cipher: String,
        /// Short authentication string for out-of-band comparison.
        sas: Option<String>,
        verified: bool,
    },
    SecureOff,
    NegotiationFailed(String),
}

impl std::fmt::Debug for HandshakeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send(msg) => f.debug_tuple("Send").field(&msg.len()).finish(),
            Self::SecretsReady { part, context } => f
                .debug_struct("SecretsReady")
                .field("part", part)
                .field("ssrc", &context.ssrc())
                .finish(),
            Self::SecretsOff(part) => f.debug_tuple("SecretsOff").field(part).finish(),
            Self::SecureOn {
                cipher,
                sas,
                verified,
            } => f
                .debug_struct("SecureOn")
                .field("cipher", cipher)
                .field("sas", sas)
                .field("verified", verified)
                .finish(),
            Self::SecureOff => f.write_str("SecureOff"),
            Self::NegotiationFailed(reason) => {
                f.debug_tuple("NegotiationFailed").field(reason).finish()
            }
        }
    }
}

pub trait HandshakeEngine: Send {
    /// Begin negotiating. Called at most once per start/stop cycle.
    fn start(&mut self, now: Instant) -> Vec<HandshakeEvent>;

    fn stop(&mut self) -> Vec<HandshakeEvent>;

    /// Handle one message extracted from a verified control frame.
    fn process_message(
        &mut self,
        message: &[u8],
        announced_ssrc: u32,
        now: Instant,
    ) -> Vec<HandshakeEvent>;

    /// Deadline for the next retransmission, if one is armed.
    fn next_timeout(&self) -> Option<Instant>;

    fn handle_timeout(&mut self, now: Instant) -> Vec<HandshakeEvent>;

    /// The first media packet authenticated with negotiated keys arrived.
    fn on_secure_media(&mut self) -> Vec<HandshakeEvent> {
        Vec::new()
    }
}
