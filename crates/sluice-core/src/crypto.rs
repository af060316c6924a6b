//! Crypto context lifetime and lookup.
//!
//! The primitives live behind [`CryptoContext`]. The registry maps SSRCs to
//! contexts; SSRC 0 holds the template that new sources are derived from.

use std::collections::HashMap;

use thiserror::Error;

use crate::rtp::RtpPacket;

/// SSRC under which the key-agreement engine installs the template.
pub const TEMPLATE_SSRC: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("authentication failed")]
    AuthFailed,
    #[error("replayed packet index {0}")]
    Replay(u64),
    #[error("protected packet too short: {0}")]
    TooShort(usize),
    #[error("no session keys derived for this context")]
    NoSessionKeys,
    #[error("encryption failed")]
    Encrypt,
}

impl CryptoError {
    /// Numeric code handed to the packet-error hook.
    pub fn code(&self) -> i32 {
        match self {
            Self::AuthFailed => -1,
            Self::Replay(_) => -2,
            Self::TooShort(_) => -3,
            Self::NoSessionKeys => -4,
            Self::Encrypt => -5,
        }
    }
}

pub trait CryptoContext: Send {
    fn ssrc(&self) -> u32;

    /// Authenticate and decrypt the packet body in place.
    fn unprotect(&mut self, packet: &mut RtpPacket) -> Result<(), CryptoError>;

    /// Encrypt and authenticate an outgoing RTP packet.
    fn protect(&mut self, packet: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Clone this context for `ssrc` and derive its session keys.
    fn derive_for_source(&self, ssrc: u32) -> Option<Box<dyn CryptoContext>>;
}

#[derive(Default)]
pub struct ContextRegistry {
    inbound: HashMap<u32, Box<dyn CryptoContext>>,
    outbound: Option<Box<dyn CryptoContext>>,
}

impl std::fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.inbound.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("ContextRegistry")
            .field("inbound", &ids)
            .field("outbound", &self.outbound.is_some())
            .finish()
    }
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an inbound context, replacing any previous one for its SSRC.
    pub fn install(&mut self, context: Box<dyn CryptoContext>) {
        self.inbound.insert(context.ssrc(), context);
    }

    pub fn remove(&mut self, ssrc: u32) -> bool {
        self.inbound.remove(&ssrc).is_some()
    }

    pub fn clear_inbound(&mut self) {
        self.inbound.clear();
    }

    /// Drop every per-source context and keep the template.
    pub fn clear_derived(&mut self) {
        self.inbound.retain(|&ssrc, _| ssrc == TEMPLATE_SSRC);
    }

    pub fn contains(&self, ssrc: u32) -> bool {
        self.inbound.contains_key(&ssrc)
    }

    pub fn has_template(&self) -> bool {
        self.contains(TEMPLATE_SSRC)
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Context for `ssrc`, deriving one from the template on first use.
    /// Returns `None` when media for this source is unprotected.
    pub fn lookup_or_derive(&mut self, ssrc: u32) -> Option<&mut Box<dyn CryptoContext>> {
        if !self.inbound.contains_key(&ssrc) {
            let derived = self.inbound.get(&TEMPLATE_SSRC)?.derive_for_source(ssrc)?;
            self.inbound.insert(ssrc, derived);
        }
        self.inbound.get_mut(&ssrc)
    }

    pub fn set_outbound(&mut self, context: Option<Box<dyn CryptoContext>>) {
        self.outbound = context;
    }

    pub fn outbound_mut(&mut self) -> Option<&mut Box<dyn CryptoContext>> {
        self.outbound.as_mut()
    }

    pub fn has_outbound(&self) -> bool {
        self.outbound.is_some()
    }
}
