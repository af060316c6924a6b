//! Security gate: owns the handshake engine and the crypto registry and
//! turns engine events into registry changes, hook calls and outgoing
//! control frames.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::control::ControlFrame;
use crate::crypto::{ContextRegistry, CryptoContext, CryptoError};
use crate::handshake::{HandshakeEngine, HandshakeEvent, SecurityPart};
use crate::hooks::QueueHooks;
use crate::rtp::RtpPacket;

/// Outgoing control frames kept while no peer address is known.
const MAX_PENDING_CONTROL: usize = 64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct GateState: u8 {
        /// The handshake engine is running.
        const STARTED = 1;
        /// A receive context is installed.
        const SECURED = 1 << 1;
    }
}

pub struct SecurityGate {
    engine: Option<Box<dyn HandshakeEngine>>,
    registry: ContextRegistry,
    state: GateState,
    enabled: bool,
    control_seq: u16,
    pending: VecDeque<Bytes>,
    peer: Option<SocketAddr>,
    peer_pinned: bool,
    secure_media_seen: bool,
}

impl SecurityGate {
    pub fn new(engine: Option<Box<dyn HandshakeEngine>>, enabled: bool) -> Self {
        Self {
            engine,
            registry: ContextRegistry::new(),
            state: GateState::empty(),
            enabled,
            control_seq: rand::random(),
            pending: VecDeque::new(),
            peer: None,
            peer_pinned: false,
            secure_media_seen: false,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.state.contains(GateState::STARTED)
    }

    pub fn enabled(&self) -> bool {
        self.enabled && self.engine.is_some()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ContextRegistry {
        &mut self.registry
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Fix the control peer; learned addresses no longer replace it.
    pub fn pin_peer(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
        self.peer_pinned = true;
    }

    pub fn learn_peer(&mut self, from: SocketAddr) {
        if !self.peer_pinned {
            self.peer = Some(from);
        }
    }

    pub fn start(&mut self, now: Instant, hooks: &dyn QueueHooks, local_ssrc: u32) -> bool {
        if !self.enabled || self.is_started() {
            return false;
        }
        let Some(engine) = self.engine.as_mut() else {
            return false;
        };
        info!("starting key agreement");
        self.state.insert(GateState::STARTED);
        let events = engine.start(now);
        self.apply(events, hooks, local_ssrc);
        true
    }

    pub fn stop(&mut self, hooks: &dyn QueueHooks, local_ssrc: u32) {
        if !self.is_started() {
            return;
        }
        let events = match self.engine.as_mut() {
            Some(engine) => engine.stop(),
            None => Vec::new(),
        };
        self.apply(events, hooks, local_ssrc);
        self.state.remove(GateState::STARTED);
        info!("key agreement stopped");
    }

    pub fn process_control(
        &mut self,
        frame: &ControlFrame,
        now: Instant,
        hooks: &dyn QueueHooks,
        local_ssrc: u32,
    ) {
        let events = match self.engine.as_mut() {
            Some(engine) => engine.process_message(&frame.message, frame.ssrc, now),
            None => return,
        };
        self.apply(events, hooks, local_ssrc);
    }

    pub fn handle_timeout(&mut self, now: Instant, hooks: &dyn QueueHooks, local_ssrc: u32) {
        let events = match self.engine.as_mut() {
            Some(engine) if engine.next_timeout().is_some_and(|at| at <= now) => {
                engine.handle_timeout(now)
            }
            _ => return,
        };
        self.apply(events, hooks, local_ssrc);
    }

    /// Decrypt a media packet if a context exists or can be derived.
    ///
    /// `None` means the packet travels in the clear.
    pub fn unprotect(&mut self, packet: &mut RtpPacket) -> Option<Result<(), CryptoError>> {
        let context = self.registry.lookup_or_derive(packet.ssrc())?;
        Some(context.unprotect(packet))
    }

    /// First authenticated media packet since the receive keys arrived.
    pub fn confirm_secure_media(&mut self, hooks: &dyn QueueHooks, local_ssrc: u32) {
        if self.secure_media_seen {
            return;
        }
        self.secure_media_seen = true;
        let events = match self.engine.as_mut() {
            Some(engine) => engine.on_secure_media(),
            None => return,
        };
        self.apply(events, hooks, local_ssrc);
    }

    pub fn protect(&mut self, packet: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self.registry.outbound_mut() {
            Some(context) => context.protect(packet),
            None => Ok(packet.to_vec()),
        }
    }

    pub fn install(&mut self, context: Box<dyn CryptoContext>) {
        self.registry.install(context);
    }

    /// Frames waiting for the peer, with the address to send them to.
    pub fn drain_outbound(&mut self) -> Vec<(SocketAddr, Bytes)> {
        match self.peer {
            Some(peer) => self.pending.drain(..).map(|frame| (peer, frame)).collect(),
            None => Vec::new(),
        }
    }

    pub fn pending_outbound(&self) -> usize {
        self.pending.len()
    }

    /// Return a failed engine to idle so the auto-start policy can run it
    /// again.
    fn reset_failed(&mut self, hooks: &dyn QueueHooks, local_ssrc: u32) {
        let events = match self.engine.as_mut() {
            Some(engine) => engine.stop(),
            None => Vec::new(),
        };
        self.state.remove(GateState::STARTED);
        self.apply(events, hooks, local_ssrc);
    }

    fn apply(&mut self, events: Vec<HandshakeEvent>, hooks: &dyn QueueHooks, local_ssrc: u32) {
        let mut failed = false;
        for event in events {
            match event {
                HandshakeEvent::Send(message) => {
                    let frame = ControlFrame::new(self.control_seq, local_ssrc, message);
                    self.control_seq = self.control_seq.wrapping_add(1);
                    if self.pending.len() == MAX_PENDING_CONTROL {
                        debug!("control backlog full, dropping oldest frame");
                        self.pending.pop_front();
                    }
                    self.pending.push_back(frame.encode());
                }
                HandshakeEvent::SecretsReady {
                    part: SecurityPart::Receiver,
                    context,
                } => {
                    // Contexts derived from an earlier template are stale.
                    self.registry.clear_inbound();
                    self.registry.install(context);
                    self.state.insert(GateState::SECURED);
                    self.secure_media_seen = false;
                    debug!("receive template installed");
                }
                HandshakeEvent::SecretsReady {
                    part: SecurityPart::Sender,
                    context,
                } => {
                    self.registry.set_outbound(Some(context));
                    debug!("send context installed");
                }
                HandshakeEvent::SecretsOff(SecurityPart::Receiver) => {
                    self.registry.clear_inbound();
                    self.state.remove(GateState::SECURED);
                    debug!("receive contexts removed");
                }
                HandshakeEvent::SecretsOff(SecurityPart::Sender) => {
                    self.registry.set_outbound(None);
                }
                HandshakeEvent::SecureOn {
                    cipher,
                    sas,
                    verified,
                } => {
                    info!(
                        "media secured with {} (sas {}, verified {})",
                        cipher,
                        sas.as_deref().unwrap_or("-"),
                        verified
                    );
                    hooks.on_secure_on(&cipher, sas.as_deref(), verified);
                }
                HandshakeEvent::SecureOff => {
                    info!("media security off");
                    hooks.on_secure_off();
                }
                HandshakeEvent::NegotiationFailed(reason) => {
                    warn!("key agreement failed: {}", reason);
                    hooks.on_negotiation_failed(&reason);
                    failed = true;
                }
            }
        }
        if failed {
            self.reset_failed(hooks, local_ssrc);
        }
    }
}

impl std::fmt::Debug for SecurityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityGate")
            .field("state", &self.state)
            .field("enabled", &self.enabled)
            .field("has_engine", &self.engine.is_some())
            .field("registry", &self.registry)
            .field("pending", &self.pending.len())
            .field("peer", &self.peer)
            .finish()
    }
}
