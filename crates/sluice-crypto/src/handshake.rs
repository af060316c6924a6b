//! Noise XX key agreement over control frames.
//!
//! Uses `Noise_XX_25519_ChaChaPoly_BLAKE2s`.
//!
//! # Handshake Flow
//!
//! ```text
//! Initiator                              Responder
//!     |  0x01 -> e                           |
//!     |------------------------------------->|
//!     |  0x02 <- e, ee, s, es                |
//!     |<-------------------------------------|
//!     |  0x03 -> s, se                       |
//!     |------------------------------------->|
//!     [   master keys split from the hash    ]
//! ```
//!
//! Control frames travel over UDP, so the initiator retransmits message 1
//! until message 2 arrives and message 3 until secure media from the peer
//! proves it was received. The responder answers a repeated message 1 with
//! its cached message 2, and a different message 1 by starting over.
//!
//! Control frames carry only a checksum, so a message that fails to decrypt
//! is dropped and the handshake keeps waiting. Only an exhausted retransmit
//! schedule fails the negotiation.

use std::time::{Duration, Instant};

use rand::RngCore;
use sha2::{Digest, Sha256};
use snow::{Builder, HandshakeState};
use thiserror::Error;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use sluice_core::handshake::{HandshakeEngine, HandshakeEvent, SecurityPart};

use crate::context::{ChaChaContext, CIPHER_NAME};

const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

const MAX_HANDSHAKE_MSG_SIZE: usize = 65535;

pub mod message_type {
    pub const MSG1: u8 = 0x01;
    pub const MSG2: u8 = 0x02;
    pub const MSG3: u8 = 0x03;
}

const LABEL_I2R: &[u8] = b"sluice initiator to responder";
const LABEL_R2I: &[u8] = b"sluice responder to initiator";

#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("invalid handshake hash")]
    InvalidHash,

    #[error("snow error: {0}")]
    Snow(#[from] snow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Retransmission schedule for unanswered handshake messages.
#[derive(Debug, Clone, Copy)]
pub struct RetransmitPolicy {
    pub initial: Duration,
    pub max_interval: Duration,
    /// Sends of one message, the first included.
    pub max_attempts: u32,
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max_interval: Duration::from_secs(2),
            max_attempts: 6,
        }
    }
}

impl RetransmitPolicy {
    fn interval(&self, attempt: u32) -> Duration {
        self.initial
            .saturating_mul(1 << attempt.min(16))
            .min(self.max_interval)
    }
}

enum Phase {
    Idle,
    AwaitMsg1(Box<HandshakeState>),
    AwaitMsg2(Box<HandshakeState>),
    AwaitMsg3(Box<HandshakeState>),
    Established,
    Failed,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::AwaitMsg1(_) => "await-msg1",
            Phase::AwaitMsg2(_) => "await-msg2",
            Phase::AwaitMsg3(_) => "await-msg3",
            Phase::Established => "established",
            Phase::Failed => "failed",
        }
    }
}

struct Retransmit {
    message: Vec<u8>,
    attempts: u32,
    deadline: Instant,
}

/// Sans-IO Noise XX engine driven by the security gate.
pub struct NoiseEngine {
    role: Role,
    private_key: Zeroizing<[u8; 32]>,
    public_key: [u8; 32],
    policy: RetransmitPolicy,
    phase: Phase,
    retransmit: Option<Retransmit>,
    /// Last message sent in the current phase, replayed on duplicates.
    last_sent: Option<Vec<u8>>,
    /// Message 1 the responder answered.
    answered: Option<Vec<u8>>,
    remote_static: Option<[u8; 32]>,
    sas: Option<String>,
}

impl NoiseEngine {
    pub fn new(role: Role, private_key: [u8; 32]) -> Self {
        let secret = x25519_dalek::StaticSecret::from(private_key);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self {
            role,
            private_key: Zeroizing::new(private_key),
            public_key: *public.as_bytes(),
            policy: RetransmitPolicy::default(),
            phase: Phase::Idle,
            retransmit: None,
            last_sent: None,
            answered: None,
            remote_static: None,
            sas: None,
        }
    }

    /// Engine with a fresh static key.
    pub fn generate(role: Role) -> Self {
        let (private, _) = generate_keypair();
        Self::new(role, private)
    }

    pub fn with_retransmit(mut self, policy: RetransmitPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Peer static key once the handshake completed.
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    pub fn sas(&self) -> Option<&str> {
        self.sas.as_deref()
    }

    pub fn is_established(&self) -> bool {
        matches!(self.phase, Phase::Established)
    }

    fn build_state(&self) -> Result<Box<HandshakeState>, NoiseError> {
        let builder = Builder::new(NOISE_PATTERN.parse()?).local_private_key(&self.private_key[..]);
        let state = match self.role {
            Role::Initiator => builder.build_initiator()?,
            Role::Responder => builder.build_responder()?,
        };
        Ok(Box::new(state))
    }

    fn send(&mut self, kind: u8, body: Vec<u8>, now: Instant, retransmit: bool) -> HandshakeEvent {
        let mut message = Vec::with_capacity(body.len() + 1);
        message.push(kind);
        message.extend_from_slice(&body);
        self.retransmit = retransmit.then(|| Retransmit {
            message: message.clone(),
            attempts: 1,
            deadline: now + self.policy.interval(0),
        });
        self.last_sent = Some(message.clone());
        HandshakeEvent::Send(message)
    }

    fn resend_last(&self) -> Vec<HandshakeEvent> {
        self.last_sent
            .iter()
            .map(|m| HandshakeEvent::Send(m.clone()))
            .collect()
    }

    fn fail(&mut self, reason: impl Into<String>) -> Vec<HandshakeEvent> {
        let reason = reason.into();
        debug!("noise handshake failed: {}", reason);
        self.phase = Phase::Failed;
        self.retransmit = None;
        self.last_sent = None;
        self.answered = None;
        vec![HandshakeEvent::NegotiationFailed(reason)]
    }

    /// Split the handshake hash into per-direction master keys and hand
    /// both templates to the gate.
    fn establish(&mut self, state: &HandshakeState) -> Result<Vec<HandshakeEvent>, NoiseError> {
        let hash: [u8; 32] = state
            .get_handshake_hash()
            .try_into()
            .map_err(|_| NoiseError::InvalidHash)?;
        self.remote_static = state.get_remote_static().and_then(|s| s.try_into().ok());

        let i2r = split_key(&hash, LABEL_I2R);
        let r2i = split_key(&hash, LABEL_R2I);
        let (send, recv) = match self.role {
            Role::Initiator => (i2r, r2i),
            Role::Responder => (r2i, i2r),
        };

        let sas = hex::encode_upper(&hash[..4]);
        self.sas = Some(sas.clone());
        self.phase = Phase::Established;
        debug!("noise handshake complete as {:?}, sas {}", self.role, sas);

        Ok(vec![
            HandshakeEvent::SecretsReady {
                part: SecurityPart::Receiver,
                context: Box::new(ChaChaContext::template(*recv)),
            },
            HandshakeEvent::SecretsReady {
                part: SecurityPart::Sender,
                context: Box::new(ChaChaContext::template(*send)),
            },
            HandshakeEvent::SecureOn {
                cipher: CIPHER_NAME.to_string(),
                sas: Some(sas),
                verified: false,
            },
        ])
    }

    fn answer_msg1(
        &mut self,
        mut state: Box<HandshakeState>,
        msg1: &[u8],
        buf: &mut [u8],
        now: Instant,
    ) -> Result<Vec<HandshakeEvent>, NoiseError> {
        let len = state.write_message(&[], buf)?;
        self.answered = Some(msg1.to_vec());
        self.phase = Phase::AwaitMsg3(state);
        Ok(vec![self.send(message_type::MSG2, buf[..len].to_vec(), now, false)])
    }

    fn handle(
        &mut self,
        kind: u8,
        body: &[u8],
        now: Instant,
    ) -> Result<Vec<HandshakeEvent>, NoiseError> {
        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        match (phase, kind) {
            (Phase::AwaitMsg1(mut state), message_type::MSG1) => {
                if let Err(e) = state.read_message(body, &mut buf) {
                    trace!("dropping unreadable message 1: {}", e);
                    self.phase = Phase::AwaitMsg1(state);
                    return Ok(Vec::new());
                }
                self.answer_msg1(state, body, &mut buf, now)
            }
            (Phase::AwaitMsg2(mut state), message_type::MSG2) => {
                // snow rolls the state back when a read fails
                if let Err(e) = state.read_message(body, &mut buf) {
                    trace!("dropping unauthenticated message 2: {}", e);
                    self.phase = Phase::AwaitMsg2(state);
                    return Ok(Vec::new());
                }
                let len = state.write_message(&[], &mut buf)?;
                let msg3 = self.send(message_type::MSG3, buf[..len].to_vec(), now, true);
                let mut events = vec![msg3];
                events.extend(self.establish(&state)?);
                Ok(events)
            }
            (Phase::AwaitMsg3(mut state), message_type::MSG3) => {
                if let Err(e) = state.read_message(body, &mut buf) {
                    trace!("dropping unauthenticated message 3: {}", e);
                    self.phase = Phase::AwaitMsg3(state);
                    return Ok(Vec::new());
                }
                self.last_sent = None;
                self.answered = None;
                self.establish(&state)
            }
            // Our answer was lost: the peer is still on the previous step.
            (phase @ Phase::AwaitMsg3(_), message_type::MSG1)
                if self.answered.as_deref() == Some(body) =>
            {
                trace!("duplicate message 1, resending message 2");
                self.phase = phase;
                Ok(self.resend_last())
            }
            (phase @ Phase::AwaitMsg3(_), message_type::MSG1) => {
                let mut fresh = self.build_state()?;
                if let Err(e) = fresh.read_message(body, &mut buf) {
                    trace!("dropping unreadable message 1: {}", e);
                    self.phase = phase;
                    return Ok(Vec::new());
                }
                debug!("new message 1 while awaiting message 3, answering it instead");
                self.answer_msg1(fresh, body, &mut buf, now)
            }
            (phase @ Phase::Established, message_type::MSG2) => {
                trace!("duplicate message 2, resending message 3");
                self.phase = phase;
                Ok(self.resend_last())
            }
            (phase, kind) => {
                trace!("ignoring handshake message {:#04x} in phase {}", kind, phase.name());
                self.phase = phase;
                Ok(Vec::new())
            }
        }
    }
}

fn split_key(hash: &[u8; 32], label: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(hash);
    hasher.update(label);
    Zeroizing::new(hasher.finalize().into())
}

impl HandshakeEngine for NoiseEngine {
    fn start(&mut self, now: Instant) -> Vec<HandshakeEvent> {
        self.retransmit = None;
        self.last_sent = None;
        self.answered = None;
        self.remote_static = None;
        self.sas = None;
        let mut state = match self.build_state() {
            Ok(state) => state,
            Err(e) => return self.fail(e.to_string()),
        };
        match self.role {
            Role::Responder => {
                self.phase = Phase::AwaitMsg1(state);
                Vec::new()
            }
            Role::Initiator => {
                let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
                match state.write_message(&[], &mut buf) {
                    Ok(len) => {
                        self.phase = Phase::AwaitMsg2(state);
                        vec![self.send(message_type::MSG1, buf[..len].to_vec(), now, true)]
                    }
                    Err(e) => self.fail(e.to_string()),
                }
            }
        }
    }

    fn stop(&mut self) -> Vec<HandshakeEvent> {
        let was_established = self.is_established();
        self.phase = Phase::Idle;
        self.retransmit = None;
        self.last_sent = None;
        self.answered = None;
        if !was_established {
            return Vec::new();
        }
        vec![
            HandshakeEvent::SecretsOff(SecurityPart::Receiver),
            HandshakeEvent::SecretsOff(SecurityPart::Sender),
            HandshakeEvent::SecureOff,
        ]
    }

    fn process_message(
        &mut self,
        message: &[u8],
        announced_ssrc: u32,
        now: Instant,
    ) -> Vec<HandshakeEvent> {
        let Some((&kind, body)) = message.split_first() else {
            trace!("empty handshake message from {:#010x}", announced_ssrc);
            return Vec::new();
        };
        if !matches!(kind, message_type::MSG1 | message_type::MSG2 | message_type::MSG3) {
            trace!("unknown handshake message {:#04x} from {:#010x}", kind, announced_ssrc);
            return Vec::new();
        }
        match self.handle(kind, body, now) {
            Ok(events) => events,
            Err(e) => self.fail(e.to_string()),
        }
    }

    fn next_timeout(&self) -> Option<Instant> {
        self.retransmit.as_ref().map(|r| r.deadline)
    }

    fn handle_timeout(&mut self, now: Instant) -> Vec<HandshakeEvent> {
        let Some(retransmit) = self.retransmit.as_mut() else {
            return Vec::new();
        };
        if now < retransmit.deadline {
            return Vec::new();
        }
        if retransmit.attempts >= self.policy.max_attempts {
            let attempts = retransmit.attempts;
            if self.is_established() {
                // Keys are in place; the peer just never sent media back.
                debug!("giving up on message 3 after {} attempts", attempts);
                self.retransmit = None;
                return Vec::new();
            }
            return self.fail(format!("no answer after {} attempts", attempts));
        }
        retransmit.deadline = now + self.policy.interval(retransmit.attempts);
        retransmit.attempts += 1;
        trace!("retransmitting handshake message, attempt {}", retransmit.attempts);
        vec![HandshakeEvent::Send(retransmit.message.clone())]
    }

    fn on_secure_media(&mut self) -> Vec<HandshakeEvent> {
        // Media from the peer proves message 3 arrived.
        if self.is_established() {
            self.retransmit = None;
        }
        Vec::new()
    }
}

/// Generate a random X25519 keypair.
///
/// Returns (private_key, public_key).
pub fn generate_keypair() -> ([u8; 32], [u8; 32]) {
    let mut private = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut private);
    let secret = x25519_dalek::StaticSecret::from(private);
    let public = x25519_dalek::PublicKey::from(&secret);
    (private, *public.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sends(events: &[HandshakeEvent]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                HandshakeEvent::Send(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    fn secrets(events: &[HandshakeEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, HandshakeEvent::SecretsReady { .. }))
            .count()
    }

    fn sas_of(events: &[HandshakeEvent]) -> Option<String> {
        events.iter().find_map(|e| match e {
            HandshakeEvent::SecureOn { sas, .. } => sas.clone(),
            _ => None,
        })
    }

    #[test]
    fn full_exchange_agrees_on_sas() {
        let now = Instant::now();
        let mut initiator = NoiseEngine::generate(Role::Initiator);
        let mut responder = NoiseEngine::generate(Role::Responder);

        assert!(responder.start(now).is_empty());
        let msg1 = sends(&initiator.start(now)).remove(0);
        assert_eq!(msg1[0], message_type::MSG1);

        let msg2 = sends(&responder.process_message(&msg1, 1, now)).remove(0);
        assert_eq!(msg2[0], message_type::MSG2);

        let events = initiator.process_message(&msg2, 2, now);
        let msg3 = sends(&events).remove(0);
        assert_eq!(secrets(&events), 2);
        let initiator_sas = sas_of(&events).unwrap();

        let events = responder.process_message(&msg3, 1, now);
        assert_eq!(secrets(&events), 2);
        assert_eq!(sas_of(&events).unwrap(), initiator_sas);
        assert_eq!(initiator_sas.len(), 8);

        assert!(initiator.is_established());
        assert!(responder.is_established());
        assert_eq!(initiator.remote_static(), Some(*responder.local_public_key()));
        assert_eq!(responder.remote_static(), Some(*initiator.local_public_key()));
    }

    #[test]
    fn initiator_retransmits_then_gives_up() {
        let now = Instant::now();
        let policy = RetransmitPolicy {
            initial: Duration::from_millis(100),
            max_interval: Duration::from_millis(400),
            max_attempts: 3,
        };
        let mut initiator = NoiseEngine::generate(Role::Initiator).with_retransmit(policy);
        let msg1 = sends(&initiator.start(now)).remove(0);

        let first = initiator.next_timeout().unwrap();
        assert_eq!(first, now + Duration::from_millis(100));
        assert!(initiator.handle_timeout(now).is_empty());

        assert_eq!(sends(&initiator.handle_timeout(first)), vec![msg1.clone()]);
        let second = initiator.next_timeout().unwrap();
        assert_eq!(second, first + Duration::from_millis(200));
        assert_eq!(sends(&initiator.handle_timeout(second)), vec![msg1]);

        let third = initiator.next_timeout().unwrap();
        let events = initiator.handle_timeout(third);
        assert!(matches!(events[..], [HandshakeEvent::NegotiationFailed(_)]));
        assert!(initiator.next_timeout().is_none());
    }

    #[test]
    fn duplicate_msg1_gets_cached_msg2() {
        let now = Instant::now();
        let mut initiator = NoiseEngine::generate(Role::Initiator);
        let mut responder = NoiseEngine::generate(Role::Responder);
        responder.start(now);
        let msg1 = sends(&initiator.start(now)).remove(0);

        let msg2 = sends(&responder.process_message(&msg1, 1, now)).remove(0);
        let again = sends(&responder.process_message(&msg1, 1, now));
        assert_eq!(again, vec![msg2]);
    }

    #[test]
    fn msg3_retransmits_until_secure_media() {
        let now = Instant::now();
        let mut initiator = NoiseEngine::generate(Role::Initiator);
        let mut responder = NoiseEngine::generate(Role::Responder);
        responder.start(now);
        let msg1 = sends(&initiator.start(now)).remove(0);
        let msg2 = sends(&responder.process_message(&msg1, 1, now)).remove(0);
        let msg3 = sends(&initiator.process_message(&msg2, 2, now)).remove(0);

        // msg2 repeated because msg3 was lost: answer with msg3 again
        assert_eq!(sends(&initiator.process_message(&msg2, 2, now)), vec![msg3.clone()]);

        let deadline = initiator.next_timeout().unwrap();
        assert_eq!(sends(&initiator.handle_timeout(deadline)), vec![msg3]);

        initiator.on_secure_media();
        assert!(initiator.next_timeout().is_none());
    }

    #[test]
    fn garbage_is_dropped_without_failing() {
        let now = Instant::now();
        let mut initiator = NoiseEngine::generate(Role::Initiator);
        let mut responder = NoiseEngine::generate(Role::Responder);
        responder.start(now);

        assert!(responder.process_message(&[message_type::MSG1, 1, 2, 3], 1, now).is_empty());
        assert!(responder.process_message(&[], 1, now).is_empty());
        assert!(responder.process_message(&[0x7f, 0], 1, now).is_empty());

        let msg1 = sends(&initiator.start(now)).remove(0);
        let msg2 = sends(&responder.process_message(&msg1, 1, now)).remove(0);

        // a forged message 2 does not disturb the initiator
        let mut forged = msg2.clone();
        let last = forged.len() - 1;
        forged[last] ^= 0xff;
        assert!(initiator.process_message(&forged, 2, now).is_empty());
        assert!(!initiator.is_established());

        let msg3 = sends(&initiator.process_message(&msg2, 2, now)).remove(0);
        let mut forged = msg3.clone();
        forged[1] ^= 0xff;
        assert!(responder.process_message(&forged, 1, now).is_empty());
        assert_eq!(secrets(&responder.process_message(&msg3, 1, now)), 2);
        assert!(initiator.is_established() && responder.is_established());
    }

    #[test]
    fn fresh_msg1_replaces_an_answered_one() {
        let now = Instant::now();
        let mut initiator = NoiseEngine::generate(Role::Initiator);
        let mut responder = NoiseEngine::generate(Role::Responder);
        responder.start(now);

        // anything 32 bytes or longer parses as an ephemeral key
        let mut stray = vec![message_type::MSG1];
        stray.extend_from_slice(&[0x5a; 40]);
        let stray_answer = sends(&responder.process_message(&stray, 9, now));
        assert_eq!(stray_answer.len(), 1);

        let msg1 = sends(&initiator.start(now)).remove(0);
        let msg2 = sends(&responder.process_message(&msg1, 1, now)).remove(0);
        assert_ne!(vec![msg2.clone()], stray_answer);

        // the answer to the stray message cannot be read by the initiator
        assert!(initiator.process_message(&stray_answer[0], 2, now).is_empty());
        let msg3 = sends(&initiator.process_message(&msg2, 2, now)).remove(0);
        assert_eq!(secrets(&responder.process_message(&msg3, 1, now)), 2);
        assert_eq!(initiator.sas(), responder.sas());
    }

    #[test]
    fn stop_turns_security_off() {
        let now = Instant::now();
        let mut initiator = NoiseEngine::generate(Role::Initiator);
        let mut responder = NoiseEngine::generate(Role::Responder);
        responder.start(now);
        let msg1 = sends(&initiator.start(now)).remove(0);
        let msg2 = sends(&responder.process_message(&msg1, 1, now)).remove(0);
        initiator.process_message(&msg2, 2, now);

        let events = initiator.stop();
        assert!(matches!(
            events[..],
            [
                HandshakeEvent::SecretsOff(SecurityPart::Receiver),
                HandshakeEvent::SecretsOff(SecurityPart::Sender),
                HandshakeEvent::SecureOff
            ]
        ));
        assert!(initiator.next_timeout().is_none());
        assert!(responder.stop().is_empty());
    }
}
