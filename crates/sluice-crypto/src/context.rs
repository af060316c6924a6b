//! ChaCha20-Poly1305 RTP crypto context.
//!
//! # Wire Format
//!
//! ```text
//! [RTP header (cleartext, authenticated)] [ciphertext] [16 bytes: tag]
//! ```
//!
//! The padding bit is excluded from the authenticated header because the
//! receiver clears it before the padding count can be decrypted.
//!
//! Per-source keys are derived from the direction's master key:
//! - key  = SHA-256(master || "sluice rtp key"  || ssrc)
//! - salt = SHA-256(master || "sluice rtp salt" || ssrc)[..12]
//!
//! The nonce is `salt XOR (ssrc || index)` with the 48-bit packet index
//! built from the rollover counter and the RTP sequence number.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use sluice_core::crypto::{CryptoContext, CryptoError, TEMPLATE_SSRC};
use sluice_core::rtp::RtpPacket;

use crate::replay::ReplayWindow;

pub const CIPHER_NAME: &str = "ChaCha20-Poly1305";

/// Poly1305 tag appended to every protected packet.
pub const TAG_LEN: usize = 16;

const KEY_LABEL: &[u8] = b"sluice rtp key";
const SALT_LABEL: &[u8] = b"sluice rtp salt";
const PADDING_BIT: u8 = 0x20;

struct SessionKeys {
    ssrc: u32,
    cipher: ChaCha20Poly1305,
    salt: [u8; 12],
}

impl SessionKeys {
    fn derive(master: &[u8; 32], ssrc: u32) -> Self {
        let key = Zeroizing::new(kdf(master, KEY_LABEL, ssrc));
        let salt_block = kdf(master, SALT_LABEL, ssrc);
        let mut salt = [0u8; 12];
        salt.copy_from_slice(&salt_block[..12]);
        Self {
            ssrc,
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key[..])),
            salt,
        }
    }

    fn nonce(&self, index: u64) -> Nonce {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.ssrc.to_be_bytes());
        nonce[4..].copy_from_slice(&index.to_be_bytes());
        for (byte, salt) in nonce.iter_mut().zip(self.salt) {
            *byte ^= salt;
        }
        *Nonce::from_slice(&nonce)
    }
}

fn kdf(master: &[u8; 32], label: &[u8], ssrc: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(master);
    hasher.update(label);
    hasher.update(ssrc.to_be_bytes());
    hasher.finalize().into()
}

/// Rollover counter tracking for 16-bit sequence numbers.
#[derive(Debug, Clone, Copy, Default)]
struct Rollover {
    roc: u32,
    last_seq: Option<u16>,
}

impl Rollover {
    /// Guess the rollover counter the sender used for `seq`.
    fn estimate(&self, seq: u16) -> u32 {
        let Some(last) = self.last_seq else {
            return self.roc;
        };
        if last < 0x8000 {
            if seq > last && seq - last > 0x8000 {
                self.roc.saturating_sub(1)
            } else {
                self.roc
            }
        } else if seq < last - 0x8000 {
            self.roc.wrapping_add(1)
        } else {
            self.roc
        }
    }

    fn update(&mut self, seq: u16, roc: u32) {
        match self.last_seq {
            Some(last) if roc < self.roc || (roc == self.roc && seq <= last) => {}
            _ => {
                self.roc = roc;
                self.last_seq = Some(seq);
            }
        }
    }
}

fn packet_index(roc: u32, seq: u16) -> u64 {
    (u64::from(roc) << 16) | u64::from(seq)
}

/// One direction's keys for one SSRC, or the template for all of them.
pub struct ChaChaContext {
    ssrc: u32,
    master: Zeroizing<[u8; 32]>,
    keys: Option<SessionKeys>,
    rollover: Rollover,
    replay: ReplayWindow,
    replay_size: u64,
}

impl std::fmt::Debug for ChaChaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaChaContext")
            .field("ssrc", &self.ssrc)
            .field("roc", &self.rollover.roc)
            .field("highest_index", &self.replay.highest())
            .finish_non_exhaustive()
    }
}

impl ChaChaContext {
    /// Template context installed under SSRC 0.
    pub fn template(master: [u8; 32]) -> Self {
        Self::for_source(master, TEMPLATE_SSRC)
    }

    pub fn for_source(master: [u8; 32], ssrc: u32) -> Self {
        Self {
            ssrc,
            master: Zeroizing::new(master),
            keys: None,
            rollover: Rollover::default(),
            replay: ReplayWindow::default(),
            replay_size: ReplayWindow::DEFAULT_SIZE,
        }
    }

    pub fn with_replay_window(mut self, size: u64) -> Self {
        self.replay = ReplayWindow::new(size);
        self.replay_size = size;
        self
    }

    /// Rollover counter of the last authenticated or protected packet.
    pub fn rollover_counter(&self) -> u32 {
        self.rollover.roc
    }

    /// Derive session keys for `ssrc` unless they are current. A new SSRC
    /// starts a new index space.
    fn ensure_keys(&mut self, ssrc: u32) {
        if self.keys.as_ref().is_some_and(|k| k.ssrc == ssrc) {
            return;
        }
        self.keys = Some(SessionKeys::derive(&self.master, ssrc));
        self.rollover = Rollover::default();
        self.replay.reset();
    }
}

impl CryptoContext for ChaChaContext {
    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn unprotect(&mut self, packet: &mut RtpPacket) -> Result<(), CryptoError> {
        let body_len = packet.body().len();
        if body_len < TAG_LEN {
            return Err(CryptoError::TooShort(body_len));
        }
        self.ensure_keys(packet.ssrc());

        let seq = packet.sequence();
        let roc = self.rollover.estimate(seq);
        let index = packet_index(roc, seq);
        if !self.replay.check(index) {
            return Err(CryptoError::Replay(index));
        }

        let keys = self.keys.as_ref().ok_or(CryptoError::NoSessionKeys)?;
        let plaintext = keys
            .cipher
            .decrypt(
                &keys.nonce(index),
                Payload {
                    msg: packet.body(),
                    aad: packet.header(),
                },
            )
            .map_err(|_| CryptoError::AuthFailed)?;

        self.replay.accept(index);
        self.rollover.update(seq, roc);
        packet.replace_body(plaintext);
        Ok(())
    }

    fn protect(&mut self, packet: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let parsed = RtpPacket::parse(packet.to_vec()).map_err(|_| CryptoError::Encrypt)?;
        self.ensure_keys(parsed.ssrc());

        let seq = parsed.sequence();
        let roc = self.rollover.estimate(seq);
        self.rollover.update(seq, roc);
        let index = packet_index(roc, seq);

        let mut aad = parsed.header().to_vec();
        aad[0] &= !PADDING_BIT;

        let keys = self.keys.as_ref().ok_or(CryptoError::NoSessionKeys)?;
        let sealed = keys
            .cipher
            .encrypt(
                &keys.nonce(index),
                Payload {
                    msg: parsed.body(),
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(parsed.header_len() + sealed.len());
        out.extend_from_slice(parsed.header());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn derive_for_source(&self, ssrc: u32) -> Option<Box<dyn CryptoContext>> {
        let mut context = Self::for_source(*self.master, ssrc).with_replay_window(self.replay_size);
        context.ensure_keys(ssrc);
        Some(Box::new(context))
    }
}
