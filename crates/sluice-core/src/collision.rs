//! SSRC collision and loop detection (RFC 3550 §8.2).
//!
//! The policy only decides; the incoming queue applies the verdict to the
//! directory and, for [`CollisionVerdict::RenewLocalSsrc`], picks a new
//! local identifier.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::config::DEFAULT_CONFLICT_TIMEOUT_MS;

pub const LOCAL_SSRC_RENEW_ATTEMPTS: usize = 20;

/// What the queue knows about a data packet's source when it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollisionCheck {
    pub ssrc: u32,
    /// The directory entry was created for this packet.
    pub created: bool,
    pub from: SocketAddr,
    pub known_addr: Option<SocketAddr>,
    /// Address this source previously moved away from.
    pub prev_conflict: Option<SocketAddr>,
    pub local_ssrc: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionVerdict {
    Accept,
    /// Remote source changed transport address; follow it.
    Relocate,
    Reject,
    /// Someone else uses our SSRC. Pick a new one and keep the packet.
    RenewLocalSsrc,
}

pub trait CollisionPolicy: Send {
    fn check(&mut self, check: &CollisionCheck, now: Instant) -> CollisionVerdict;

    /// Called from housekeeping to age out remembered state.
    fn prune(&mut self, _now: Instant) {}
}

#[derive(Debug, Clone, Copy)]
struct ConflictRecord {
    last_seen: Instant,
    count: u64,
}

/// Keeps packets from a source that moved, but refuses to flip back to an
/// address it already left. Collisions on our own SSRC trigger renewal the
/// first time and are treated as a loop afterwards.
#[derive(Debug)]
pub struct RfcCollisionPolicy {
    conflicts: HashMap<SocketAddr, ConflictRecord>,
    conflict_timeout: Duration,
}

impl Default for RfcCollisionPolicy {
    fn default() -> Self {
        Self::with_conflict_timeout(Duration::from_millis(DEFAULT_CONFLICT_TIMEOUT_MS))
    }
}

impl RfcCollisionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conflicting addresses are forgotten once quiet for `timeout`.
    pub fn with_conflict_timeout(timeout: Duration) -> Self {
        Self {
            conflicts: HashMap::new(),
            conflict_timeout: timeout,
        }
    }

    /// Addresses that collided with the local SSRC.
    pub fn conflicts(&self) -> impl Iterator<Item = (SocketAddr, u64)> + '_ {
        self.conflicts.iter().map(|(addr, rec)| (*addr, rec.count))
    }

}

impl CollisionPolicy for RfcCollisionPolicy {
    fn check(&mut self, check: &CollisionCheck, now: Instant) -> CollisionVerdict {
        let is_local = check.local_ssrc == Some(check.ssrc);
        if check.created && !is_local {
            return CollisionVerdict::Accept;
        }
        if check.known_addr == Some(check.from) {
            return CollisionVerdict::Accept;
        }

        if !is_local {
            if check.known_addr.is_none() {
                return CollisionVerdict::Accept;
            }
            if check.prev_conflict == Some(check.from) {
                return CollisionVerdict::Reject;
            }
            return CollisionVerdict::Relocate;
        }

        if let Some(record) = self.conflicts.get_mut(&check.from) {
            record.last_seen = now;
            record.count += 1;
            return CollisionVerdict::Reject;
        }

        warn!(
            "SSRC collision on local id {:#010x} from {}",
            check.ssrc, check.from
        );
        self.conflicts.insert(
            check.from,
            ConflictRecord {
                last_seen: now,
                count: 1,
            },
        );
        CollisionVerdict::RenewLocalSsrc
    }

    fn prune(&mut self, now: Instant) {
        let timeout = self.conflict_timeout;
        let before = self.conflicts.len();
        self.conflicts
            .retain(|_, rec| now.saturating_duration_since(rec.last_seen) < timeout);
        let forgotten = before - self.conflicts.len();
        if forgotten > 0 {
            debug!("forgot {} conflicting addresses", forgotten);
        }
    }
}

/// Pick a random SSRC that is neither 0 nor taken.
pub fn pick_local_ssrc<R: Rng>(rng: &mut R, taken: impl Fn(u32) -> bool) -> Option<u32> {
    (0..LOCAL_SSRC_RENEW_ATTEMPTS)
        .map(|_| rng.gen::<u32>())
        .find(|&candidate| candidate != 0 && !taken(candidate))
}
