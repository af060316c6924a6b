use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters readable without taking the queue lock.
#[derive(Debug, Default)]
pub struct QueueStats {
    pub datagrams: AtomicU64,
    pub media_packets: AtomicU64,
    pub control_frames: AtomicU64,
    pub queued: AtomicU64,
    pub extracted: AtomicU64,
    pub expired: AtomicU64,
    pub transport_errors: AtomicU64,
    pub oversize: AtomicU64,
    pub invalid_header: AtomicU64,
    pub short_control: AtomicU64,
    pub checksum_mismatch: AtomicU64,
    pub bad_magic: AtomicU64,
    pub decrypt_failures: AtomicU64,
    pub replays: AtomicU64,
    pub admitted_after_error: AtomicU64,
    pub rejected_by_hook: AtomicU64,
    pub collisions: AtomicU64,
    pub sequence_rejected: AtomicU64,
    pub duplicates: AtomicU64,
    pub queue_full: AtomicU64,
    pub sources_created: AtomicU64,
    pub sources_removed: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub datagrams: u64,
    pub media_packets: u64,
    pub control_frames: u64,
    pub queued: u64,
    pub extracted: u64,
    pub expired: u64,
    pub transport_errors: u64,
    pub oversize: u64,
    pub invalid_header: u64,
    pub short_control: u64,
    pub checksum_mismatch: u64,
    pub bad_magic: u64,
    pub decrypt_failures: u64,
    pub replays: u64,
    pub admitted_after_error: u64,
    pub rejected_by_hook: u64,
    pub collisions: u64,
    pub sequence_rejected: u64,
    pub duplicates: u64,
    pub queue_full: u64,
    pub sources_created: u64,
    pub sources_removed: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

impl QueueStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            media_packets: self.media_packets.load(Ordering::Relaxed),
            control_frames: self.control_frames.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            extracted: self.extracted.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            oversize: self.oversize.load(Ordering::Relaxed),
            invalid_header: self.invalid_header.load(Ordering::Relaxed),
            short_control: self.short_control.load(Ordering::Relaxed),
            checksum_mismatch: self.checksum_mismatch.load(Ordering::Relaxed),
            bad_magic: self.bad_magic.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            admitted_after_error: self.admitted_after_error.load(Ordering::Relaxed),
            rejected_by_hook: self.rejected_by_hook.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
            sequence_rejected: self.sequence_rejected.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            sources_created: self.sources_created.load(Ordering::Relaxed),
            sources_removed: self.sources_removed.load(Ordering::Relaxed),
        }
    }
}
