//! The incoming queue: one lock over the source directory, the packet
//! queue and the security gate.
//!
//! The worker calls [`IncomingQueue::ingest`] for every datagram; consumers
//! extract packets from other threads. Every datagram produces an
//! [`IngestOutcome`] and nothing on this path is fatal.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::collision::{
    pick_local_ssrc, CollisionCheck, CollisionPolicy, CollisionVerdict, RfcCollisionPolicy,
};
use crate::config::{ConfigError, QueueConfig};
use crate::control::{is_media, ControlFrame, ControlFrameError};
use crate::crypto::{CryptoContext, CryptoError};
use crate::directory::SourceDirectory;
use crate::gate::{GateState, SecurityGate};
use crate::handshake::HandshakeEngine;
use crate::hooks::{NoopHooks, QueueHooks};
use crate::queue::{InsertError, PacketQueue, QueuedPacket};
use crate::rtp::{RtpError, RtpPacket};
use crate::source::{LossReport, Reception, SequencePolicy, SourceSnapshot};
use crate::stats::{add, bump, QueueStats, StatsSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Empty,
    Oversize(usize),
    InvalidHeader(RtpError),
    ShortControlFrame,
    ChecksumMismatch,
    BadMagic,
    HandshakeDisabled,
    HandshakeNotStarted,
    Unprotect(CryptoError),
    RejectedByHook,
    Collision,
    Probation,
    SequenceRejected,
    Duplicate,
    QueueFull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Queued { ssrc: u32, sequence: u16 },
    /// Control frame handed to the handshake engine.
    Control { ssrc: u32 },
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub expired_packets: usize,
    pub removed_sources: usize,
}

struct Inner {
    directory: SourceDirectory,
    queue: PacketQueue,
    gate: SecurityGate,
    collision: Box<dyn CollisionPolicy>,
    local_ssrc: Option<u32>,
}

impl Inner {
    fn local_ssrc(&self) -> u32 {
        self.local_ssrc.unwrap_or(0)
    }

    /// Drop a source with its packets and context. The caller fires
    /// `on_source_removed` once the lock is released.
    fn remove_source(&mut self, ssrc: u32) -> Option<usize> {
        self.directory.remove(ssrc)?;
        let purged = self.queue.purge_source(ssrc);
        self.gate.registry_mut().remove(ssrc);
        Some(purged)
    }
}

pub struct IncomingQueueBuilder {
    config: QueueConfig,
    hooks: Arc<dyn QueueHooks>,
    engine: Option<Box<dyn HandshakeEngine>>,
    collision: Box<dyn CollisionPolicy>,
    control_peer: Option<SocketAddr>,
}

impl IncomingQueueBuilder {
    pub fn hooks(mut self, hooks: Arc<dyn QueueHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn handshake(mut self, engine: Box<dyn HandshakeEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn collision_policy(mut self, policy: Box<dyn CollisionPolicy>) -> Self {
        self.collision = policy;
        self
    }

    pub fn control_peer(mut self, peer: SocketAddr) -> Self {
        self.control_peer = Some(peer);
        self
    }

    pub fn build(self) -> Result<IncomingQueue, ConfigError> {
        self.config.validate()?;
        let mut gate = SecurityGate::new(self.engine, self.config.handshake_enabled);
        if let Some(peer) = self.control_peer {
            gate.pin_peer(peer);
        }
        let inner = Inner {
            directory: SourceDirectory::new(
                self.config.directory_capacity,
                SequencePolicy::from(&self.config),
            ),
            queue: PacketQueue::new(self.config.max_queued_packets),
            gate,
            collision: self.collision,
            local_ssrc: self.config.local_ssrc,
        };
        Ok(IncomingQueue {
            inner: Mutex::new(inner),
            hooks: self.hooks,
            stats: QueueStats::default(),
            config: self.config,
        })
    }
}

pub struct IncomingQueue {
    inner: Mutex<Inner>,
    hooks: Arc<dyn QueueHooks>,
    stats: QueueStats,
    config: QueueConfig,
}

impl IncomingQueue {
    pub fn builder(config: QueueConfig) -> IncomingQueueBuilder {
        let collision = RfcCollisionPolicy::with_conflict_timeout(config.conflict_timeout());
        IncomingQueueBuilder {
            config,
            hooks: Arc::new(NoopHooks),
            engine: None,
            collision: Box::new(collision),
            control_peer: None,
        }
    }

    pub fn new(config: QueueConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run one datagram through classification, decryption, validation and
    /// insertion.
    pub fn ingest(&self, datagram: Vec<u8>, from: SocketAddr, now: Instant) -> IngestOutcome {
        bump(&self.stats.datagrams);

        let Some(&first) = datagram.first() else {
            bump(&self.stats.invalid_header);
            return IngestOutcome::Dropped(DropReason::Empty);
        };
        if datagram.len() > self.config.max_recv_packet_size {
            bump(&self.stats.oversize);
            debug!("oversize datagram from {}: {} bytes", from, datagram.len());
            return IngestOutcome::Dropped(DropReason::Oversize(datagram.len()));
        }

        if is_media(first) {
            self.ingest_media(datagram, from, now)
        } else {
            self.ingest_control(datagram, from, now)
        }
    }

    fn ingest_control(&self, datagram: Vec<u8>, from: SocketAddr, now: Instant) -> IngestOutcome {
        bump(&self.stats.control_frames);

        // Nothing is locked or mutated until the frame checks out.
        let min_len = self.config.min_control_frame_len;
        let frame = match ControlFrame::decode(Bytes::from(datagram), min_len) {
            Ok(frame) => frame,
            Err(err) => {
                let (counter, reason) = match err {
                    ControlFrameError::TooShort { .. } => {
                        (&self.stats.short_control, DropReason::ShortControlFrame)
                    }
                    ControlFrameError::ChecksumMismatch { .. } => {
                        (&self.stats.checksum_mismatch, DropReason::ChecksumMismatch)
                    }
                    ControlFrameError::BadMagic(_) => (&self.stats.bad_magic, DropReason::BadMagic),
                };
                bump(counter);
                let message = format!("discarding control frame from {}: {}", from, err);
                warn!("{}", message);
                self.hooks.on_control_warning(&message);
                return IngestOutcome::Dropped(reason);
            }
        };

        let hooks = &*self.hooks;
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.gate.enabled() {
            debug!("control frame from {} ignored, key agreement disabled", from);
            return IngestOutcome::Dropped(DropReason::HandshakeDisabled);
        }

        inner.gate.learn_peer(from);
        let local_ssrc = inner.local_ssrc();
        if !inner.gate.is_started() && self.config.auto_start.on_control() {
            inner.gate.start(now, hooks, local_ssrc);
        }
        if let Some(source) = inner.directory.get_mut(frame.ssrc) {
            source.force_valid(now);
        }
        if !inner.gate.is_started() {
            debug!("control frame from {} before key agreement started", from);
            return IngestOutcome::Dropped(DropReason::HandshakeNotStarted);
        }
        inner.gate.process_control(&frame, now, hooks, local_ssrc);

        IngestOutcome::Control { ssrc: frame.ssrc }
    }

    fn ingest_media(&self, mut datagram: Vec<u8>, from: SocketAddr, now: Instant) -> IngestOutcome {
        bump(&self.stats.media_packets);

        // The padding count may sit inside the ciphertext.
        let had_padding = RtpPacket::strip_padding_flag(&mut datagram);
        let mut packet = match RtpPacket::parse(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                bump(&self.stats.invalid_header);
                debug!("invalid RTP header from {}: {}", from, err);
                return IngestOutcome::Dropped(DropReason::InvalidHeader(err));
            }
        };
        let ssrc = packet.ssrc();
        let sequence = packet.sequence();
        let hooks = &*self.hooks;

        let mut guard = self.lock();
        let inner = &mut *guard;
        let local_ssrc = inner.local_ssrc();

        // 1. Authenticate and decrypt
        let mut authenticated = false;
        if let Some(result) = inner.gate.unprotect(&mut packet) {
            match result {
                Ok(()) => authenticated = true,
                Err(err) => {
                    match err {
                        CryptoError::Replay(_) => bump(&self.stats.replays),
                        _ => bump(&self.stats.decrypt_failures),
                    }
                    warn!(
                        "unprotect failed for {:#010x} seq {}: {} (code {})",
                        ssrc,
                        sequence,
                        err,
                        err.code()
                    );
                    if !hooks.on_packet_error(&packet, &err) {
                        return IngestOutcome::Dropped(DropReason::Unprotect(err));
                    }
                    bump(&self.stats.admitted_after_error);
                }
            }
        }
        if had_padding {
            if let Err(err) = packet.restore_padding() {
                bump(&self.stats.invalid_header);
                debug!("bad padding from {:#010x}: {}", ssrc, err);
                return IngestOutcome::Dropped(DropReason::InvalidHeader(err));
            }
        }
        if authenticated {
            inner.gate.confirm_secure_media(hooks, local_ssrc);
        }
        if !hooks.on_media_packet(&packet) {
            bump(&self.stats.rejected_by_hook);
            return IngestOutcome::Dropped(DropReason::RejectedByHook);
        }

        // 2. Source lookup and collision check
        let (source, created) = inner.directory.lookup_or_create(ssrc, now);
        if created {
            bump(&self.stats.sources_created);
        }
        let check = CollisionCheck {
            ssrc,
            created,
            from,
            known_addr: source.address(),
            prev_conflict: source.conflicting_address(),
            local_ssrc: inner.local_ssrc,
        };
        match inner.collision.check(&check, now) {
            CollisionVerdict::Accept => {
                if check.known_addr.is_none() {
                    source.set_address(from);
                }
            }
            CollisionVerdict::Relocate => {
                if let Some(old) = check.known_addr {
                    source.set_conflicting_address(old);
                }
                source.set_address(from);
                debug!("source {:#010x} moved to {}", ssrc, from);
            }
            CollisionVerdict::Reject => {
                bump(&self.stats.collisions);
                debug!("dropping colliding packet for {:#010x} from {}", ssrc, from);
                return IngestOutcome::Dropped(DropReason::Collision);
            }
            CollisionVerdict::RenewLocalSsrc => {
                bump(&self.stats.collisions);
                let old = inner.local_ssrc;
                let directory = &inner.directory;
                match pick_local_ssrc(&mut rand::thread_rng(), |id| directory.contains(id)) {
                    Some(new) => {
                        inner.local_ssrc = Some(new);
                        info!("local SSRC renewed: {:?} -> {:#010x}", old, new);
                        hooks.on_local_ssrc_changed(old, new);
                    }
                    None => warn!("could not find a free local SSRC"),
                }
                let source = inner.directory.reset(ssrc, now);
                source.set_address(from);
            }
        }

        // 3. Sequence validation
        let Some(source) = inner.directory.get_mut(ssrc) else {
            return IngestOutcome::Dropped(DropReason::Collision);
        };
        source.anchor(packet.timestamp(), now);
        if source.say_hello() {
            let snapshot = source.snapshot();
            info!("new source {:#010x} from {}", ssrc, from);
            hooks.on_new_source(&snapshot);
        }
        match source.record_reception(sequence, now) {
            Reception::Accepted | Reception::Reordered => {}
            Reception::ProbationRejected => {
                bump(&self.stats.sequence_rejected);
                debug!("{:#010x} seq {} held back by probation", ssrc, sequence);
                return IngestOutcome::Dropped(DropReason::Probation);
            }
            Reception::SequenceRejected => {
                bump(&self.stats.sequence_rejected);
                debug!("{:#010x} seq {} outside the sequence window", ssrc, sequence);
                return IngestOutcome::Dropped(DropReason::SequenceRejected);
            }
        }
        source.add_octets(packet.payload().len());
        let shifted = source.shift(packet.timestamp());
        inner.directory.mark_sender(ssrc);

        // 4. Queue
        let item = QueuedPacket {
            ssrc,
            shifted_timestamp: shifted,
            arrival: now,
            packet,
        };
        match inner.queue.insert(item) {
            Ok(_) => {}
            Err(InsertError::Duplicate { .. }) => {
                bump(&self.stats.duplicates);
                debug!("duplicate timestamp {} from {:#010x}", shifted, ssrc);
                return IngestOutcome::Dropped(DropReason::Duplicate);
            }
            Err(InsertError::Full(_)) => {
                bump(&self.stats.queue_full);
                debug!("queue full, dropping {:#010x} seq {}", ssrc, sequence);
                return IngestOutcome::Dropped(DropReason::QueueFull);
            }
        }
        bump(&self.stats.queued);
        if let Some(source) = inner.directory.get_mut(ssrc) {
            source.update_jitter(shifted, now, self.config.clock_rate);
        }

        if !inner.gate.is_started() && self.config.auto_start.on_media() {
            inner.gate.start(now, hooks, local_ssrc);
        }

        IngestOutcome::Queued { ssrc, sequence }
    }

    /// Remove the first packet with this shifted timestamp.
    pub fn extract(&self, timestamp: u32, ssrc: Option<u32>) -> Option<QueuedPacket> {
        let packet = self.lock().queue.extract(timestamp, ssrc);
        if packet.is_some() {
            bump(&self.stats.extracted);
        }
        packet
    }

    /// Remove the oldest packet, globally or for one source.
    pub fn pop_front(&self, ssrc: Option<u32>) -> Option<QueuedPacket> {
        let packet = self.lock().queue.pop_front(ssrc);
        if packet.is_some() {
            bump(&self.stats.extracted);
        }
        packet
    }

    pub fn is_waiting(&self, ssrc: Option<u32>) -> bool {
        self.lock().queue.is_waiting(ssrc)
    }

    pub fn first_timestamp(&self, ssrc: Option<u32>) -> Option<u32> {
        self.lock().queue.first_timestamp(ssrc)
    }

    pub fn queued_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Drop every queued packet with a shifted timestamp below `before`.
    pub fn expire(&self, before: u32) -> usize {
        let mut dropped = Vec::new();
        self.lock()
            .queue
            .expire(before, |packet| dropped.push(packet));
        for packet in &dropped {
            self.hooks.on_expired_packet(packet);
        }
        add(&self.stats.expired, dropped.len());
        dropped.len()
    }

    /// Empty the packet queue; sources are kept.
    pub fn purge(&self) -> usize {
        self.lock().queue.clear()
    }

    /// Forget every source, its queued packets and derived context, and
    /// resize the directory. The receive template is kept.
    pub fn reset_sources(&self, capacity: usize) {
        let removed = {
            let mut inner = self.lock();
            let removed = inner.directory.ids();
            inner.queue.clear();
            inner.gate.registry_mut().clear_derived();
            inner.directory.reinit(capacity);
            removed
        };
        add(&self.stats.sources_removed, removed.len());
        for ssrc in removed {
            self.hooks.on_source_removed(ssrc);
        }
    }

    pub fn sources(&self) -> Vec<SourceSnapshot> {
        self.lock().directory.iter().map(|s| s.snapshot()).collect()
    }

    pub fn source(&self, ssrc: u32) -> Option<SourceSnapshot> {
        self.lock().directory.get(ssrc).map(|s| s.snapshot())
    }

    pub fn sender_count(&self) -> usize {
        self.lock().directory.sender_count()
    }

    pub fn loss_report(&self, ssrc: u32) -> Option<LossReport> {
        self.lock().directory.get_mut(ssrc).map(|s| s.loss_report())
    }

    pub fn mark_leaving(&self, ssrc: u32, now: Instant) -> bool {
        self.lock().directory.mark_leaving(ssrc, now)
    }

    /// Remove a source together with its queued packets and crypto context.
    pub fn remove_source(&self, ssrc: u32) -> bool {
        let removed = self.lock().remove_source(ssrc).is_some();
        if removed {
            bump(&self.stats.sources_removed);
            self.hooks.on_source_removed(ssrc);
        }
        removed
    }

    /// Periodic work: age out packets, sources and collision records, fire
    /// handshake timers.
    ///
    /// Expiry hooks run after the lock is released.
    pub fn housekeeping(&self, now: Instant) -> HousekeepingReport {
        let hooks = &*self.hooks;
        let mut report = HousekeepingReport::default();
        let mut aged = Vec::new();
        let mut removed = Vec::new();
        {
            let mut guard = self.lock();
            let inner = &mut *guard;

            if let Some(deadline) = now.checked_sub(self.config.packet_max_age()) {
                inner
                    .queue
                    .expire_arrived_before(deadline, |packet| aged.push(packet));
            }
            report.expired_packets = aged.len();

            let gone = inner.directory.expired(
                now,
                self.config.source_timeout(),
                self.config.goodbye_grace(),
            );
            for ssrc in gone {
                if let Some(purged) = inner.remove_source(ssrc) {
                    debug!("source {:#010x} expired, {} packets purged", ssrc, purged);
                    report.expired_packets += purged;
                    removed.push(ssrc);
                }
            }
            report.removed_sources = removed.len();

            inner.collision.prune(now);

            let local_ssrc = inner.local_ssrc();
            inner.gate.handle_timeout(now, hooks, local_ssrc);
        }

        for packet in &aged {
            hooks.on_expired_packet(packet);
        }
        for ssrc in removed {
            hooks.on_source_removed(ssrc);
        }

        add(&self.stats.expired, report.expired_packets);
        add(&self.stats.sources_removed, report.removed_sources);
        report
    }

    pub fn local_ssrc(&self) -> Option<u32> {
        self.lock().local_ssrc
    }

    pub fn set_local_ssrc(&self, ssrc: u32) {
        self.lock().local_ssrc = Some(ssrc);
    }

    pub fn start_handshake(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        let local_ssrc = inner.local_ssrc();
        inner.gate.start(now, &*self.hooks, local_ssrc)
    }

    pub fn stop_handshake(&self) {
        let mut inner = self.lock();
        let local_ssrc = inner.local_ssrc();
        inner.gate.stop(&*self.hooks, local_ssrc);
    }

    pub fn set_handshake_enabled(&self, enabled: bool) {
        self.lock().gate.set_enabled(enabled);
    }

    pub fn handshake_enabled(&self) -> bool {
        self.lock().gate.enabled()
    }

    pub fn gate_state(&self) -> GateState {
        self.lock().gate.state()
    }

    /// Install a receive context; SSRC 0 makes it the template.
    pub fn install_context(&self, context: Box<dyn CryptoContext>) {
        self.lock().gate.install(context);
    }

    pub fn remove_context(&self, ssrc: u32) -> bool {
        self.lock().gate.registry_mut().remove(ssrc)
    }

    pub fn set_sender_context(&self, context: Option<Box<dyn CryptoContext>>) {
        self.lock().gate.registry_mut().set_outbound(context);
    }

    /// Protect a packet on the application's send path. Unprotected when no
    /// send context is installed.
    pub fn protect_outgoing(&self, packet: &[u8], now: Instant) -> Result<Vec<u8>, CryptoError> {
        let mut inner = self.lock();
        if !inner.gate.is_started() && self.config.auto_start.on_media() {
            let local_ssrc = inner.local_ssrc();
            inner.gate.start(now, &*self.hooks, local_ssrc);
        }
        inner.gate.protect(packet)
    }

    pub fn set_control_peer(&self, peer: SocketAddr) {
        self.lock().gate.pin_peer(peer);
    }

    pub fn control_peer(&self) -> Option<SocketAddr> {
        self.lock().gate.peer()
    }

    /// Control frames ready to send, paired with their destination.
    pub fn drain_outbound(&self) -> Vec<(SocketAddr, Bytes)> {
        self.lock().gate.drain_outbound()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn record_transport_error(&self) {
        bump(&self.stats.transport_errors);
    }

    pub(crate) fn record_oversize(&self) {
        bump(&self.stats.oversize);
    }

    /// Verify the dual-list invariant of the packet queue.
    pub fn check_consistency(&self) -> Result<(), String> {
        self.lock().queue.check_consistency()
    }
}

impl std::fmt::Debug for IncomingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingQueue")
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}
