//! Per-source bookkeeping and the RFC 3550 §A.1 sequence validation
//! state machine.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::QueueConfig;

const RTP_SEQ_MOD: u32 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    /// In-order packets still required before the source is trusted.
    Probation(u16),
    Valid,
}

/// Result of feeding one sequence number into a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reception {
    /// In order; the highest sequence number advanced.
    Accepted,
    /// Inside the misorder window or a duplicate; `max_seq` unchanged.
    Reordered,
    ProbationRejected,
    /// Beyond the dropout or misorder limits.
    SequenceRejected,
}

impl Reception {
    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted | Self::Reordered)
    }
}

/// Thresholds copied from the queue configuration when a source is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencePolicy {
    pub min_valid_sequence: u16,
    pub max_dropout: u16,
    pub max_misorder: u16,
    pub min_sequential: u16,
}

impl From<&QueueConfig> for SequencePolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            min_valid_sequence: config.min_valid_sequence,
            max_dropout: config.max_dropout,
            max_misorder: config.max_misorder,
            min_sequential: config.min_sequential,
        }
    }
}

impl Default for SequencePolicy {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RestartRun {
    base: u16,
    next: u16,
    count: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LossReport {
    pub expected: u32,
    pub cumulative_lost: u32,
    /// Fixed point, lost fraction * 256 since the previous report.
    pub fraction_lost: u8,
    pub extended_max_seq: u32,
    pub jitter: f64,
}

#[derive(Debug, Clone)]
pub struct Source {
    ssrc: u32,
    policy: SequencePolicy,
    validity: Validity,
    seq_started: bool,
    max_seq: u16,
    cycles: u32,
    base_seq: u32,
    restart: Option<RestartRun>,
    received: u32,
    received_octets: u64,
    prior_expected: u32,
    prior_lost: u32,
    jitter: f64,
    transit: Option<u32>,
    first_arrival: Option<Instant>,
    first_timestamp: u32,
    last_packet: Option<Instant>,
    last_control: Option<Instant>,
    created_at: Instant,
    hello: bool,
    goodbye_at: Option<Instant>,
    sender: bool,
    addr: Option<SocketAddr>,
    conflicting_addr: Option<SocketAddr>,
}

impl Source {
    pub fn new(ssrc: u32, policy: SequencePolicy, now: Instant) -> Self {
        let validity = if policy.min_valid_sequence == 0 {
            Validity::Valid
        } else {
            Validity::Probation(policy.min_valid_sequence)
        };
        Self {
            ssrc,
            policy,
            validity,
            seq_started: false,
            max_seq: 0,
            cycles: 0,
            base_seq: 0,
            restart: None,
            received: 0,
            received_octets: 0,
            prior_expected: 0,
            prior_lost: 0,
            jitter: 0.0,
            transit: None,
            first_arrival: None,
            first_timestamp: 0,
            last_packet: None,
            last_control: None,
            created_at: now,
            hello: false,
            goodbye_at: None,
            sender: false,
            addr: None,
            conflicting_addr: None,
        }
    }

    /// Feed one sequence number through the validation state machine.
    pub fn record_reception(&mut self, seq: u16, now: Instant) -> Reception {
        self.last_packet = Some(now);

        if !self.seq_started {
            self.seq_started = true;
            if self.validity == Validity::Valid {
                self.init_sequence(seq);
                self.received = 1;
                return Reception::Accepted;
            }
            return self.restart_probation(seq);
        }

        match self.validity {
            Validity::Probation(remaining) => {
                if seq == self.max_seq.wrapping_add(1) {
                    self.advance_probation(seq, remaining)
                } else {
                    self.restart_probation(seq)
                }
            }
            Validity::Valid => self.update_valid(seq),
        }
    }

    /// The packet that starts a new stream counts as its first in-order packet.
    fn restart_probation(&mut self, seq: u16) -> Reception {
        if self.policy.min_valid_sequence == 0 {
            self.validity = Validity::Valid;
            self.init_sequence(seq);
            self.received = 1;
            return Reception::Accepted;
        }
        self.max_seq = seq.wrapping_sub(1);
        self.advance_probation(seq, self.policy.min_valid_sequence)
    }

    fn advance_probation(&mut self, seq: u16, remaining: u16) -> Reception {
        let remaining = remaining.saturating_sub(1);
        self.max_seq = seq;
        if remaining == 0 {
            self.validity = Validity::Valid;
            self.init_sequence(seq);
            self.received = 1;
            Reception::Accepted
        } else {
            self.validity = Validity::Probation(remaining);
            Reception::ProbationRejected
        }
    }

    fn update_valid(&mut self, seq: u16) -> Reception {
        let udelta = seq.wrapping_sub(self.max_seq);

        if udelta == 0 {
            self.received = self.received.wrapping_add(1);
            return Reception::Reordered;
        }

        if udelta < self.policy.max_dropout {
            if seq < self.max_seq {
                self.cycles = self.cycles.wrapping_add(RTP_SEQ_MOD);
            }
            self.max_seq = seq;
            self.restart = None;
            self.received = self.received.wrapping_add(1);
            return Reception::Accepted;
        }

        if u32::from(udelta) >= RTP_SEQ_MOD - u32::from(self.policy.max_misorder) {
            self.received = self.received.wrapping_add(1);
            return Reception::Reordered;
        }

        // A large jump: either the sender restarted or this is garbage.
        // Only a sustained run from the new position moves the baseline.
        let run = match self.restart {
            Some(mut run) if seq == run.next => {
                run.count += 1;
                run.next = seq.wrapping_add(1);
                run
            }
            _ => RestartRun {
                base: seq,
                next: seq.wrapping_add(1),
                count: 0,
            },
        };

        if run.count >= self.policy.min_sequential {
            self.rebaseline(run, seq);
            Reception::Accepted
        } else {
            self.restart = Some(run);
            Reception::SequenceRejected
        }
    }

    fn rebaseline(&mut self, run: RestartRun, seq: u16) {
        if seq < self.max_seq {
            self.cycles = self.cycles.wrapping_add(RTP_SEQ_MOD);
        }
        self.max_seq = seq;
        let run_len = u32::from(seq.wrapping_sub(run.base)) + 1;
        self.base_seq = self.extended_max_seq().wrapping_sub(run_len - 1);
        self.received = run_len;
        self.prior_expected = 0;
        self.prior_lost = 0;
        self.restart = None;
    }

    fn init_sequence(&mut self, seq: u16) {
        self.max_seq = seq;
        self.base_seq = self.extended_max_seq();
        self.received = 0;
        self.prior_expected = 0;
        self.prior_lost = 0;
        self.restart = None;
    }

    /// Verified control traffic from this SSRC proves liveness; skip the
    /// rest of probation.
    pub fn force_valid(&mut self, now: Instant) {
        self.last_control = Some(now);
        if let Validity::Probation(_) = self.validity {
            self.validity = Validity::Valid;
            if self.seq_started {
                self.init_sequence(self.max_seq);
            }
        }
    }

    /// RFC 3550 §6.4.1 interarrival jitter. Arrival and the shifted
    /// timestamp share the source's zero-based timeline.
    pub fn update_jitter(&mut self, shifted_timestamp: u32, arrival: Instant, clock_rate: u32) {
        let first = *self.first_arrival.get_or_insert(arrival);
        let elapsed = arrival.saturating_duration_since(first);
        let arrival_units = (elapsed.as_micros() * u128::from(clock_rate) / 1_000_000) as u32;
        let transit = arrival_units.wrapping_sub(shifted_timestamp);

        if let Some(prev) = self.transit {
            let d = f64::from((transit.wrapping_sub(prev) as i32).unsigned_abs());
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.transit = Some(transit);
    }

    /// Loss statistics since the previous call.
    pub fn loss_report(&mut self) -> LossReport {
        let extended_max_seq = self.extended_max_seq();
        if self.validity != Validity::Valid || !self.seq_started {
            return LossReport {
                expected: 0,
                cumulative_lost: 0,
                fraction_lost: 0,
                extended_max_seq,
                jitter: self.jitter,
            };
        }

        let expected = extended_max_seq.wrapping_sub(self.base_seq).wrapping_add(1);
        let lost = expected.saturating_sub(self.received);

        let expected_interval = expected.wrapping_sub(self.prior_expected);
        let lost_interval = i64::from(lost) - i64::from(self.prior_lost);
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / i64::from(expected_interval)).clamp(0, 255) as u8
        };

        self.prior_expected = expected;
        self.prior_lost = lost;

        LossReport {
            expected,
            cumulative_lost: lost,
            fraction_lost,
            extended_max_seq,
            jitter: self.jitter,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub fn is_valid(&self) -> bool {
        self.validity == Validity::Valid
    }

    pub fn max_seq(&self) -> u16 {
        self.max_seq
    }

    pub fn extended_max_seq(&self) -> u32 {
        self.cycles.wrapping_add(u32::from(self.max_seq))
    }

    pub fn base_seq(&self) -> u32 {
        self.base_seq
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn received_octets(&self) -> u64 {
        self.received_octets
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn first_timestamp(&self) -> u32 {
        self.first_timestamp
    }

    pub fn first_arrival(&self) -> Option<Instant> {
        self.first_arrival
    }

    pub fn last_packet(&self) -> Option<Instant> {
        self.last_packet
    }

    pub fn last_control(&self) -> Option<Instant> {
        self.last_control
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn conflicting_address(&self) -> Option<SocketAddr> {
        self.conflicting_addr
    }

    pub fn is_sender(&self) -> bool {
        self.sender
    }

    pub fn is_leaving(&self) -> bool {
        self.goodbye_at.is_some()
    }

    pub fn goodbye_at(&self) -> Option<Instant> {
        self.goodbye_at
    }

    pub fn has_said_hello(&self) -> bool {
        self.hello
    }

    /// Anchor the zero-based timeline on the first data packet.
    pub(crate) fn anchor(&mut self, timestamp: u32, arrival: Instant) {
        if self.first_arrival.is_none() {
            self.first_arrival = Some(arrival);
            self.first_timestamp = timestamp;
        }
    }

    pub(crate) fn shift(&self, timestamp: u32) -> u32 {
        timestamp.wrapping_sub(self.first_timestamp)
    }

    /// Returns true only the first time.
    pub(crate) fn say_hello(&mut self) -> bool {
        !std::mem::replace(&mut self.hello, true)
    }

    /// Returns true only the first time.
    pub(crate) fn say_goodbye(&mut self, now: Instant) -> bool {
        if self.goodbye_at.is_some() {
            return false;
        }
        self.goodbye_at = Some(now);
        true
    }

    /// Returns true when the source first becomes a sender.
    pub(crate) fn mark_sender(&mut self) -> bool {
        !std::mem::replace(&mut self.sender, true)
    }

    pub(crate) fn add_octets(&mut self, octets: usize) {
        self.received_octets = self.received_octets.saturating_add(octets as u64);
    }

    pub(crate) fn set_address(&mut self, addr: SocketAddr) {
        self.addr = Some(addr);
    }

    pub(crate) fn set_conflicting_address(&mut self, addr: SocketAddr) {
        self.conflicting_addr = Some(addr);
    }

    /// Last sign of life from either plane.
    pub fn last_activity(&self) -> Instant {
        [self.last_packet, self.last_control]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.created_at)
    }

    pub fn is_silent_for(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity()) >= timeout
    }

    pub fn snapshot(&self) -> SourceSnapshot {
        SourceSnapshot {
            ssrc: self.ssrc,
            validity: self.validity,
            base_seq: self.base_seq,
            extended_max_seq: self.extended_max_seq(),
            received: self.received,
            received_octets: self.received_octets,
            jitter: self.jitter,
            sender: self.sender,
            leaving: self.is_leaving(),
            address: self.addr,
        }
    }
}

/// Read-only copy handed out across the queue lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSnapshot {
    pub ssrc: u32,
    pub validity: Validity,
    pub base_seq: u32,
    pub extended_max_seq: u32,
    pub received: u32,
    pub received_octets: u64,
    pub jitter: f64,
    pub sender: bool,
    pub leaving: bool,
    pub address: Option<SocketAddr>,
}
