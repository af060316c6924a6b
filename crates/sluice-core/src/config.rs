use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_DROPOUT: u16 = 3000;
pub const DEFAULT_MAX_MISORDER: u16 = 100;
pub const DEFAULT_MIN_SEQUENTIAL: u16 = 2;
pub const DEFAULT_CLOCK_RATE: u32 = 8000;
pub const DEFAULT_MAX_RECV_PACKET_SIZE: usize = 65534;
pub const DEFAULT_MIN_CONTROL_FRAME_LEN: usize = 28;
pub const DEFAULT_MAX_QUEUED_PACKETS: usize = 4096;
pub const DEFAULT_PACKET_MAX_AGE_MS: u64 = 2000;
pub const DEFAULT_SOURCE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_GOODBYE_GRACE_MS: u64 = 2000;
pub const DEFAULT_CONFLICT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HOUSEKEEPING_INTERVAL_MS: u64 = 100;
pub const DEFAULT_DIRECTORY_CAPACITY: usize = 11;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("clock rate must be non-zero")]
    ZeroClockRate,
    #[error("max_dropout must be non-zero")]
    ZeroDropout,
    #[error("max_misorder {0} must be below 32768")]
    MisorderTooLarge(u16),
    #[error("min_control_frame_len {0} is below the 16-byte frame overhead")]
    ControlFrameTooSmall(usize),
    #[error("housekeeping interval must be non-zero")]
    ZeroHousekeepingInterval,
}

/// When the handshake engine is started without an explicit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoStartPolicy {
    Manual,
    OnControl,
    OnMedia,
    OnControlOrMedia,
}

impl AutoStartPolicy {
    pub fn on_control(self) -> bool {
        matches!(self, Self::OnControl | Self::OnControlOrMedia)
    }

    pub fn on_media(self) -> bool {
        matches!(self, Self::OnMedia | Self::OnControlOrMedia)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// In-order packets required before a new source is trusted.
    pub min_valid_sequence: u16,
    pub max_dropout: u16,
    pub max_misorder: u16,
    /// Packets continuing a jump before the source is re-baselined.
    pub min_sequential: u16,
    /// Media clock in Hz, for jitter.
    pub clock_rate: u32,
    pub max_recv_packet_size: usize,
    pub min_control_frame_len: usize,
    pub max_queued_packets: usize,
    pub packet_max_age_ms: u64,
    pub source_timeout_ms: u64,
    pub goodbye_grace_ms: u64,
    /// How long an address that collided with our SSRC stays suspect.
    pub conflict_timeout_ms: u64,
    pub housekeeping_interval_ms: u64,
    pub directory_capacity: usize,
    /// Our own SSRC, if we also send.
    pub local_ssrc: Option<u32>,
    pub handshake_enabled: bool,
    pub auto_start: AutoStartPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_valid_sequence: 0,
            max_dropout: DEFAULT_MAX_DROPOUT,
            max_misorder: DEFAULT_MAX_MISORDER,
            min_sequential: DEFAULT_MIN_SEQUENTIAL,
            clock_rate: DEFAULT_CLOCK_RATE,
            max_recv_packet_size: DEFAULT_MAX_RECV_PACKET_SIZE,
            min_control_frame_len: DEFAULT_MIN_CONTROL_FRAME_LEN,
            max_queued_packets: DEFAULT_MAX_QUEUED_PACKETS,
            packet_max_age_ms: DEFAULT_PACKET_MAX_AGE_MS,
            source_timeout_ms: DEFAULT_SOURCE_TIMEOUT_MS,
            goodbye_grace_ms: DEFAULT_GOODBYE_GRACE_MS,
            conflict_timeout_ms: DEFAULT_CONFLICT_TIMEOUT_MS,
            housekeeping_interval_ms: DEFAULT_HOUSEKEEPING_INTERVAL_MS,
            directory_capacity: DEFAULT_DIRECTORY_CAPACITY,
            local_ssrc: None,
            handshake_enabled: true,
            auto_start: AutoStartPolicy::OnControlOrMedia,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clock_rate == 0 {
            return Err(ConfigError::ZeroClockRate);
        }
        if self.max_dropout == 0 {
            return Err(ConfigError::ZeroDropout);
        }
        if self.max_misorder >= 32768 {
            return Err(ConfigError::MisorderTooLarge(self.max_misorder));
        }
        if self.min_control_frame_len < crate::control::MIN_CONTROL_FRAME_SIZE {
            return Err(ConfigError::ControlFrameTooSmall(self.min_control_frame_len));
        }
        if self.housekeeping_interval_ms == 0 {
            return Err(ConfigError::ZeroHousekeepingInterval);
        }
        Ok(())
    }

    pub fn packet_max_age(&self) -> Duration {
        Duration::from_millis(self.packet_max_age_ms)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn goodbye_grace(&self) -> Duration {
        Duration::from_millis(self.goodbye_grace_ms)
    }

    pub fn conflict_timeout(&self) -> Duration {
        Duration::from_millis(self.conflict_timeout_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }
}
