//! Queue callbacks that report engine events through tracing.

use sluice_core::{CryptoError, QueueHooks, RtpPacket, SourceSnapshot};
use tracing::{info, warn};

pub struct LoggingHooks {
    /// Accept packets that failed authentication instead of dropping them.
    admit_on_error: bool,
}

impl LoggingHooks {
    pub fn new(admit_on_error: bool) -> Self {
        Self { admit_on_error }
    }
}

impl QueueHooks for LoggingHooks {
    fn on_new_source(&self, source: &SourceSnapshot) {
        info!(
            "source {:#010x} joined from {}",
            source.ssrc,
            source
                .address
                .map_or_else(|| "?".to_string(), |a| a.to_string())
        );
    }

    fn on_packet_error(&self, packet: &RtpPacket, error: &CryptoError) -> bool {
        if self.admit_on_error {
            warn!(
                "admitting {:#010x} seq {} despite {}",
                packet.ssrc(),
                packet.sequence(),
                error
            );
        }
        self.admit_on_error
    }

    fn on_secure_on(&self, cipher: &str, sas: Option<&str>, verified: bool) {
        info!(
            "secure with {}; compare SAS {} with the peer{}",
            cipher,
            sas.unwrap_or("-"),
            if verified { " (verified)" } else { "" }
        );
    }

    fn on_secure_off(&self) {
        info!("media no longer protected");
    }

    fn on_negotiation_failed(&self, reason: &str) {
        warn!("key agreement failed: {}", reason);
    }

    fn on_local_ssrc_changed(&self, old: Option<u32>, new: u32) {
        warn!("SSRC collision, local SSRC {:?} -> {:#010x}", old, new);
    }

    fn on_source_removed(&self, ssrc: u32) {
        info!("source {:#010x} left", ssrc);
    }
}
