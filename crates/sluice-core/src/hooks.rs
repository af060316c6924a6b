use crate::crypto::CryptoError;
use crate::queue::QueuedPacket;
use crate::rtp::RtpPacket;
use crate::source::SourceSnapshot;

/// Application callbacks.
///
/// `on_expired_packet` and `on_source_removed` run after the queue lock is
/// released and may call back into the queue. The others run on the ingest
/// path with the lock held; calling the same queue from them deadlocks.
pub trait QueueHooks: Send + Sync {
    /// First data packet from a new source.
    fn on_new_source(&self, _source: &SourceSnapshot) {}

    /// Decrypt or verify failed. Return true to queue the packet anyway.
    fn on_packet_error(&self, _packet: &RtpPacket, _error: &CryptoError) -> bool {
        false
    }

    fn on_expired_packet(&self, _packet: &QueuedPacket) {}

    /// Profile-specific validation of a plaintext packet. Return false to
    /// drop it.
    fn on_media_packet(&self, _packet: &RtpPacket) -> bool {
        true
    }

    fn on_control_warning(&self, _message: &str) {}

    fn on_secure_on(&self, _cipher: &str, _sas: Option<&str>, _verified: bool) {}

    fn on_secure_off(&self) {}

    fn on_negotiation_failed(&self, _reason: &str) {}

    fn on_local_ssrc_changed(&self, _old: Option<u32>, _new: u32) {}

    fn on_source_removed(&self, _ssrc: u32) {}
}

/// Hooks that accept every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl QueueHooks for NoopHooks {}
