//! Key-agreement control frames multiplexed on the media socket.
//!
//! Control frames start with `0x10`, whose top two bits can never equal the
//! RTP version, so one byte is enough to tell the two apart.
//!
//! ```text
//! [0x10][0x00][seq u16][magic u32][ssrc u32][message ...][crc32c u32]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::rtp::RTP_VERSION;

pub const CONTROL_MARKER: u8 = 0x10;
pub const CONTROL_MAGIC: u32 = 0x534c_4b41; // 'SLKA'
pub const CONTROL_HEADER_SIZE: usize = 12;
pub const CONTROL_CHECKSUM_SIZE: usize = 4;

/// Smallest frame that can be structurally valid: header plus checksum.
pub const MIN_CONTROL_FRAME_SIZE: usize = CONTROL_HEADER_SIZE + CONTROL_CHECKSUM_SIZE;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlFrameError {
    #[error("control frame too short: {len} < {min}")]
    TooShort { len: usize, min: usize },
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("bad magic: {0:#010x}")]
    BadMagic(u32),
}

/// True when the first octet carries the RTP version bits.
pub fn is_media(first_byte: u8) -> bool {
    first_byte >> 6 == RTP_VERSION
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub sequence: u16,
    /// SSRC announced by the sender of the frame.
    pub ssrc: u32,
    pub message: Bytes,
}

impl ControlFrame {
    pub fn new(sequence: u16, ssrc: u32, message: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            ssrc,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            CONTROL_HEADER_SIZE + self.message.len() + CONTROL_CHECKSUM_SIZE,
        );
        buf.put_u8(CONTROL_MARKER);
        buf.put_u8(0);
        buf.put_u16(self.sequence);
        buf.put_u32(CONTROL_MAGIC);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.message);

        let crc = crc32c::crc32c(&buf);
        buf.put_u32(crc);
        buf.freeze()
    }

    /// Length is checked first, then the trailing checksum, then the magic.
    pub fn decode(bytes: Bytes, min_len: usize) -> Result<Self, ControlFrameError> {
        let min = min_len.max(MIN_CONTROL_FRAME_SIZE);
        if bytes.len() < min {
            return Err(ControlFrameError::TooShort {
                len: bytes.len(),
                min,
            });
        }

        let body_len = bytes.len() - CONTROL_CHECKSUM_SIZE;
        let expected = u32::from_be_bytes([
            bytes[body_len],
            bytes[body_len + 1],
            bytes[body_len + 2],
            bytes[body_len + 3],
        ]);
        let actual = crc32c::crc32c(&bytes[..body_len]);
        if expected != actual {
            return Err(ControlFrameError::ChecksumMismatch { expected, actual });
        }

        let mut header = &bytes[..CONTROL_HEADER_SIZE];
        header.advance(2);
        let sequence = header.get_u16();
        let magic = header.get_u32();
        if magic != CONTROL_MAGIC {
            return Err(ControlFrameError::BadMagic(magic));
        }
        let ssrc = header.get_u32();

        Ok(Self {
            sequence,
            ssrc,
            message: bytes.slice(CONTROL_HEADER_SIZE..body_len),
        })
    }
}
