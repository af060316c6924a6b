//! RTP data packet codec (RFC 3550 §5.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |            contributing source (CSRC) identifiers             |
//! |                             ....                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The packet owns its buffer. The security gate decrypts the body in
//! place and swaps it with [`RtpPacket::replace_body`].

use bytes::Bytes;
use thiserror::Error;

pub const RTP_VERSION: u8 = 2;

/// Fixed header size without CSRCs or extension.
pub const RTP_HEADER_SIZE: usize = 12;

const PADDING_BIT: u8 = 0x20;
const EXTENSION_BIT: u8 = 0x10;
const MARKER_BIT: u8 = 0x80;

/// PT 72 and 73 are indistinguishable from RTCP SR/RR.
const INVALID_PT_MASK: u8 = 0x7e;
const INVALID_PT_VALUE: u8 = 0x48;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RtpError {
    #[error("packet too short: {0}")]
    TooShort(usize),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),
    #[error("payload type {0} collides with RTCP")]
    RtcpPayloadType(u8),
    #[error("header length {header} exceeds packet length {len}")]
    TruncatedHeader { header: usize, len: usize },
    #[error("invalid padding length: {0}")]
    InvalidPadding(usize),
}

/// A received RTP data packet with its header already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    data: Vec<u8>,
    header_len: usize,
    padding_len: usize,
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
}

impl RtpPacket {
    /// Run the generic header checks and take ownership of the buffer.
    ///
    /// Checks the protocol version, rejects payload types that collide with
    /// RTCP, and verifies that the CSRC list, header extension and padding
    /// all fit inside the datagram.
    pub fn parse(data: Vec<u8>) -> Result<Self, RtpError> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(RtpError::TooShort(data.len()));
        }

        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::UnsupportedVersion(version));
        }

        let payload_type = data[1] & 0x7f;
        if payload_type & INVALID_PT_MASK == INVALID_PT_VALUE {
            return Err(RtpError::RtcpPayloadType(payload_type));
        }

        let len = data.len();
        let csrc_count = (data[0] & 0x0f) as usize;
        let mut header_len = RTP_HEADER_SIZE + 4 * csrc_count;
        if header_len > len {
            return Err(RtpError::TruncatedHeader {
                header: header_len,
                len,
            });
        }

        if data[0] & EXTENSION_BIT != 0 {
            if header_len + 4 > len {
                return Err(RtpError::TruncatedHeader {
                    header: header_len + 4,
                    len,
                });
            }
            let words = u16::from_be_bytes([data[header_len + 2], data[header_len + 3]]) as usize;
            header_len += 4 + 4 * words;
            if header_len > len {
                return Err(RtpError::TruncatedHeader {
                    header: header_len,
                    len,
                });
            }
        }

        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut packet = Self {
            data,
            header_len,
            padding_len: 0,
            sequence,
            timestamp,
            ssrc,
        };
        if packet.has_padding() {
            packet.padding_len = packet.read_padding_len()?;
        }
        Ok(packet)
    }

    /// Clear the padding bit of a raw datagram, returning whether it was set.
    ///
    /// Before decryption the padding count sits inside the ciphertext, so
    /// the header must be validated without it.
    pub fn strip_padding_flag(datagram: &mut [u8]) -> bool {
        match datagram.first_mut() {
            Some(first) if *first & PADDING_BIT != 0 => {
                *first &= !PADDING_BIT;
                true
            }
            _ => false,
        }
    }

    /// Set the padding bit again and recompute the padding length from the
    /// (now plaintext) last octet.
    pub fn restore_padding(&mut self) -> Result<(), RtpError> {
        self.data[0] |= PADDING_BIT;
        self.padding_len = self.read_padding_len()?;
        Ok(())
    }

    fn read_padding_len(&self) -> Result<usize, RtpError> {
        let body = self.data.len() - self.header_len;
        let count = match self.data.last() {
            Some(&count) if body > 0 => count as usize,
            _ => return Err(RtpError::InvalidPadding(0)),
        };
        if count == 0 || count > body {
            return Err(RtpError::InvalidPadding(count));
        }
        Ok(count)
    }

    /// Swap the protected body (ciphertext, tag, encrypted padding) for
    /// its plaintext.
    pub fn replace_body(&mut self, plaintext: Vec<u8>) {
        self.data.truncate(self.header_len);
        self.data.extend_from_slice(&plaintext);
        self.padding_len = 0;
    }

    pub fn version(&self) -> u8 {
        self.data[0] >> 6
    }

    pub fn has_padding(&self) -> bool {
        self.data[0] & PADDING_BIT != 0
    }

    pub fn has_extension(&self) -> bool {
        self.data[0] & EXTENSION_BIT != 0
    }

    pub fn marker(&self) -> bool {
        self.data[1] & MARKER_BIT != 0
    }

    pub fn payload_type(&self) -> u8 {
        self.data[1] & 0x7f
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn csrcs(&self) -> impl Iterator<Item = u32> + '_ {
        let count = (self.data[0] & 0x0f) as usize;
        self.data[RTP_HEADER_SIZE..RTP_HEADER_SIZE + 4 * count]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
    }

    /// Header extension as `(profile, content)`.
    pub fn extension(&self) -> Option<(u16, &[u8])> {
        if !self.has_extension() {
            return None;
        }
        let start = RTP_HEADER_SIZE + 4 * (self.data[0] & 0x0f) as usize;
        let profile = u16::from_be_bytes([self.data[start], self.data[start + 1]]);
        Some((profile, &self.data[start + 4..self.header_len]))
    }

    /// Fixed header, CSRCs and extension: the authenticated-only region.
    pub fn header(&self) -> &[u8] {
        &self.data[..self.header_len]
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Everything after the header, including padding and any auth tag.
    pub fn body(&self) -> &[u8] {
        &self.data[self.header_len..]
    }

    /// Media payload without padding.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.header_len..self.data.len() - self.padding_len]
    }

    pub fn padding_len(&self) -> usize {
        self.padding_len
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Payload only, as a shareable buffer.
    pub fn into_payload(self) -> Bytes {
        let end = self.data.len() - self.padding_len;
        Bytes::from(self.data).slice(self.header_len..end)
    }
}

/// Assembles outgoing RTP packets. Used on the send path and in tests.
#[derive(Debug, Clone, Default)]
pub struct RtpPacketBuilder {
    marker: bool,
    payload_type: u8,
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    csrcs: Vec<u32>,
    padding: u8,
}

impl RtpPacketBuilder {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            ..Default::default()
        }
    }

    pub fn payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = payload_type & 0x7f;
        self
    }

    pub fn sequence(mut self, sequence: u16) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    pub fn csrc(mut self, csrc: u32) -> Self {
        if self.csrcs.len() < 15 {
            self.csrcs.push(csrc);
        }
        self
    }

    /// Pad the payload with `count` octets (0 disables padding).
    pub fn padding(mut self, count: u8) -> Self {
        self.padding = count;
        self
    }

    pub fn build(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            RTP_HEADER_SIZE + 4 * self.csrcs.len() + payload.len() + self.padding as usize,
        );
        let mut first = RTP_VERSION << 6 | self.csrcs.len() as u8;
        if self.padding > 0 {
            first |= PADDING_BIT;
        }
        buf.push(first);
        buf.push(if self.marker { MARKER_BIT } else { 0 } | self.payload_type);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        for csrc in &self.csrcs {
            buf.extend_from_slice(&csrc.to_be_bytes());
        }
        buf.extend_from_slice(payload);
        if self.padding > 0 {
            buf.resize(buf.len() + self.padding as usize - 1, 0);
            buf.push(self.padding);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_header() {
        let raw = RtpPacketBuilder::new(0xdead_beef)
            .payload_type(96)
            .sequence(4242)
            .timestamp(160_000)
            .marker(true)
            .build(&[1, 2, 3]);
        let packet = RtpPacket::parse(raw).unwrap();
        assert_eq!(packet.version(), 2);
        assert_eq!(packet.ssrc(), 0xdead_beef);
        assert_eq!(packet.sequence(), 4242);
        assert_eq!(packet.timestamp(), 160_000);
        assert_eq!(packet.payload_type(), 96);
        assert!(packet.marker());
        assert_eq!(packet.payload(), &[1, 2, 3]);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut raw = RtpPacketBuilder::new(1).build(&[0; 4]);
        raw[0] = (raw[0] & 0x3f) | (1 << 6);
        assert_eq!(
            RtpPacket::parse(raw),
            Err(RtpError::UnsupportedVersion(1))
        );
    }

    #[test]
    fn rejects_rtcp_payload_types() {
        for pt in [72u8, 73] {
            let raw = RtpPacketBuilder::new(1).payload_type(pt).build(&[0; 4]);
            assert_eq!(RtpPacket::parse(raw), Err(RtpError::RtcpPayloadType(pt)));
        }
    }

    #[test]
    fn rejects_truncated_csrc_list() {
        let mut raw = RtpPacketBuilder::new(1).build(&[]);
        raw[0] |= 0x03;
        assert!(matches!(
            RtpPacket::parse(raw),
            Err(RtpError::TruncatedHeader { .. })
        ));
    }

    #[test]
    fn parses_extension_and_csrcs() {
        let mut raw = RtpPacketBuilder::new(7).csrc(11).csrc(12).build(&[]);
        raw[0] |= EXTENSION_BIT;
        raw.extend_from_slice(&[0xbe, 0xde, 0x00, 0x01]);
        raw.extend_from_slice(&[9, 9, 9, 9]);
        raw.extend_from_slice(b"payload");
        let packet = RtpPacket::parse(raw).unwrap();
        assert_eq!(packet.csrcs().collect::<Vec<_>>(), vec![11, 12]);
        let (profile, content) = packet.extension().unwrap();
        assert_eq!(profile, 0xbede);
        assert_eq!(content, &[9, 9, 9, 9]);
        assert_eq!(packet.payload(), b"payload");
        assert_eq!(packet.header_len(), 12 + 8 + 8);
    }

    #[test]
    fn padding_is_excluded_from_payload() {
        let raw = RtpPacketBuilder::new(1).padding(4).build(b"abc");
        let packet = RtpPacket::parse(raw).unwrap();
        assert_eq!(packet.padding_len(), 4);
        assert_eq!(packet.payload(), b"abc");
    }

    #[test]
    fn bogus_padding_count_is_rejected() {
        let mut raw = RtpPacketBuilder::new(1).build(b"abc");
        raw[0] |= PADDING_BIT;
        *raw.last_mut().unwrap() = 200;
        assert_eq!(RtpPacket::parse(raw), Err(RtpError::InvalidPadding(200)));
    }

    #[test]
    fn padding_recomputed_after_body_swap() {
        let mut raw = RtpPacketBuilder::new(1).build(&[0xff; 8]);
        raw[0] |= PADDING_BIT;
        assert!(RtpPacket::strip_padding_flag(&mut raw));
        let mut packet = RtpPacket::parse(raw).unwrap();
        assert!(!packet.has_padding());

        packet.replace_body(vec![b'x', b'y', 0, 2]);
        packet.restore_padding().unwrap();
        assert!(packet.has_padding());
        assert_eq!(packet.payload(), b"xy");
    }

    #[test]
    fn into_payload_shares_buffer() {
        let raw = RtpPacketBuilder::new(3).padding(2).build(b"media");
        let packet = RtpPacket::parse(raw).unwrap();
        assert_eq!(&packet.into_payload()[..], b"media");
    }
}
