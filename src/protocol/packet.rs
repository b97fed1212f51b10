// (c) 2025 Ross Younger

//! Packet header wire format.
//!
//! Every packet on the link starts with a fixed 6-byte header:
//!
//! ```text
//! offset 0 : 0x07 (intro byte)
//! offset 1 : (local seq << 3)  | local channel     5+3 bits
//! offset 2 : (remote seq << 3) | remote channel    5+3 bits
//! offset 3 : (type << 5) | (caller ? 0x10 : 0) | ((length >> 8) & 0x0F)
//! offset 4 : length & 0xFF
//! offset 5 : XOR of bytes 1..=4
//! ```
//!
//! A non-empty payload (up to 4095 bytes) follows, trailed by a 4-byte
//! big-endian CRC-32 (see [`crate::protocol::crc`]). All multi-byte fields
//! are big-endian.
//!
//! The remote field of every outgoing packet doubles as a piggybacked
//! acknowledgement of the highest contiguously received sequence, so the
//! header of a buffered packet must be re-stamped before retransmission;
//! [`refresh_ack`] does that in place.

use std::fmt::Display;

/// The byte that introduces every packet header.
pub const INTRO: u8 = 0x07;

/// Length of the fixed packet header.
pub const HEADER_LEN: usize = 6;

/// Length of the CRC trailer following a non-empty payload.
pub const TRAILER_LEN: usize = 4;

/// Largest payload a single packet can carry (12-bit length field).
pub const MAX_PAYLOAD: usize = (1 << 12) - 1;

/// Size of the sequence number space. Sequence 0 is reserved for packets
/// that carry no flow-controlled payload (SYNC/ACK/NAK).
pub const MAX_SEQ: u8 = 32;

/// Size of the channel number space (3-bit field).
pub const MAX_CHANNEL: u8 = 8;

/// The sequence number following `seq`, modulo [`MAX_SEQ`].
#[must_use]
pub fn next_seq(seq: u8) -> u8 {
    (seq + 1) & (MAX_SEQ - 1)
}

/// `a - b` in sequence space: the number of packets from `b` up to `a`.
///
/// Sequence numbers must never be compared directly; all window arithmetic
/// goes through this.
#[must_use]
pub fn seq_diff(a: u8, b: u8) -> u8 {
    a.wrapping_add(MAX_SEQ).wrapping_sub(b) & (MAX_SEQ - 1)
}

/// Packet type, carried in the top 3 bits of header byte 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum PacketKind {
    /// Flow-controlled payload for the session layer.
    Data,
    /// Connection setup: announces packet size and window.
    Sync,
    /// Standalone acknowledgement (the ack value rides in the remote field).
    Ack,
    /// Negative acknowledgement; requests resend of the sequence in the
    /// local field.
    Nak,
    /// Sets the receiver's file position (4-byte big-endian payload).
    Spos,
    /// Closes the connection.
    Close,
    /// Unrecognized type, accepted and ignored so the type space can grow.
    Reserved(u8),
}

impl PacketKind {
    /// Decodes the 3-bit type field.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => PacketKind::Data,
            1 => PacketKind::Sync,
            2 => PacketKind::Ack,
            3 => PacketKind::Nak,
            4 => PacketKind::Spos,
            5 => PacketKind::Close,
            other => PacketKind::Reserved(other),
        }
    }

    /// The 3-bit wire encoding of this type.
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            PacketKind::Data => 0,
            PacketKind::Sync => 1,
            PacketKind::Ack => 2,
            PacketKind::Nak => 3,
            PacketKind::Spos => 4,
            PacketKind::Close => 5,
            PacketKind::Reserved(other) => other & 0x07,
        }
    }

    /// Whether this type occupies a slot in the sequence space.
    ///
    /// Only sequenced packets participate in windowing, ordering and
    /// retransmission; the rest are fire-and-forget.
    #[must_use]
    pub fn carries_seq(self) -> bool {
        matches!(
            self,
            PacketKind::Data | PacketKind::Spos | PacketKind::Close
        )
    }
}

/// A decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet type.
    pub kind: PacketKind,
    /// Set on every packet sent by the peer that initiated the connection.
    /// A receiver rejects packets whose flag matches its own role; they can
    /// only be reflections of its own traffic.
    pub caller: bool,
    /// Sequence number of this packet (meaningful when
    /// [`PacketKind::carries_seq`], and the requested sequence for a NAK).
    pub local_seq: u8,
    /// Sub-stream this packet belongs to.
    pub local_chan: u8,
    /// Piggybacked acknowledgement: the highest sequence the sender had
    /// contiguously received when this header was stamped.
    pub remote_seq: u8,
    /// Sub-stream being acknowledged.
    pub remote_chan: u8,
    /// Payload length in bytes, 0..=4095.
    pub len: u16,
}

/// Why a 6-byte candidate header was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// First byte was not [`INTRO`].
    #[error("missing intro byte")]
    NoIntro,
    /// The XOR check byte did not match bytes 1..=4.
    #[error("header check mismatch")]
    BadCheck,
}

impl PacketHeader {
    /// Encodes this header into its 6-byte wire form, check byte included.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // len is 12 bits by contract
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        debug_assert!(self.local_seq < MAX_SEQ && self.remote_seq < MAX_SEQ);
        debug_assert!(self.local_chan < MAX_CHANNEL && self.remote_chan < MAX_CHANNEL);
        debug_assert!(self.len as usize <= MAX_PAYLOAD);
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = INTRO;
        bytes[1] = (self.local_seq << 3) | self.local_chan;
        bytes[2] = (self.remote_seq << 3) | self.remote_chan;
        bytes[3] = (self.kind.bits() << 5)
            | if self.caller { 0x10 } else { 0 }
            | ((self.len >> 8) as u8 & 0x0F);
        bytes[4] = (self.len & 0xFF) as u8;
        bytes[5] = check_value(&bytes);
        bytes
    }

    /// Decodes and validates a 6-byte candidate header.
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self, HeaderError> {
        if bytes[0] != INTRO {
            return Err(HeaderError::NoIntro);
        }
        if bytes[5] != check_value(bytes) {
            return Err(HeaderError::BadCheck);
        }
        Ok(Self {
            kind: PacketKind::from_bits(bytes[3] >> 5),
            caller: bytes[3] & 0x10 != 0,
            local_seq: bytes[1] >> 3,
            local_chan: bytes[1] & 0x07,
            remote_seq: bytes[2] >> 3,
            remote_chan: bytes[2] & 0x07,
            len: (u16::from(bytes[3] & 0x0F) << 8) | u16::from(bytes[4]),
        })
    }
}

impl Display for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} seq {} ack {} len {}",
            self.kind, self.local_seq, self.remote_seq, self.len
        )
    }
}

/// The XOR check over header bytes 1..=4.
#[must_use]
pub fn check_value(header: &[u8]) -> u8 {
    header[1] ^ header[2] ^ header[3] ^ header[4]
}

/// Re-stamps the piggybacked acknowledgement of an already-encoded header
/// (preserving the remote channel) and fixes up the check byte.
///
/// This runs on buffered packets just before retransmission, so the resend
/// still acks whatever we have received since it was first built.
pub fn refresh_ack(header: &mut [u8], ack_seq: u8) {
    debug_assert!(header.len() >= HEADER_LEN && ack_seq < MAX_SEQ);
    header[2] = (ack_seq << 3) | (header[2] & 0x07);
    header[5] = check_value(header);
}

/// The payload length recorded in an already-encoded header.
#[must_use]
pub fn payload_len(header: &[u8]) -> usize {
    (usize::from(header[3] & 0x0F) << 8) | usize::from(header[4])
}
