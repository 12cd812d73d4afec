//! Datagram header encoding and decoding.
//!
//! Every PULSEWIRE datagram starts with a fixed 16-byte header. All
//! multi-byte fields are big-endian (network byte order).
//!
//! ```text
//!  0       2       3       4               8              12      14      16
//! +-------+-------+-------+---------------+---------------+-------+-------+
//! | magic |  ver  | type  |   sequence    |   timestamp   |  len  | flags |
//! +-------+-------+-------+---------------+---------------+-------+-------+
//! ```
//!
//! Parsing never panics: datagram transports deliver attacker-controlled
//! bytes and foreign traffic may share the socket.

use crate::error::FrameError;
use crate::{HEADER_SIZE, MAGIC, PROTOCOL_VERSION};

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Application data or envelope
    Data = 0x01,
    /// Acknowledgment with timestamp echo
    Ack = 0x02,
    /// Retransmission request for missing sequences
    Nack = 0x03,
    /// Keep-alive
    Pulse = 0x04,
    /// Receive-window advertisement
    Flow = 0x05,
    /// Session termination
    Close = 0x06,
}

impl TryFrom<u8> for PacketType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Data),
            0x02 => Ok(Self::Ack),
            0x03 => Ok(Self::Nack),
            0x04 => Ok(Self::Pulse),
            0x05 => Ok(Self::Flow),
            0x06 => Ok(Self::Close),
            _ => Err(FrameError::InvalidPacketType(value)),
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Pulse => "PULSE",
            Self::Flow => "FLOW",
            Self::Close => "CLOSE",
        };
        f.write_str(name)
    }
}

/// Packet flags bitmap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PacketFlags(u16);

impl PacketFlags {
    /// Payload carries a sealed envelope
    pub const ENVELOPE: u16 = 0b0000_0000_0000_0001;
    /// Packet is a retransmission
    pub const RETRANSMIT: u16 = 0b0000_0000_0000_0010;

    /// Create empty flags
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Flags from the raw wire value (unknown bits preserved)
    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Add ENVELOPE flag
    #[must_use]
    pub fn with_envelope(mut self) -> Self {
        self.0 |= Self::ENVELOPE;
        self
    }

    /// Add RETRANSMIT flag
    #[must_use]
    pub fn with_retransmit(mut self) -> Self {
        self.0 |= Self::RETRANSMIT;
        self
    }

    /// Check if ENVELOPE is set
    #[must_use]
    pub fn is_envelope(&self) -> bool {
        self.0 & Self::ENVELOPE != 0
    }

    /// Check if RETRANSMIT is set
    #[must_use]
    pub fn is_retransmit(&self) -> bool {
        self.0 & Self::RETRANSMIT != 0
    }

    /// Raw value
    #[must_use]
    pub fn bits(&self) -> u16 {
        self.0
    }
}

/// Parsed datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    /// Protocol version
    pub version: u8,
    /// Packet type
    pub packet_type: PacketType,
    /// Sender-assigned sequence number
    pub sequence: u32,
    /// Send time, unix milliseconds mod 2^32
    pub timestamp: u32,
    /// Payload length in bytes
    pub payload_len: u16,
    /// Flags
    pub flags: PacketFlags,
}

impl DatagramHeader {
    /// Header for the current protocol version. `payload_len` is filled in by
    /// [`encode`].
    #[must_use]
    pub fn new(packet_type: PacketType, sequence: u32, timestamp: u32, flags: PacketFlags) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            sequence,
            timestamp,
            payload_len: 0,
            flags,
        }
    }

    /// Write the 16 header bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&MAGIC);
        out[2] = self.version;
        out[3] = self.packet_type as u8;
        out[4..8].copy_from_slice(&self.sequence.to_be_bytes());
        out[8..12].copy_from_slice(&self.timestamp.to_be_bytes());
        out[12..14].copy_from_slice(&self.payload_len.to_be_bytes());
        out[14..16].copy_from_slice(&self.flags.bits().to_be_bytes());
        out
    }
}

/// Serialize `header` followed by `payload`.
///
/// The payload length field is taken from `payload`, not from `header`.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if the payload does not fit the
/// 16-bit length field.
pub fn encode(header: &DatagramHeader, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let payload_len =
        u16::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;

    let header = DatagramHeader {
        payload_len,
        ..*header
    };

    let mut datagram = Vec::with_capacity(HEADER_SIZE + payload.len());
    datagram.extend_from_slice(&header.to_bytes());
    datagram.extend_from_slice(payload);
    Ok(datagram)
}

/// Parse a datagram into its header and payload slice.
///
/// Trailing bytes beyond the declared payload length are ignored.
///
/// # Errors
///
/// Returns a [`FrameError`] describing why the bytes are not a valid datagram.
pub fn parse(data: &[u8]) -> Result<(DatagramHeader, &[u8]), FrameError> {
    if data.len() < HEADER_SIZE {
        return Err(FrameError::TooShort {
            expected: HEADER_SIZE,
            actual: data.len(),
        });
    }

    if data[0..2] != MAGIC {
        return Err(FrameError::BadMagic(u16::from_be_bytes([data[0], data[1]])));
    }

    let version = data[2];
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }

    let packet_type = PacketType::try_from(data[3])?;
    let sequence = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let timestamp = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let payload_len = u16::from_be_bytes([data[12], data[13]]);
    let flags = PacketFlags::from_bits(u16::from_be_bytes([data[14], data[15]]));

    let end = HEADER_SIZE + payload_len as usize;
    if end > data.len() {
        return Err(FrameError::PayloadOverflow);
    }

    let header = DatagramHeader {
        version,
        packet_type,
        sequence,
        timestamp,
        payload_len,
        flags,
    };
    Ok((header, &data[HEADER_SIZE..end]))
}

/// Parse just the header, discarding the reason for any failure.
#[must_use]
pub fn decode(data: &[u8]) -> Option<DatagramHeader> {
    parse(data).ok().map(|(header, _)| header)
}
