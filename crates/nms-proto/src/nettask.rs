//! # NetTask Wire Format
//!
//! Fixed 42-byte header followed by an opaque payload, big-endian throughout.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Version    |        Sequence Number        |A R U W F Type |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Window Size          |           Checksum            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Message ID           |   Identifier (32 bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Flag bits in the flags/type byte: 7 ACK, 6 RETRANSMISSION, 5 URGENT,
//! 4 WINDOW_PROBE, 3 MORE_FRAGMENTS; bits 2..0 carry the message type.
//!
//! If ACK is set the payload is empty and the sequence number names the
//! packet being acknowledged. The identifier is a zero-padded UTF-8 host
//! name. The checksum is the 16-bit one's-complement sum of the whole
//! packet with the checksum field zeroed.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtoError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Compiled NetTask protocol version.
pub const NET_TASK_VERSION: u8 = 1;

/// Largest datagram we build or accept; the usual Ethernet MTU.
pub const MTU: usize = 1500;

/// Identifier field width (zero-padded host name).
pub const IDENTIFIER_SIZE: usize = 32;

/// Fixed header size: 1 + 2 + 1 + 2 + 2 + 2 + 32.
pub const HEADER_SIZE: usize = 10 + IDENTIFIER_SIZE;

/// Largest payload a single fragment can carry.
pub const MAX_FRAGMENT_PAYLOAD: usize = MTU - HEADER_SIZE;

/// Byte offset of the checksum field within the header.
const CHECKSUM_OFFSET: usize = 6;

// ─── Message Type ────────────────────────────────────────────────────────────

/// The 3-bit message type. Values 5–7 are reserved and round-trip losslessly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    Undefined,
    FirstConnection,
    SendTasks,
    SendMetrics,
    Eoc,
    Reserved(u8),
}

impl MsgType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            0 => MsgType::Undefined,
            1 => MsgType::FirstConnection,
            2 => MsgType::SendTasks,
            3 => MsgType::SendMetrics,
            4 => MsgType::Eoc,
            b => MsgType::Reserved(b),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            MsgType::Undefined => 0,
            MsgType::FirstConnection => 1,
            MsgType::SendTasks => 2,
            MsgType::SendMetrics => 3,
            MsgType::Eoc => 4,
            MsgType::Reserved(b) => b & 0b111,
        }
    }
}

// ─── Flags ───────────────────────────────────────────────────────────────────

/// The five header flag bits, decoded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub ack: bool,
    pub retransmission: bool,
    pub urgent: bool,
    pub window_probe: bool,
    pub more_fragments: bool,
}

impl Flags {
    /// Flag set for an urgent data packet (bypasses flow control).
    pub fn urgent() -> Self {
        Flags {
            urgent: true,
            ..Flags::default()
        }
    }

    /// Pack the flags and a message type into the wire byte.
    pub fn to_bits(self, msg_type: MsgType) -> u8 {
        ((self.ack as u8) << 7)
            | ((self.retransmission as u8) << 6)
            | ((self.urgent as u8) << 5)
            | ((self.window_probe as u8) << 4)
            | ((self.more_fragments as u8) << 3)
            | msg_type.bits()
    }

    /// Split the wire byte into flags and message type.
    pub fn from_bits(bits: u8) -> (Self, MsgType) {
        let flags = Flags {
            ack: bits & 0x80 != 0,
            retransmission: bits & 0x40 != 0,
            urgent: bits & 0x20 != 0,
            window_probe: bits & 0x10 != 0,
            more_fragments: bits & 0x08 != 0,
        };
        (flags, MsgType::from_bits(bits))
    }
}

// ─── Checksum ────────────────────────────────────────────────────────────────

/// 16-bit one's-complement sum over the packet with the checksum field
/// treated as zero. An odd trailing byte is padded with zero; carries are
/// folded back into 16 bits.
pub fn checksum(packet: &[u8]) -> u16 {
    debug_assert!(packet.len() >= CHECKSUM_OFFSET + 2);
    let mut words = packet[..CHECKSUM_OFFSET]
        .iter()
        .chain(packet[CHECKSUM_OFFSET + 2..].iter());

    let mut sum: u32 = 0;
    while let Some(&hi) = words.next() {
        let lo = words.next().copied().unwrap_or(0);
        sum += u32::from(u16::from_be_bytes([hi, lo]));
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

// ─── Packet ──────────────────────────────────────────────────────────────────

/// A parsed NetTask packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub seq_number: u16,
    pub flags: Flags,
    pub msg_type: MsgType,
    pub window_size: u16,
    pub checksum: u16,
    /// Sequence number of the first fragment of the logical message.
    pub msg_id: u16,
    /// Peer host name, zero padding stripped.
    pub identifier: String,
    pub payload: Bytes,
}

impl Packet {
    /// Decode a datagram.
    ///
    /// Fails with [`ProtoError::InvalidHeader`] on a short buffer or an
    /// undecodable identifier and [`ProtoError::ChecksumMismatch`] when the
    /// recomputed checksum disagrees. A version byte that differs from
    /// [`NET_TASK_VERSION`] is *not* an error: the header format is assumed
    /// stable across minor versions, so the packet is returned and the
    /// caller decides whether to warn.
    pub fn parse(raw: &[u8]) -> Result<Packet, ProtoError> {
        if raw.len() < HEADER_SIZE {
            return Err(ProtoError::InvalidHeader);
        }

        let version = raw[0];
        let seq_number = u16::from_be_bytes([raw[1], raw[2]]);
        let (flags, msg_type) = Flags::from_bits(raw[3]);
        let window_size = u16::from_be_bytes([raw[4], raw[5]]);
        let header_checksum = u16::from_be_bytes([raw[6], raw[7]]);
        let msg_id = u16::from_be_bytes([raw[8], raw[9]]);

        let computed = checksum(raw);
        if computed != header_checksum {
            return Err(ProtoError::ChecksumMismatch {
                computed,
                found: header_checksum,
            });
        }

        let ident_raw = &raw[10..HEADER_SIZE];
        let ident_end = ident_raw
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |p| p + 1);
        let identifier = std::str::from_utf8(&ident_raw[..ident_end])
            .map_err(|_| ProtoError::InvalidHeader)?
            .to_owned();

        Ok(Packet {
            version,
            seq_number,
            flags,
            msg_type,
            window_size,
            checksum: header_checksum,
            msg_id,
            identifier,
            payload: Bytes::copy_from_slice(&raw[HEADER_SIZE..]),
        })
    }

    /// Whether the version byte matches the compiled protocol version.
    pub fn version_ok(&self) -> bool {
        self.version == NET_TASK_VERSION
    }

    /// Build the ACK for this packet: ACK set, RETRANSMISSION cleared,
    /// URGENT preserved, WINDOW_PROBE and MORE_FRAGMENTS cleared, same
    /// message type, empty payload. Both `seq_number` and `msg_id` carry
    /// the sequence being acknowledged.
    pub fn build_ack(&self, identifier: &str, window_size: u16) -> Bytes {
        let flags = Flags {
            ack: true,
            urgent: self.flags.urgent,
            ..Flags::default()
        };
        encode_one(
            self.seq_number,
            flags,
            self.msg_type,
            window_size,
            self.seq_number,
            identifier,
            &[],
        )
    }
}

// ─── Build ───────────────────────────────────────────────────────────────────

/// Number of fragments a payload of the given length splits into. An
/// empty payload still occupies one packet.
pub fn fragment_count(payload_len: usize) -> usize {
    if payload_len == 0 {
        1
    } else {
        payload_len.div_ceil(MAX_FRAGMENT_PAYLOAD)
    }
}

/// Build the wire packets for one logical message.
///
/// Payloads that fit in `MTU - HEADER_SIZE` produce a single packet with
/// `msg_id == seq_number` and MORE_FRAGMENTS clear. Longer payloads are
/// split in order; fragment `i` takes sequence `seq_number + i`, every
/// fragment carries `msg_id == seq_number`, and MORE_FRAGMENTS is set on
/// all but the last. Returns the advanced sequence counter so callers can
/// commit it atomically.
pub fn build_packets(
    payload: &[u8],
    seq_number: u16,
    mut flags: Flags,
    msg_type: MsgType,
    identifier: &str,
    window_size: u16,
) -> (u16, Vec<Bytes>) {
    let msg_id = seq_number;
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[][..]]
    } else {
        payload.chunks(MAX_FRAGMENT_PAYLOAD).collect()
    };

    let mut packets = Vec::with_capacity(chunks.len());
    let mut seq = seq_number;
    for (i, chunk) in chunks.iter().enumerate() {
        flags.more_fragments = i + 1 < chunks.len();
        packets.push(encode_one(
            seq,
            flags,
            msg_type,
            window_size,
            msg_id,
            identifier,
            chunk,
        ));
        seq = seq.wrapping_add(1);
    }

    (seq, packets)
}

/// Encode a single packet and write the checksum back in place.
fn encode_one(
    seq_number: u16,
    flags: Flags,
    msg_type: MsgType,
    window_size: u16,
    msg_id: u16,
    identifier: &str,
    payload: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(NET_TASK_VERSION);
    buf.put_u16(seq_number);
    buf.put_u8(flags.to_bits(msg_type));
    buf.put_u16(window_size);
    buf.put_u16(0); // checksum placeholder
    buf.put_u16(msg_id);

    let ident = identifier.as_bytes();
    let ident_len = ident.len().min(IDENTIFIER_SIZE);
    buf.put_slice(&ident[..ident_len]);
    buf.put_bytes(0, IDENTIFIER_SIZE - ident_len);

    buf.put_slice(payload);

    let ck = checksum(&buf);
    buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&ck.to_be_bytes());
    buf.freeze()
}
