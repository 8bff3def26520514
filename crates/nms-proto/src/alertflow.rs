//! # AlertFlow Stream Framing
//!
//! The alert side-channel. One TCP connection carries exactly one record:
//! `version(1) || identifier(32, zero-padded) || JSON payload`, delimited by
//! connection close. The JSON payload is an object keyed by alert-type code.
//!
//! There is no length prefix and no retry — alerts are best-effort beside
//! the reliable NetTask channel.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::ProtoError;

/// Compiled AlertFlow protocol version.
pub const ALERT_FLOW_VERSION: u8 = 1;

/// Identifier field width, shared with NetTask.
pub const IDENTIFIER_SIZE: usize = 32;

/// Record header size: version byte + identifier.
pub const HEADER_SIZE: usize = 1 + IDENTIFIER_SIZE;

// ─── Alert Kind ──────────────────────────────────────────────────────────────

/// Alert-type codes carried as keys of the JSON payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    CpuUsage,
    RamUsage,
    InterfaceStats,
    PacketLoss,
    Jitter,
    Unknown(u8),
}

impl AlertKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => AlertKind::CpuUsage,
            1 => AlertKind::RamUsage,
            2 => AlertKind::InterfaceStats,
            3 => AlertKind::PacketLoss,
            4 => AlertKind::Jitter,
            c => AlertKind::Unknown(c),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            AlertKind::CpuUsage => 0,
            AlertKind::RamUsage => 1,
            AlertKind::InterfaceStats => 2,
            AlertKind::PacketLoss => 3,
            AlertKind::Jitter => 4,
            AlertKind::Unknown(c) => c,
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::CpuUsage => write!(f, "CPU usage"),
            AlertKind::RamUsage => write!(f, "RAM usage"),
            AlertKind::InterfaceStats => write!(f, "Interface stats"),
            AlertKind::PacketLoss => write!(f, "Packet loss"),
            AlertKind::Jitter => write!(f, "Jitter"),
            AlertKind::Unknown(c) => write!(f, "Unknown alert type {c}"),
        }
    }
}

// ─── Record ──────────────────────────────────────────────────────────────────

/// A decoded AlertFlow record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertRecord {
    pub version: u8,
    pub identifier: String,
    /// Raw JSON bytes; the host decodes the alert-type-tagged object.
    pub payload: Bytes,
}

impl AlertRecord {
    /// Encode one record for transmission.
    pub fn encode(identifier: &str, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u8(ALERT_FLOW_VERSION);

        let ident = identifier.as_bytes();
        let ident_len = ident.len().min(IDENTIFIER_SIZE);
        buf.put_slice(&ident[..ident_len]);
        buf.put_bytes(0, IDENTIFIER_SIZE - ident_len);

        buf.put_slice(payload);
        buf.freeze()
    }

    /// Decode a record read to EOF from the stream.
    ///
    /// Unlike NetTask, a version mismatch here is fatal for the record:
    /// alerts are one-shot and there is no retransmission to fall back on.
    pub fn decode(raw: &[u8]) -> Result<AlertRecord, ProtoError> {
        if raw.len() < HEADER_SIZE {
            return Err(ProtoError::InvalidHeader);
        }

        let version = raw[0];
        if version != ALERT_FLOW_VERSION {
            return Err(ProtoError::InvalidVersion {
                found: version,
                expected: ALERT_FLOW_VERSION,
            });
        }

        let ident_raw = &raw[1..HEADER_SIZE];
        let ident_end = ident_raw
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |p| p + 1);
        let identifier = std::str::from_utf8(&ident_raw[..ident_end])
            .map_err(|_| ProtoError::InvalidHeader)?
            .to_owned();

        Ok(AlertRecord {
            version,
            identifier,
            payload: Bytes::copy_from_slice(&raw[HEADER_SIZE..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let raw = AlertRecord::encode("agent47", br#"{"0":{"cpu_usage":0.97}}"#);
        assert_eq!(raw.len(), HEADER_SIZE + 24);
        let rec = AlertRecord::decode(&raw).unwrap();
        assert_eq!(rec.version, ALERT_FLOW_VERSION);
        assert_eq!(rec.identifier, "agent47");
        assert_eq!(rec.payload, &br#"{"0":{"cpu_usage":0.97}}"#[..]);
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let mut raw = AlertRecord::encode("a1", b"{}").to_vec();
        raw[0] = ALERT_FLOW_VERSION + 1;
        assert_eq!(
            AlertRecord::decode(&raw),
            Err(ProtoError::InvalidVersion {
                found: ALERT_FLOW_VERSION + 1,
                expected: ALERT_FLOW_VERSION,
            })
        );
    }

    #[test]
    fn short_record_is_invalid() {
        assert_eq!(
            AlertRecord::decode(&[ALERT_FLOW_VERSION; 10]),
            Err(ProtoError::InvalidHeader)
        );
    }

    #[test]
    fn kind_codes_roundtrip() {
        for code in 0u8..=6 {
            assert_eq!(AlertKind::from_code(code).code(), code);
        }
        assert_eq!(AlertKind::from_code(5), AlertKind::Unknown(5));
        assert_eq!(AlertKind::from_code(3), AlertKind::PacketLoss);
    }
}
