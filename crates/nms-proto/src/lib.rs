//! # nms-proto
//!
//! Wire formats for the two NMS planes.
//!
//! - [`nettask`] — the reliable-datagram header: 42-byte big-endian layout,
//!   flag/type byte, one's-complement checksum, fragmentation, ACK building
//! - [`alertflow`] — the one-shot TCP alert record framing
//! - [`error`] — the shared decode error taxonomy

pub mod alertflow;
pub mod error;
pub mod nettask;

pub use error::ProtoError;
