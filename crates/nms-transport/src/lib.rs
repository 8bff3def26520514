//! # nms-transport
//!
//! The NetTask reliable-datagram endpoint and the AlertFlow TCP plane.
//!
//! NetTask layers connection-oriented, reliable, ordered, fragmenting,
//! flow-controlled message delivery on top of a plain UDP socket,
//! symmetric between server and agent.
//!
//! ## Crate structure
//!
//! - [`config`] — endpoint tuning knobs
//! - [`pool`] — per-peer sliding-window state behind one mutex
//! - [`endpoint`] — the UDP engine: receive path, send path,
//!   retransmitter, window-probe loop, connection lifecycle
//! - [`alert`] — AlertFlow TCP listener and one-shot client

pub mod alert;
pub mod config;
pub mod endpoint;
pub mod pool;

pub use config::TransportConfig;
pub use endpoint::{Endpoint, MessageSink, TransportError, Workers};
