//! Endpoint tuning knobs, threaded through construction instead of a
//! global constants module.

use std::time::Duration;

/// NetTask endpoint configuration parameters.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Initial flow-control window: free slots in the reorder buffer.
    pub initial_window: u16,
    /// How long the retransmitter sleeps between scans of the unacked
    /// buffers.
    pub retransmit_interval: Duration,
    /// How long the probe loop sleeps between scans for zero-window peers.
    pub window_probe_interval: Duration,
    /// How long to wait for outstanding ACKs after sending EOC before
    /// forcing shutdown.
    pub eoc_ack_timeout: Duration,
    /// Receive-socket poll timeout; bounds how long shutdown can go
    /// unnoticed by the receive loop.
    pub recv_timeout: Duration,
    /// Cadence of the flow-control gate's window poll.
    pub window_poll_interval: Duration,
    /// Inbound-datagram worker threads.
    pub worker_threads: usize,
    /// Bounded queue between the receive loop and the workers; overflow
    /// drops the datagram and relies on retransmission.
    pub inbound_queue: usize,
    /// Per-peer duplicate-detection memory: oldest sequences are evicted
    /// past this many entries.
    pub received_cap: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            initial_window: 64,
            retransmit_interval: Duration::from_secs(5),
            window_probe_interval: Duration::from_secs(5),
            eoc_ack_timeout: Duration::from_secs(15),
            recv_timeout: Duration::from_secs(1),
            window_poll_interval: Duration::from_millis(100),
            worker_threads: 4,
            inbound_queue: 256,
            received_cap: 4096,
        }
    }
}
