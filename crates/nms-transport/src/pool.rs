//! # Peer Pool
//!
//! Per-peer sliding-window state behind a single mutex: sequence counters,
//! the unacked buffer awaiting ACKs, the reorder buffer awaiting
//! reassembly, the duplicate-suppression set, and the peer's advertised
//! window. Every exposed operation is short, non-blocking, and atomic with
//! respect to concurrent workers; no caller holds the lock across a socket
//! operation.
//!
//! The server keeps one entry per connected agent; the agent keeps a single
//! entry for the server. The local window is pool-wide: it counts the free
//! slots of the shared reorder buffer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;

use bytes::BytesMut;
use nms_proto::nettask::Packet;

// ─── Lifecycle ───────────────────────────────────────────────────────────────

/// Connection phase of a peer. An unknown peer is implicitly unseen; a
/// closed peer is removed from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Connected,
    Closing,
}

// ─── Peer Entry ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PeerEntry {
    /// Last observed datagram address (server side; the agent keeps the
    /// configured server address here).
    addr: Option<SocketAddr>,
    phase: PeerPhase,
    /// Once closing: when to stop waiting for outstanding ACKs.
    closing_deadline: Option<Instant>,
    /// Next sequence number to assign when sending to this peer.
    next_seq: u16,
    /// In-flight packets keyed by their original sequence number.
    unacked: BTreeMap<u16, Packet>,
    /// Sequences already delivered, for duplicate suppression.
    received: BTreeSet<u16>,
    /// Received fragments awaiting reassembly, keyed by (msg_id, seq).
    reorder: BTreeMap<(u16, u16), Packet>,
    /// Last window advertisement from this peer.
    peer_window: u16,
}

impl PeerEntry {
    fn new(addr: Option<SocketAddr>, initial_window: u16) -> Self {
        PeerEntry {
            addr,
            phase: PeerPhase::Connected,
            closing_deadline: None,
            next_seq: 1,
            unacked: BTreeMap::new(),
            received: BTreeSet::new(),
            reorder: BTreeMap::new(),
            peer_window: initial_window,
        }
    }
}

// ─── Pool ────────────────────────────────────────────────────────────────────

struct PoolInner {
    peers: HashMap<String, PeerEntry>,
    /// Free slots in the shared reorder buffer.
    local_window: u16,
}

/// The shared peer-state container. One per endpoint.
pub struct Pool {
    inner: Mutex<PoolInner>,
    initial_window: u16,
    received_cap: usize,
}

impl Pool {
    pub fn new(initial_window: u16, received_cap: usize) -> Self {
        Pool {
            inner: Mutex::new(PoolInner {
                peers: HashMap::new(),
                local_window: initial_window,
            }),
            initial_window,
            received_cap,
        }
    }

    // ─── Peers ───────────────────────────────────────────────────────────

    /// Create state for a newly admitted peer. Returns `false` when the
    /// peer already exists (its state is left untouched).
    pub fn add_peer(&self, peer: &str, addr: Option<SocketAddr>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.peers.contains_key(peer) {
            return false;
        }
        inner
            .peers
            .insert(peer.to_owned(), PeerEntry::new(addr, self.initial_window));
        true
    }

    /// Drop a peer's state, releasing any reorder slots it still pins.
    pub fn remove_peer(&self, peer: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.peers.remove(peer) {
            inner.local_window = inner
                .local_window
                .saturating_add(entry.reorder.len() as u16)
                .min(self.initial_window);
        }
    }

    pub fn peer_known(&self, peer: &str) -> bool {
        self.inner.lock().unwrap().peers.contains_key(peer)
    }

    /// Connected peers with their last observed addresses.
    pub fn list_peers(&self) -> Vec<(String, Option<SocketAddr>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .peers
            .iter()
            .map(|(id, e)| (id.clone(), e.addr))
            .collect()
    }

    pub fn peer_addr(&self, peer: &str) -> Option<SocketAddr> {
        self.inner.lock().unwrap().peers.get(peer)?.addr
    }

    pub fn set_peer_addr(&self, peer: &str, addr: SocketAddr) {
        if let Some(entry) = self.inner.lock().unwrap().peers.get_mut(peer) {
            entry.addr = Some(addr);
        }
    }

    /// Enter the closing phase: the peer is removed once its unacked
    /// buffer drains or the deadline passes, whichever comes first.
    pub fn mark_closing(&self, peer: &str, deadline: Instant) {
        if let Some(entry) = self.inner.lock().unwrap().peers.get_mut(peer) {
            if entry.phase != PeerPhase::Closing {
                entry.phase = PeerPhase::Closing;
                entry.closing_deadline = Some(deadline);
            }
        }
    }

    pub fn phase(&self, peer: &str) -> Option<PeerPhase> {
        Some(self.inner.lock().unwrap().peers.get(peer)?.phase)
    }

    /// Closing peers whose drain deadline has passed.
    pub fn expired_closing_peers(&self, now: Instant) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .peers
            .iter()
            .filter(|(_, e)| {
                e.phase == PeerPhase::Closing && e.closing_deadline.is_some_and(|d| d <= now)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    // ─── Sequence numbers ────────────────────────────────────────────────

    pub fn next_seq(&self, peer: &str) -> Option<u16> {
        Some(self.inner.lock().unwrap().peers.get(peer)?.next_seq)
    }

    /// Commit the sequence counter advanced by the codec.
    pub fn commit_next_seq(&self, peer: &str, next: u16) {
        if let Some(entry) = self.inner.lock().unwrap().peers.get_mut(peer) {
            entry.next_seq = next;
        }
    }

    /// Atomically claim `count` consecutive sequence numbers, returning
    /// the first. Two concurrent senders can never build on the same
    /// sequence.
    pub fn reserve_seq(&self, peer: &str, count: u16) -> Option<u16> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.peers.get_mut(peer)?;
        let start = entry.next_seq;
        entry.next_seq = start.wrapping_add(count);
        Some(start)
    }

    pub fn inc_next_seq(&self, peer: &str) {
        if let Some(entry) = self.inner.lock().unwrap().peers.get_mut(peer) {
            entry.next_seq = entry.next_seq.wrapping_add(1);
        }
    }

    // ─── Unacked buffer ──────────────────────────────────────────────────

    /// Track a sent packet until its ACK arrives. ACK packets themselves
    /// are never tracked.
    pub fn add_unacked(&self, peer: &str, packet: Packet) {
        if packet.flags.ack {
            return;
        }
        if let Some(entry) = self.inner.lock().unwrap().peers.get_mut(peer) {
            entry.unacked.insert(packet.seq_number, packet);
        }
    }

    /// Clear the entry matching an acknowledged sequence. Returns the
    /// number of packets still in flight to that peer.
    pub fn remove_unacked(&self, peer: &str, seq: u16) -> usize {
        let mut inner = self.inner.lock().unwrap();
        match inner.peers.get_mut(peer) {
            Some(entry) => {
                entry.unacked.remove(&seq);
                entry.unacked.len()
            }
            None => 0,
        }
    }

    /// Snapshot every peer's in-flight packets for the retransmitter.
    pub fn unacked_snapshot(&self) -> Vec<(String, Option<SocketAddr>, Vec<Packet>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .peers
            .iter()
            .map(|(id, e)| (id.clone(), e.addr, e.unacked.values().cloned().collect()))
            .collect()
    }

    pub fn count_unacked(&self, peer: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .peers
            .get(peer)
            .map_or(0, |e| e.unacked.len())
    }

    pub fn count_unacked_all(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.peers.values().map(|e| e.unacked.len()).sum()
    }

    // ─── Duplicate suppression ───────────────────────────────────────────

    /// Record a received sequence. Returns `true` on first admission,
    /// `false` for a duplicate. The set is bounded: past capacity the
    /// smallest (oldest) sequences are evicted.
    pub fn admit_received(&self, peer: &str, seq: u16) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.peers.get_mut(peer) else {
            return false;
        };
        if !entry.received.insert(seq) {
            return false;
        }
        while entry.received.len() > self.received_cap {
            let oldest = *entry.received.iter().next().unwrap();
            entry.received.remove(&oldest);
        }
        true
    }

    // ─── Windows ─────────────────────────────────────────────────────────

    pub fn peer_window(&self, peer: &str) -> Option<u16> {
        Some(self.inner.lock().unwrap().peers.get(peer)?.peer_window)
    }

    pub fn set_peer_window(&self, peer: &str, window: u16) {
        if let Some(entry) = self.inner.lock().unwrap().peers.get_mut(peer) {
            entry.peer_window = window;
        }
    }

    /// Free slots in the shared reorder buffer — the value advertised in
    /// every outgoing header.
    pub fn local_window(&self) -> u16 {
        self.inner.lock().unwrap().local_window
    }

    /// Peers whose last advertisement was a zero window.
    pub fn zero_window_peers(&self) -> Vec<(String, Option<SocketAddr>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .peers
            .iter()
            .filter(|(_, e)| e.peer_window == 0)
            .map(|(id, e)| (id.clone(), e.addr))
            .collect()
    }

    // ─── Reassembly ──────────────────────────────────────────────────────

    /// Admit a fragment into the reorder buffer and attempt reassembly of
    /// its logical message.
    ///
    /// Returns the reassembled record once every fragment from `msg_id` up
    /// to the one bearing a clear MORE_FRAGMENTS bit is present: fragments
    /// are concatenated in sequence order, removed from the buffer, and
    /// their window slots released. Until then returns `None`.
    ///
    /// Duplicates are filtered by [`Pool::admit_received`] before this is
    /// called, so the buffer never holds two fragments with the same
    /// sequence.
    pub fn reorder_admit(&self, peer: &str, packet: Packet) -> Option<Packet> {
        let mut guard = self.inner.lock().unwrap();
        let PoolInner {
            peers,
            local_window,
        } = &mut *guard;
        let entry = peers.get_mut(peer)?;

        let msg_id = packet.msg_id;
        entry
            .reorder
            .insert((msg_id, packet.seq_number), packet);
        *local_window = local_window.saturating_sub(1);

        // The group is contiguous in the map thanks to the composite key.
        let group: Vec<&Packet> = entry
            .reorder
            .range((msg_id, u16::MIN)..=(msg_id, u16::MAX))
            .map(|(_, p)| p)
            .collect();

        let tail_seq = group
            .iter()
            .find(|p| !p.flags.more_fragments)
            .map(|p| p.seq_number)?;
        if tail_seq < msg_id {
            return None;
        }

        let expected = usize::from(tail_seq - msg_id) + 1;
        if group.len() < expected
            || group
                .iter()
                .take(expected)
                .enumerate()
                .any(|(i, p)| p.seq_number != msg_id.wrapping_add(i as u16))
        {
            return None;
        }

        let mut payload = BytesMut::new();
        for p in group.iter().take(expected) {
            payload.extend_from_slice(&p.payload);
        }

        let mut assembled = entry
            .reorder
            .remove(&(msg_id, msg_id))
            .expect("first fragment present after completeness check");
        for i in 1..expected {
            entry.reorder.remove(&(msg_id, msg_id.wrapping_add(i as u16)));
        }
        *local_window = local_window
            .saturating_add(expected as u16)
            .min(self.initial_window);

        assembled.flags.more_fragments = false;
        assembled.payload = payload.freeze();
        Some(assembled)
    }
}
