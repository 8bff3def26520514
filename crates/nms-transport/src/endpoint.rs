//! # NetTask UDP Endpoint
//!
//! The symmetric reliable-datagram engine. One endpoint per process:
//! the server binds a well-known port and learns peers from
//! FIRST_CONNECTION admissions; the agent binds an ephemeral port and
//! tracks the single configured server.
//!
//! Workers per endpoint: one receive loop feeding a bounded inbound
//! queue, a small pool of datagram workers, the retransmitter, and the
//! window-probe loop. All shared state lives in the [`Pool`] behind its
//! mutex; the outgoing socket has its own send mutex so datagrams from
//! the four worker kinds never interleave. No lock is held across a
//! socket operation.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;

use nms_proto::nettask::{build_packets, fragment_count, Flags, MsgType, Packet, MTU};
use nms_proto::ProtoError;

use crate::config::TransportConfig;
use crate::pool::{PeerPhase, Pool};

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown peer {0}")]
    UnknownPeer(String),

    #[error("endpoint is shutting down")]
    ShuttingDown,
}

// ─── Message sink ────────────────────────────────────────────────────────────

/// Upward dispatch interface. The host hands an implementation to
/// [`Endpoint::spawn_workers`]; reassembled application messages arrive
/// here together with a handle for replying, so the host never needs a
/// back-reference into the transport.
pub trait MessageSink: Send + Sync + 'static {
    fn on_message(&self, link: &Endpoint, peer: &str, msg_type: MsgType, payload: Bytes);
}

// ─── Roles ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Role {
    /// Learns peers from FIRST_CONNECTION; stamps each packet with the
    /// destination agent's identifier.
    Server,
    /// Tracks one peer (the server) under a fixed pool key; stamps every
    /// packet with its own identifier.
    Agent {
        server_addr: SocketAddr,
        server_key: String,
    },
}

// ─── Endpoint ────────────────────────────────────────────────────────────────

struct Inner {
    socket: UdpSocket,
    /// Serializes sends from the receive path, retransmitter, probe loop
    /// and the host's send path.
    send_guard: Mutex<()>,
    pool: Pool,
    config: TransportConfig,
    identifier: String,
    role: Role,
    shutdown: AtomicBool,
    eoc_received: AtomicBool,
}

/// Cheaply cloneable handle to a NetTask endpoint.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

/// Join handles for an endpoint's background workers.
pub struct Workers {
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

impl Endpoint {
    /// Bind the server-side endpoint. Fatal on bind failure.
    pub fn bind(
        addr: impl ToSocketAddrs,
        identifier: impl Into<String>,
        config: TransportConfig,
    ) -> Result<Endpoint, TransportError> {
        let socket = UdpSocket::bind(addr)?;
        Self::new(socket, identifier.into(), Role::Server, config)
    }

    /// Create the agent-side endpoint on an ephemeral port, tracking the
    /// given server address as its only peer.
    pub fn connect(
        server_addr: SocketAddr,
        identifier: impl Into<String>,
        config: TransportConfig,
    ) -> Result<Endpoint, TransportError> {
        let bind_addr: SocketAddr = if server_addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr)?;
        let server_key = server_addr.to_string();
        let endpoint = Self::new(
            socket,
            identifier.into(),
            Role::Agent {
                server_addr,
                server_key: server_key.clone(),
            },
            config,
        )?;
        endpoint.inner.pool.add_peer(&server_key, Some(server_addr));
        Ok(endpoint)
    }

    fn new(
        socket: UdpSocket,
        identifier: String,
        role: Role,
        config: TransportConfig,
    ) -> Result<Endpoint, TransportError> {
        socket.set_read_timeout(Some(config.recv_timeout))?;
        disable_udp_checksum(&socket);

        let pool = Pool::new(config.initial_window, config.received_cap);
        Ok(Endpoint {
            inner: Arc::new(Inner {
                socket,
                send_guard: Mutex::new(()),
                pool,
                config,
                identifier,
                role,
                shutdown: AtomicBool::new(false),
                eoc_received: AtomicBool::new(false),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    /// The agent's pool key for the server, if this is an agent endpoint.
    pub fn server_key(&self) -> Option<&str> {
        match &self.inner.role {
            Role::Agent { server_key, .. } => Some(server_key),
            Role::Server => None,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Whether the peer asked us to shut down via EOC.
    pub fn eoc_received(&self) -> bool {
        self.inner.eoc_received.load(Ordering::SeqCst)
    }

    /// Signal every worker loop to wind down.
    pub fn initiate_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
    }

    // ─── Send path ───────────────────────────────────────────────────────

    /// Reliable message submission: fragments the payload, commits the
    /// advanced sequence counter, records each packet for retransmission,
    /// and puts it on the wire. Non-URGENT sends block (coarse polling,
    /// shutdown-aware) while the peer advertises a zero window.
    pub fn send(
        &self,
        peer: &str,
        payload: &[u8],
        flags: Flags,
        msg_type: MsgType,
    ) -> Result<(), TransportError> {
        let inner = &self.inner;

        if !flags.urgent {
            loop {
                if self.is_shutdown() {
                    return Err(TransportError::ShuttingDown);
                }
                match inner.pool.peer_window(peer) {
                    None => return Err(TransportError::UnknownPeer(peer.to_owned())),
                    Some(0) => thread::sleep(inner.config.window_poll_interval),
                    Some(_) => break,
                }
            }
        }

        let seq = inner
            .pool
            .reserve_seq(peer, fragment_count(payload.len()) as u16)
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_owned()))?;
        let addr = self
            .addr_for(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_owned()))?;

        let (_, packets) = build_packets(
            payload,
            seq,
            flags,
            msg_type,
            self.wire_identifier(peer),
            inner.pool.local_window(),
        );

        for raw in packets {
            // Record before the datagram can possibly be acknowledged, so
            // a loopback-fast ACK always finds its entry.
            if let Ok(parsed) = Packet::parse(&raw) {
                inner.pool.add_unacked(peer, parsed);
            }
            self.send_raw(&raw, addr)?;
        }
        Ok(())
    }

    /// Announce this agent to the server (URGENT, empty payload).
    pub fn send_first_connection(&self) -> Result<(), TransportError> {
        let key = self
            .server_key()
            .ok_or_else(|| TransportError::UnknownPeer("server".into()))?
            .to_owned();
        self.send(&key, b"", Flags::urgent(), MsgType::FirstConnection)
    }

    /// Initiate teardown with one peer (URGENT EOC) and start its
    /// closing-phase clock.
    pub fn send_end_of_connection(&self, peer: &str) -> Result<(), TransportError> {
        self.send(peer, b"", Flags::urgent(), MsgType::Eoc)?;
        self.inner
            .pool
            .mark_closing(peer, Instant::now() + self.inner.config.eoc_ack_timeout);
        Ok(())
    }

    /// Initiate teardown with every connected peer.
    pub fn send_end_of_connection_all(&self) {
        for (peer, _) in self.inner.pool.list_peers() {
            if let Err(e) = self.send_end_of_connection(&peer) {
                tracing::warn!(peer = %peer, error = %e, "failed to send EOC");
            }
        }
    }

    /// Block until every in-flight packet is acknowledged or the timeout
    /// elapses. Returns whether the drain completed.
    pub fn drain_unacked(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.inner.pool.count_unacked_all() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.inner.config.window_poll_interval);
        }
        true
    }

    /// Full teardown: EOC to every peer, bounded ACK drain, worker stop,
    /// join.
    pub fn graceful_shutdown(&self, workers: Workers) {
        if !self.eoc_received() && !self.inner.pool.list_peers().is_empty() {
            self.send_end_of_connection_all();
            if !self.drain_unacked(self.inner.config.eoc_ack_timeout) {
                tracing::warn!(
                    outstanding = self.inner.pool.count_unacked_all(),
                    "EOC not acknowledged in time, forcing shutdown"
                );
            }
        }
        self.initiate_shutdown();
        workers.join();
        tracing::info!("endpoint stopped");
    }

    // ─── Workers ─────────────────────────────────────────────────────────

    /// Spawn the endpoint's background workers: receive loop, bounded
    /// datagram worker pool, retransmitter, window-probe loop.
    pub fn spawn_workers(&self, sink: Arc<dyn MessageSink>) -> Result<Workers, TransportError> {
        let (tx, rx) = crossbeam_channel::bounded::<(Vec<u8>, SocketAddr)>(
            self.inner.config.inbound_queue,
        );
        let mut handles = Vec::new();

        let ep = self.clone();
        handles.push(
            thread::Builder::new()
                .name("nettask-recv".into())
                .spawn(move || ep.recv_loop(tx))?,
        );

        for i in 0..self.inner.config.worker_threads {
            let ep = self.clone();
            let rx = rx.clone();
            let sink = sink.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("nettask-worker-{i}"))
                    .spawn(move || ep.worker_loop(rx, sink))?,
            );
        }

        let ep = self.clone();
        handles.push(
            thread::Builder::new()
                .name("nettask-retransmit".into())
                .spawn(move || ep.retransmit_loop())?,
        );

        let ep = self.clone();
        handles.push(
            thread::Builder::new()
                .name("nettask-probe".into())
                .spawn(move || ep.probe_loop())?,
        );

        Ok(Workers { handles })
    }

    fn recv_loop(&self, tx: crossbeam_channel::Sender<(Vec<u8>, SocketAddr)>) {
        let mut buf = [0u8; MTU];
        while !self.is_shutdown() {
            match self.inner.socket.recv_from(&mut buf) {
                Ok((len, src)) => {
                    if tx.try_send((buf[..len].to_vec(), src)).is_err() {
                        // Bounded pool: shed load and let retransmission
                        // recover the datagram.
                        tracing::warn!(from = %src, "inbound queue full, dropping datagram");
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    if !self.is_shutdown() {
                        tracing::error!(error = %e, "receive socket failed, shutting down");
                        self.initiate_shutdown();
                    }
                    break;
                }
            }
        }
    }

    fn worker_loop(
        &self,
        rx: crossbeam_channel::Receiver<(Vec<u8>, SocketAddr)>,
        sink: Arc<dyn MessageSink>,
    ) {
        loop {
            match rx.recv_timeout(self.inner.config.recv_timeout) {
                Ok((raw, src)) => self.handle_datagram(&raw, src, sink.as_ref()),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if self.is_shutdown() {
                        break;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    // ─── Receive path ────────────────────────────────────────────────────

    fn handle_datagram(&self, raw: &[u8], src: SocketAddr, sink: &dyn MessageSink) {
        let inner = &self.inner;

        let pkt = match Packet::parse(raw) {
            Ok(pkt) => pkt,
            // Corrupt or short: drop silently, the sender retransmits.
            Err(e @ (ProtoError::InvalidHeader | ProtoError::ChecksumMismatch { .. })) => {
                tracing::debug!(from = %src, error = %e, "dropping undecodable datagram");
                return;
            }
            Err(e) => {
                tracing::debug!(from = %src, error = %e, "dropping datagram");
                return;
            }
        };

        if !pkt.version_ok() {
            tracing::warn!(
                from = %src,
                version = pkt.version,
                "peer speaks a different NetTask version, processing anyway"
            );
        }

        let peer = self.peer_key(&pkt);
        inner.pool.set_peer_window(&peer, pkt.window_size);

        if pkt.flags.ack {
            let remaining = inner.pool.remove_unacked(&peer, pkt.seq_number);
            if remaining == 0 && inner.pool.phase(&peer) == Some(PeerPhase::Closing) {
                inner.pool.remove_peer(&peer);
                tracing::info!(peer = %peer, "connection closed");
            }
            return;
        }

        match (&inner.role, pkt.msg_type) {
            (Role::Server, MsgType::FirstConnection) => {
                if inner.pool.add_peer(&peer, Some(src)) {
                    tracing::info!(peer = %peer, addr = %src, "peer connected");
                } else {
                    inner.pool.set_peer_addr(&peer, src);
                }
            }
            _ if !inner.pool.peer_known(&peer) => {
                // Acknowledge and drop; the peer re-establishes via
                // FIRST_CONNECTION after its own timeout.
                tracing::warn!(peer = %peer, from = %src, "packet from unknown peer");
                let ack = pkt.build_ack(self.wire_identifier(&peer), inner.pool.local_window());
                let _ = self.send_raw(&ack, src);
                return;
            }
            _ => inner.pool.set_peer_addr(&peer, src),
        }

        // Every successfully parsed non-ACK packet is acknowledged before
        // any side effect, duplicates and EOC included.
        let ack = pkt.build_ack(self.wire_identifier(&peer), inner.pool.local_window());
        if let Err(e) = self.send_raw(&ack, src) {
            tracing::warn!(peer = %peer, error = %e, "failed to send ACK");
        }

        // A window probe only exists to elicit the advertisement the ACK
        // just carried.
        if pkt.flags.window_probe {
            return;
        }

        if !inner.pool.admit_received(&peer, pkt.seq_number) {
            tracing::debug!(peer = %peer, seq = pkt.seq_number, "duplicate sequence dropped");
            return;
        }
        inner.pool.inc_next_seq(&peer);

        let Some(message) = inner.pool.reorder_admit(&peer, pkt) else {
            return;
        };

        match message.msg_type {
            MsgType::Eoc => self.handle_eoc(&peer),
            msg_type => sink.on_message(self, &peer, msg_type, message.payload),
        }
    }

    fn handle_eoc(&self, peer: &str) {
        let inner = &self.inner;
        match inner.role {
            Role::Server => {
                if inner.pool.count_unacked(peer) == 0 {
                    inner.pool.remove_peer(peer);
                    tracing::info!(peer = %peer, "agent disconnected");
                } else {
                    inner
                        .pool
                        .mark_closing(peer, Instant::now() + inner.config.eoc_ack_timeout);
                    tracing::info!(peer = %peer, "agent disconnecting, draining in-flight packets");
                }
            }
            Role::Agent { .. } => {
                tracing::info!("server ended the connection, shutting down");
                inner.pool.remove_peer(peer);
                inner.eoc_received.store(true, Ordering::SeqCst);
                self.initiate_shutdown();
            }
        }
    }

    // ─── Retransmitter ───────────────────────────────────────────────────

    fn retransmit_loop(&self) {
        while self.sleep_observing_shutdown(self.inner.config.retransmit_interval) {
            self.reap_expired_closing();
            self.retransmit_pass();
        }
    }

    fn reap_expired_closing(&self) {
        for peer in self.inner.pool.expired_closing_peers(Instant::now()) {
            tracing::warn!(peer = %peer, "closing-drain deadline passed, dropping peer state");
            self.inner.pool.remove_peer(&peer);
        }
    }

    /// One scan over every peer's unacked buffer. Each in-flight packet is
    /// rebuilt with RETRANSMISSION set on a fresh sequence number; the
    /// unacked entry stays keyed by the original sequence, so it clears
    /// only when the original ACK arrives (a known tension in the
    /// protocol, kept for wire compatibility).
    fn retransmit_pass(&self) {
        for (peer, addr, packets) in self.inner.pool.unacked_snapshot() {
            let Some(addr) = addr else { continue };
            for pkt in packets {
                if self.is_shutdown() {
                    return;
                }
                if !pkt.flags.urgent && !self.wait_for_window(&peer) {
                    // Still zero after the grace poll; leave the rest of
                    // this peer's backlog for the next scan.
                    break;
                }
                let fragments = fragment_count(pkt.payload.len()) as u16;
                let Some(seq) = self.inner.pool.reserve_seq(&peer, fragments) else {
                    break;
                };
                let mut flags = pkt.flags;
                flags.retransmission = true;
                let (_, raws) = build_packets(
                    &pkt.payload,
                    seq,
                    flags,
                    pkt.msg_type,
                    self.wire_identifier(&peer),
                    self.inner.pool.local_window(),
                );
                tracing::debug!(peer = %peer, original_seq = pkt.seq_number, seq, "retransmitting");
                for raw in raws {
                    if let Err(e) = self.send_raw(&raw, addr) {
                        tracing::warn!(peer = %peer, error = %e, "retransmission send failed");
                    }
                }
            }
        }
    }

    /// Briefly poll for a non-zero peer window. Bounded so one stalled
    /// peer cannot starve the scan; the window-probe loop is responsible
    /// for reviving it.
    fn wait_for_window(&self, peer: &str) -> bool {
        let deadline = Instant::now() + self.inner.config.recv_timeout;
        loop {
            match self.inner.pool.peer_window(peer) {
                None => return false,
                Some(0) => {}
                Some(_) => return true,
            }
            if self.is_shutdown() || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.inner.config.window_poll_interval);
        }
    }

    // ─── Window-probe loop ───────────────────────────────────────────────

    fn probe_loop(&self) {
        while self.sleep_observing_shutdown(self.inner.config.window_probe_interval) {
            self.probe_pass();
        }
    }

    /// Send an urgent zero-payload probe to every peer stuck at a zero
    /// window; the mandatory ACK carries a fresh advertisement.
    fn probe_pass(&self) {
        for (peer, addr) in self.inner.pool.zero_window_peers() {
            let Some(addr) = addr else { continue };
            let Some(seq) = self.inner.pool.reserve_seq(&peer, 1) else {
                continue;
            };
            let flags = Flags {
                urgent: true,
                window_probe: true,
                ..Flags::default()
            };
            let (_, raws) = build_packets(
                b"",
                seq,
                flags,
                MsgType::Undefined,
                self.wire_identifier(&peer),
                self.inner.pool.local_window(),
            );
            tracing::debug!(peer = %peer, seq, "probing zero window");
            for raw in raws {
                let _ = self.send_raw(&raw, addr);
            }
        }
    }

    // ─── Plumbing ────────────────────────────────────────────────────────

    /// Sleep for `dur` in small slices, giving up early on shutdown.
    /// Returns whether the endpoint is still running.
    fn sleep_observing_shutdown(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        while Instant::now() < deadline {
            if self.is_shutdown() {
                return false;
            }
            thread::sleep(self.inner.config.window_poll_interval.min(dur));
        }
        !self.is_shutdown()
    }

    fn send_raw(&self, raw: &[u8], addr: SocketAddr) -> io::Result<()> {
        let _guard = self.inner.send_guard.lock().unwrap();
        self.inner.socket.send_to(raw, addr)?;
        Ok(())
    }

    /// Pool key for an incoming packet: the agent maps everything onto its
    /// single server entry, the server keys by the advertised identifier.
    fn peer_key(&self, pkt: &Packet) -> String {
        match &self.inner.role {
            Role::Server => pkt.identifier.clone(),
            Role::Agent { server_key, .. } => server_key.clone(),
        }
    }

    /// The identifier stamped on outgoing packets. Both directions of a
    /// conversation carry the agent's host name: the agent stamps its own,
    /// the server stamps the destination agent's.
    fn wire_identifier<'a>(&'a self, peer: &'a str) -> &'a str {
        match self.inner.role {
            Role::Server => peer,
            Role::Agent { .. } => &self.inner.identifier,
        }
    }

    fn addr_for(&self, peer: &str) -> Option<SocketAddr> {
        match &self.inner.role {
            Role::Server => self.inner.pool.peer_addr(peer),
            Role::Agent { server_addr, .. } => {
                self.inner.pool.peer_addr(peer).or(Some(*server_addr))
            }
        }
    }
}

/// Keep the kernel from stamping UDP checksums over ours (Linux only);
/// elsewhere this is a no-op.
#[cfg(target_os = "linux")]
fn disable_udp_checksum(socket: &UdpSocket) {
    use std::os::fd::AsRawFd;

    const SO_NO_CHECK: libc::c_int = 11;
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            SO_NO_CHECK,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        tracing::warn!(
            error = %io::Error::last_os_error(),
            "failed to disable UDP checksum offload"
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn disable_udp_checksum(_socket: &UdpSocket) {}
