//! # Integration tests: NetTask endpoints over the loopback interface
//!
//! Real UDP sockets on 127.0.0.1. A raw socket stands in for the remote
//! side where a test needs to drop ACKs, reorder fragments, or advertise
//! a zero window; full Endpoint-to-Endpoint exchanges cover the happy
//! paths.

use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use nms_proto::nettask::{build_packets, Flags, MsgType, Packet, MAX_FRAGMENT_PAYLOAD, MTU};
use nms_transport::endpoint::{Endpoint, MessageSink};
use nms_transport::TransportConfig;

// ─── Helpers ────────────────────────────────────────────────────────────────

fn fast_config() -> TransportConfig {
    TransportConfig {
        retransmit_interval: Duration::from_millis(300),
        window_probe_interval: Duration::from_millis(200),
        eoc_ack_timeout: Duration::from_secs(2),
        recv_timeout: Duration::from_millis(200),
        window_poll_interval: Duration::from_millis(20),
        worker_threads: 2,
        ..TransportConfig::default()
    }
}

/// Collects every dispatched message.
#[derive(Default)]
struct Collector {
    messages: Mutex<Vec<(String, MsgType, Bytes)>>,
}

impl MessageSink for Collector {
    fn on_message(&self, _link: &Endpoint, peer: &str, msg_type: MsgType, payload: Bytes) {
        self.messages
            .lock()
            .unwrap()
            .push((peer.to_owned(), msg_type, payload));
    }
}

fn raw_socket() -> UdpSocket {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    sock
}

fn recv_packet(sock: &UdpSocket, deadline: Instant) -> Option<(Packet, SocketAddr)> {
    let mut buf = [0u8; MTU];
    while Instant::now() < deadline {
        match sock.recv_from(&mut buf) {
            Ok((len, src)) => return Some((Packet::parse(&buf[..len]).unwrap(), src)),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => panic!("recv failed: {e}"),
        }
    }
    None
}

fn wait_until(deadline: Instant, mut cond: impl FnMut() -> bool) -> bool {
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

// ─── Raw-socket scenarios against a server endpoint ─────────────────────────

#[test]
fn first_connection_round_trip() {
    let server = Endpoint::bind("127.0.0.1:0", "server", fast_config()).unwrap();
    let sink = Arc::new(Collector::default());
    let workers = server.spawn_workers(sink.clone()).unwrap();
    let server_addr = server.local_addr().unwrap();

    let agent = raw_socket();
    let (_, packets) = build_packets(b"", 1, Flags::urgent(), MsgType::FirstConnection, "a1", 64);
    assert_eq!(packets[0].len(), 42);
    agent.send_to(&packets[0], server_addr).unwrap();

    let (ack, _) = recv_packet(&agent, deadline()).expect("no ACK");
    assert!(ack.flags.ack);
    assert!(ack.flags.urgent);
    assert!(!ack.flags.retransmission);
    assert_eq!(ack.msg_type, MsgType::FirstConnection);
    assert_eq!(ack.seq_number, 1);
    assert_eq!(ack.msg_id, 1);
    assert_eq!(ack.window_size, 64);

    assert!(wait_until(deadline(), || server.pool().peer_known("a1")));

    server.initiate_shutdown();
    workers.join();
}

#[test]
fn reversed_fragments_deliver_exactly_once() {
    let server = Endpoint::bind("127.0.0.1:0", "server", fast_config()).unwrap();
    let sink = Arc::new(Collector::default());
    let workers = server.spawn_workers(sink.clone()).unwrap();
    let server_addr = server.local_addr().unwrap();

    let agent = raw_socket();
    let (_, hello) = build_packets(b"", 1, Flags::urgent(), MsgType::FirstConnection, "a1", 64);
    agent.send_to(&hello[0], server_addr).unwrap();
    recv_packet(&agent, deadline()).expect("no FIRST_CONNECTION ACK");

    let payload = vec![0x42u8; 4 * MAX_FRAGMENT_PAYLOAD + 1];
    let (_, fragments) = build_packets(
        &payload,
        10_000,
        Flags::default(),
        MsgType::SendMetrics,
        "a1",
        64,
    );
    assert_eq!(fragments.len(), 5);

    for raw in fragments.iter().rev() {
        agent.send_to(raw, server_addr).unwrap();
    }
    for _ in 0..5 {
        let (ack, _) = recv_packet(&agent, deadline()).expect("missing fragment ACK");
        assert!(ack.flags.ack);
        assert!((10_000..10_005).contains(&ack.seq_number));
    }

    assert!(wait_until(deadline(), || !sink
        .messages
        .lock()
        .unwrap()
        .is_empty()));
    let messages = sink.messages.lock().unwrap();
    assert_eq!(messages.len(), 1, "message delivered more than once");
    let (peer, msg_type, delivered) = &messages[0];
    assert_eq!(peer, "a1");
    assert_eq!(*msg_type, MsgType::SendMetrics);
    assert_eq!(&delivered[..], &payload[..]);
    drop(messages);

    server.initiate_shutdown();
    workers.join();
}

#[test]
fn duplicate_sequence_is_acked_but_dropped() {
    let server = Endpoint::bind("127.0.0.1:0", "server", fast_config()).unwrap();
    let sink = Arc::new(Collector::default());
    let workers = server.spawn_workers(sink.clone()).unwrap();
    let server_addr = server.local_addr().unwrap();

    let agent = raw_socket();
    let (_, hello) = build_packets(b"", 1, Flags::urgent(), MsgType::FirstConnection, "a1", 64);
    agent.send_to(&hello[0], server_addr).unwrap();
    recv_packet(&agent, deadline()).expect("no FIRST_CONNECTION ACK");

    let (_, data) = build_packets(b"metric", 42, Flags::default(), MsgType::SendMetrics, "a1", 64);
    agent.send_to(&data[0], server_addr).unwrap();
    agent.send_to(&data[0], server_addr).unwrap();

    // Every arrival is acknowledged, duplicates included.
    for _ in 0..2 {
        let (ack, _) = recv_packet(&agent, deadline()).expect("missing duplicate ACK");
        assert!(ack.flags.ack);
        assert_eq!(ack.seq_number, 42);
    }

    assert!(wait_until(deadline(), || !sink
        .messages
        .lock()
        .unwrap()
        .is_empty()));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(sink.messages.lock().unwrap().len(), 1);

    server.initiate_shutdown();
    workers.join();
}

// ─── Endpoint-to-endpoint exchanges ─────────────────────────────────────────

#[test]
fn agent_connects_receives_task_and_disconnects() {
    let server = Endpoint::bind("127.0.0.1:0", "server", fast_config()).unwrap();
    let server_sink = Arc::new(Collector::default());
    let server_workers = server.spawn_workers(server_sink.clone()).unwrap();
    let server_addr = server.local_addr().unwrap();

    let agent = Endpoint::connect(server_addr, "agent-1", fast_config()).unwrap();
    let agent_sink = Arc::new(Collector::default());
    let agent_workers = agent.spawn_workers(agent_sink.clone()).unwrap();

    agent.send_first_connection().unwrap();

    assert!(wait_until(deadline(), || server.pool().peer_known("agent-1")));
    // The FIRST_CONNECTION ACK cleared the agent's in-flight buffer.
    assert!(wait_until(deadline(), || agent.pool().count_unacked_all() == 0));
    // The admission was dispatched upward on the server.
    assert!(wait_until(deadline(), || server_sink
        .messages
        .lock()
        .unwrap()
        .iter()
        .any(|(peer, t, _)| peer == "agent-1" && *t == MsgType::FirstConnection)));

    // Server pushes a task; agent hands it up.
    let task = br#"{"task_id":"t1","frequency":20}"#;
    server
        .send("agent-1", task, Flags::default(), MsgType::SendTasks)
        .unwrap();
    assert!(wait_until(deadline(), || agent_sink
        .messages
        .lock()
        .unwrap()
        .iter()
        .any(|(_, t, payload)| *t == MsgType::SendTasks && &payload[..] == task)));
    assert!(wait_until(deadline(), || server.pool().count_unacked_all() == 0));

    // Agent metrics flow the other way, fragmented.
    let metrics = vec![0x5Au8; 2 * MAX_FRAGMENT_PAYLOAD];
    let key = agent.server_key().unwrap().to_owned();
    agent
        .send(&key, &metrics, Flags::default(), MsgType::SendMetrics)
        .unwrap();
    assert!(wait_until(deadline(), || server_sink
        .messages
        .lock()
        .unwrap()
        .iter()
        .any(|(_, t, payload)| *t == MsgType::SendMetrics && payload.len() == metrics.len())));

    // Graceful teardown: EOC is acknowledged and the server forgets us.
    agent.graceful_shutdown(agent_workers);
    assert!(wait_until(deadline(), || !server.pool().peer_known("agent-1")));

    server.initiate_shutdown();
    server_workers.join();
}

#[test]
fn retransmission_carries_flag_and_fresh_sequence() {
    let fake_server = raw_socket();
    let server_addr = fake_server.local_addr().unwrap();

    let agent = Endpoint::connect(server_addr, "agent-1", fast_config()).unwrap();
    let workers = agent.spawn_workers(Arc::new(Collector::default())).unwrap();

    agent.send_first_connection().unwrap();

    let (original, agent_addr) = recv_packet(&fake_server, deadline()).expect("no packet");
    assert_eq!(original.msg_type, MsgType::FirstConnection);
    assert_eq!(original.seq_number, 1);
    assert!(!original.flags.retransmission);

    // Withhold the ACK; the retransmitter must rebuild on a fresh
    // sequence with RETRANSMISSION set.
    let (retransmitted, _) = recv_packet(&fake_server, deadline()).expect("no retransmission");
    assert!(retransmitted.flags.retransmission);
    assert_eq!(retransmitted.msg_type, MsgType::FirstConnection);
    assert!(retransmitted.seq_number > 1);

    // Acknowledging the original sequence clears the entry.
    let ack = original.build_ack(&original.identifier, 64);
    fake_server.send_to(&ack, agent_addr).unwrap();
    assert!(wait_until(deadline(), || agent.pool().count_unacked_all() == 0));

    agent.initiate_shutdown();
    workers.join();
}

#[test]
fn zero_window_blocks_until_probe_reopens_it() {
    let fake_server = raw_socket();
    let server_addr = fake_server.local_addr().unwrap();

    let agent = Endpoint::connect(server_addr, "agent-1", fast_config()).unwrap();
    let workers = agent.spawn_workers(Arc::new(Collector::default())).unwrap();

    agent.send_first_connection().unwrap();
    let (hello, agent_addr) = recv_packet(&fake_server, deadline()).expect("no packet");

    // Advertise a closed window in the ACK.
    let ack = hello.build_ack(&hello.identifier, 0);
    fake_server.send_to(&ack, agent_addr).unwrap();
    let key = agent.server_key().unwrap().to_owned();
    assert!(wait_until(deadline(), || agent.pool().peer_window(&key) == Some(0)));

    // A non-urgent send must block on the closed window.
    let sender = {
        let agent = agent.clone();
        let key = key.clone();
        thread::spawn(move || {
            agent
                .send(&key, b"blocked payload", Flags::default(), MsgType::SendMetrics)
        })
    };

    // The probe loop emits an urgent window probe; answer it with a
    // reopened window.
    let probe_deadline = deadline();
    let probe = loop {
        let (pkt, _) = recv_packet(&fake_server, probe_deadline).expect("no window probe");
        if pkt.flags.window_probe {
            break pkt;
        }
        // Retransmissions of the hello may interleave; ignore them.
    };
    assert!(probe.flags.urgent);
    assert_eq!(probe.msg_type, MsgType::Undefined);
    assert!(probe.payload.is_empty());

    let reopen = probe.build_ack(&probe.identifier, 64);
    fake_server.send_to(&reopen, agent_addr).unwrap();

    // The blocked send completes and the payload hits the wire.
    sender
        .join()
        .unwrap()
        .expect("blocked send did not complete");
    let data_deadline = deadline();
    loop {
        let (pkt, _) = recv_packet(&fake_server, data_deadline).expect("no data packet");
        if pkt.msg_type == MsgType::SendMetrics && !pkt.flags.retransmission {
            assert_eq!(pkt.payload, &b"blocked payload"[..]);
            break;
        }
    }

    agent.initiate_shutdown();
    workers.join();
}

#[test]
fn eoc_drain_forces_shutdown_when_unacknowledged() {
    let fake_server = raw_socket();
    let server_addr = fake_server.local_addr().unwrap();

    let mut config = fast_config();
    config.eoc_ack_timeout = Duration::from_millis(500);
    let agent = Endpoint::connect(server_addr, "agent-1", config).unwrap();
    let workers = agent.spawn_workers(Arc::new(Collector::default())).unwrap();

    agent.send_first_connection().unwrap();

    // Nobody ever acknowledges; the drain must give up at the timeout.
    let started = Instant::now();
    agent.graceful_shutdown(workers);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(450), "drain returned too early");
    assert!(elapsed < Duration::from_secs(5), "drain did not respect its deadline");
    assert!(agent.is_shutdown());
}
