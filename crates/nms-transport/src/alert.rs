//! # AlertFlow TCP Plane
//!
//! Critical events bypass the UDP path on a plain TCP record: the agent
//! opens a fresh connection, writes one record, and closes; the server
//! reads to EOF, decodes, and logs one line per contained alert. No retry
//! on either side.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nms_proto::alertflow::{AlertKind, AlertRecord};

/// Where decoded alerts land on the server.
pub trait AlertSink: Send + Sync + 'static {
    fn save_alert(&self, peer: &str, kind: AlertKind, message: String);
}

// ─── Server side ─────────────────────────────────────────────────────────────

/// Accepts one-shot alert connections until the shutdown flag is raised.
pub struct AlertListener {
    listener: TcpListener,
}

impl AlertListener {
    /// Bind the alert port. Fatal on failure, like the UDP bind.
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<AlertListener> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(AlertListener { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop on its own thread. Alert records are tiny and
    /// one-shot, so clients are served inline rather than fanned out.
    pub fn spawn(
        self,
        sink: Arc<dyn AlertSink>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("alertflow-accept".into())
            .spawn(move || self.accept_loop(sink, shutdown))
    }

    fn accept_loop(self, sink: Arc<dyn AlertSink>, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = handle_client(stream, sink.as_ref()) {
                        tracing::warn!(from = %addr, error = %e, "failed to read alert record");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(200));
                }
                Err(e) => {
                    tracing::error!(error = %e, "alert listener failed");
                    break;
                }
            }
        }
    }
}

fn handle_client(mut stream: TcpStream, sink: &dyn AlertSink) -> io::Result<()> {
    // Accepted sockets may inherit the listener's non-blocking mode.
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;

    // The connection close delimits the record.
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;

    let record = match AlertRecord::decode(&raw) {
        Ok(record) => record,
        Err(e) => {
            tracing::error!(error = %e, "dropping undecodable alert record");
            return Ok(());
        }
    };

    dispatch_alerts(&record, sink);
    Ok(())
}

/// Decode the alert-type-tagged JSON object and emit one sink call per
/// contained alert.
fn dispatch_alerts(record: &AlertRecord, sink: &dyn AlertSink) {
    let alerts = match serde_json::from_slice::<serde_json::Value>(&record.payload) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(other) => {
            tracing::warn!(peer = %record.identifier, payload = %other, "alert payload is not an object");
            return;
        }
        Err(e) => {
            tracing::warn!(peer = %record.identifier, error = %e, "alert payload is not valid JSON");
            return;
        }
    };

    for (code, data) in alerts {
        let kind = match code.parse::<u8>() {
            Ok(code) => AlertKind::from_code(code),
            Err(_) => {
                tracing::warn!(peer = %record.identifier, code = %code, "non-numeric alert code");
                continue;
            }
        };
        if let AlertKind::Unknown(code) = kind {
            tracing::warn!(peer = %record.identifier, code, "unknown alert type received");
        }
        sink.save_alert(&record.identifier, kind, data.to_string());
    }
}

// ─── Client side ─────────────────────────────────────────────────────────────

/// Verify the alert port is reachable before the agent starts its probes.
pub fn probe(addr: SocketAddr) -> io::Result<()> {
    TcpStream::connect_timeout(&addr, Duration::from_secs(5)).map(drop)
}

/// Send one alert record: open, write, close.
pub fn send_alert(addr: SocketAddr, identifier: &str, payload: &[u8]) -> io::Result<()> {
    let raw = AlertRecord::encode(identifier, payload);
    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5))?;
    stream.write_all(&raw)?;
    stream.shutdown(std::net::Shutdown::Write)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    struct Collector {
        alerts: Mutex<Vec<(String, AlertKind, String)>>,
    }

    impl AlertSink for Collector {
        fn save_alert(&self, peer: &str, kind: AlertKind, message: String) {
            self.alerts
                .lock()
                .unwrap()
                .push((peer.to_owned(), kind, message));
        }
    }

    #[test]
    fn one_shot_alert_reaches_the_sink() {
        let listener = AlertListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let sink = Arc::new(Collector {
            alerts: Mutex::new(Vec::new()),
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = listener.spawn(sink.clone(), shutdown.clone()).unwrap();

        probe(addr).unwrap();
        send_alert(
            addr,
            "agent47",
            br#"{"0":{"cpu_usage":0.97,"alert_condition":0.9},"4":{"jitter":12.5}}"#,
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if sink.alerts.lock().unwrap().len() == 2 {
                break;
            }
            assert!(Instant::now() < deadline, "alerts never arrived");
            thread::sleep(Duration::from_millis(50));
        }

        let alerts = sink.alerts.lock().unwrap();
        assert!(alerts
            .iter()
            .any(|(peer, kind, msg)| peer == "agent47"
                && *kind == AlertKind::CpuUsage
                && msg.contains("0.97")));
        assert!(alerts
            .iter()
            .any(|(_, kind, _)| *kind == AlertKind::Jitter));

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }
}
