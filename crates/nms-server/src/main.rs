//! NMS Server
//!
//! Central daemon of the management system.
//!
//! - Hosts the NetTask endpoint on UDP; admits agents, pushes their
//!   configured tasks on FIRST_CONNECTION, and collects SEND_METRICS
//! - Hosts the AlertFlow listener on TCP for threshold alerts
//! - Feeds STATUS/ALERT/METRIC records to the append-only log store
//! - Offers a small operator console on stdin

mod console;
mod store;
mod tasks;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use nms_common::config::ServerConfig;
use nms_common::metrics::MetricReport;
use nms_proto::alertflow::AlertKind;
use nms_proto::nettask::{Flags, MsgType};
use nms_transport::alert::{AlertListener, AlertSink};
use nms_transport::{Endpoint, MessageSink, TransportConfig};

use store::LogStore;
use tasks::TaskRegistry;

/// NMS server daemon.
#[derive(Parser, Debug)]
#[command(name = "nms-server", about = "NMS central server")]
struct Cli {
    /// Configuration file assigning tasks to agents.
    #[arg(short, long, default_value = "config/config.json")]
    config: String,

    /// Listen address.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// NetTask (UDP) port.
    #[arg(long, default_value_t = 6000)]
    udp_port: u16,

    /// AlertFlow (TCP) port.
    #[arg(long, default_value_t = 5000)]
    tcp_port: u16,

    /// Log store path (JSON lines).
    #[arg(long, default_value = "nms-server.log.jsonl")]
    log_file: String,
}

/// Upward dispatch from the transport.
struct ServerSink {
    registry: TaskRegistry,
    store: Arc<LogStore>,
}

impl MessageSink for ServerSink {
    fn on_message(&self, link: &Endpoint, peer: &str, msg_type: MsgType, payload: Bytes) {
        match msg_type {
            MsgType::FirstConnection => {
                self.store.save_status(format!("agent {peer} connected"));
                self.dispatch_tasks(link, peer);
            }
            MsgType::SendMetrics => self.save_metrics(peer, &payload),
            other => {
                tracing::debug!(peer = %peer, msg_type = ?other, "ignoring message");
            }
        }
    }
}

impl ServerSink {
    /// Push every configured task for a freshly admitted agent, one
    /// SEND_TASKS message per task.
    fn dispatch_tasks(&self, link: &Endpoint, peer: &str) {
        let tasks = self.registry.agent_tasks(peer);
        if tasks.is_empty() {
            tracing::info!(peer = %peer, "no tasks configured for agent");
            return;
        }
        for task in tasks {
            let payload = match serde_json::to_vec(task) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(task_id = %task.task_id, error = %e, "failed to serialize task");
                    continue;
                }
            };
            match link.send(peer, &payload, Flags::default(), MsgType::SendTasks) {
                Ok(()) => tracing::info!(peer = %peer, task_id = %task.task_id, "task dispatched"),
                Err(e) => {
                    tracing::warn!(peer = %peer, task_id = %task.task_id, error = %e, "failed to dispatch task")
                }
            }
        }
    }

    fn save_metrics(&self, peer: &str, payload: &[u8]) {
        match serde_json::from_slice::<MetricReport>(payload) {
            Ok(report) => {
                tracing::info!(peer = %peer, task_id = %report.task_id, "metrics received");
                self.store
                    .save_metric(peer, String::from_utf8_lossy(payload).into_owned());
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "dropping undecodable metric report")
            }
        }
    }
}

/// Alert intake: one log line per alert.
struct AlertStore {
    store: Arc<LogStore>,
}

impl AlertSink for AlertStore {
    fn save_alert(&self, peer: &str, kind: AlertKind, message: String) {
        self.store.save_alert(peer, format!("{kind}: {message}"));
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = ServerConfig::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;
    let registry = TaskRegistry::new(&config);
    tracing::info!(
        config = %cli.config,
        assignments = registry.assignment_count(),
        "configuration loaded"
    );

    let store = Arc::new(LogStore::open(&cli.log_file).context("failed to open log store")?);

    // NetTask plane.
    let endpoint = Endpoint::bind(
        format!("{}:{}", cli.bind, cli.udp_port),
        "server",
        TransportConfig::default(),
    )
    .context("failed to bind NetTask UDP port")?;
    let workers = endpoint
        .spawn_workers(Arc::new(ServerSink {
            registry,
            store: store.clone(),
        }))
        .context("failed to start transport workers")?;
    store.save_status(format!("NetTask server started on UDP port {}", cli.udp_port));

    // AlertFlow plane.
    let alert_shutdown = Arc::new(AtomicBool::new(false));
    let alert_listener = AlertListener::bind(format!("{}:{}", cli.bind, cli.tcp_port))
        .context("failed to bind AlertFlow TCP port")?;
    let alert_handle = alert_listener.spawn(
        Arc::new(AlertStore {
            store: store.clone(),
        }),
        alert_shutdown.clone(),
    )?;
    store.save_status(format!("AlertFlow server started on TCP port {}", cli.tcp_port));

    // Operator console plus SIGINT, either can stop the server.
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }
    {
        let endpoint = endpoint.clone();
        let store = store.clone();
        let shutdown = shutdown.clone();
        // Not joined: a blocked stdin read cannot be interrupted.
        std::thread::Builder::new()
            .name("nms-console".into())
            .spawn(move || console::run(endpoint, store, shutdown))?;
    }

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    tracing::info!("shutting down, disconnecting agents");
    endpoint.graceful_shutdown(workers);

    alert_shutdown.store(true, Ordering::SeqCst);
    let _ = alert_handle.join();

    store.save_status("server shutdown complete");
    Ok(())
}
