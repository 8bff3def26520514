//! NMS Agent
//!
//! Field daemon running on each monitored host.
//!
//! - Announces itself to the server with FIRST_CONNECTION over NetTask
//! - Receives measurement tasks over SEND_TASKS and runs them on schedule
//! - Reports metrics over SEND_METRICS on the reliable channel
//! - Raises threshold breaches over the AlertFlow TCP side-channel
//! - In `--simulate` mode, fabricates plausible readings for local dev

mod collect;
mod runner;

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use nms_common::task::Task;
use nms_proto::nettask::MsgType;
use nms_transport::{alert, Endpoint, MessageSink, TransportConfig};

use runner::TaskRunner;

/// NMS field agent daemon.
#[derive(Parser, Debug)]
#[command(name = "nms-agent", about = "NMS measurement agent")]
struct Cli {
    /// Server host name or IP.
    #[arg(short, long, default_value = "127.0.0.1")]
    server: String,

    /// Server NetTask (UDP) port.
    #[arg(long, default_value_t = 6000)]
    udp_port: u16,

    /// Server AlertFlow (TCP) port.
    #[arg(long, default_value_t = 5000)]
    tcp_port: u16,

    /// Agent identifier override (defaults to the host name).
    #[arg(long)]
    id: Option<String>,

    /// Fabricate measurement readings instead of probing real devices.
    #[arg(long, default_value_t = false)]
    simulate: bool,
}

/// Upward dispatch from the transport: tasks land in the runner.
struct AgentSink {
    runner: TaskRunner,
}

impl MessageSink for AgentSink {
    fn on_message(&self, _link: &Endpoint, peer: &str, msg_type: MsgType, payload: Bytes) {
        match msg_type {
            MsgType::SendTasks => match serde_json::from_slice::<Task>(&payload) {
                Ok(task) => self.runner.add_task(task),
                Err(e) => tracing::warn!(error = %e, "dropping undecodable task"),
            },
            other => {
                tracing::debug!(peer = %peer, msg_type = ?other, "ignoring message");
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let identifier = cli.id.unwrap_or_else(|| {
        gethostname().unwrap_or_else(|| "nms-agent".into())
    });

    let udp_addr = resolve(&cli.server, cli.udp_port)
        .with_context(|| format!("cannot resolve {}:{}", cli.server, cli.udp_port))?;
    let alert_addr = resolve(&cli.server, cli.tcp_port)
        .with_context(|| format!("cannot resolve {}:{}", cli.server, cli.tcp_port))?;

    tracing::info!(
        identifier = %identifier,
        server = %udp_addr,
        simulate = cli.simulate,
        "nms-agent starting"
    );

    // The alert plane is connect-per-record; make sure it is reachable at
    // all before settling in.
    alert::probe(alert_addr)
        .with_context(|| format!("AlertFlow server unreachable at {alert_addr}"))?;

    let endpoint = Endpoint::connect(udp_addr, identifier.clone(), TransportConfig::default())
        .context("failed to create NetTask endpoint")?;

    let task_runner = TaskRunner::new(
        endpoint.clone(),
        alert_addr,
        identifier.clone(),
        cli.simulate,
    );
    let sink = Arc::new(AgentSink {
        runner: task_runner.clone(),
    });

    let workers = endpoint
        .spawn_workers(sink)
        .context("failed to start transport workers")?;
    let runner_handle = task_runner.spawn()?;

    endpoint.send_first_connection()?;

    // SIGINT starts the graceful EOC sequence.
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        })?;
    }

    while !interrupted.load(Ordering::SeqCst) && !endpoint.is_shutdown() {
        std::thread::sleep(Duration::from_millis(200));
    }

    if interrupted.load(Ordering::SeqCst) {
        tracing::info!("interrupted, disconnecting from server");
    }

    task_runner.stop();
    endpoint.graceful_shutdown(workers);
    let _ = runner_handle.join();

    tracing::info!("nms-agent stopped");
    Ok(())
}

fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}

fn gethostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
