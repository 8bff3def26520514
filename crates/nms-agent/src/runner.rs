//! Task runner: executes the server-assigned measurement tasks on one
//! worker thread, reports metrics over the reliable channel, and raises
//! AlertFlow records when readings cross their thresholds.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;

use nms_common::metrics::{DeviceReadings, LinkReadings, MetricReport};
use nms_common::task::Task;
use nms_proto::alertflow::AlertKind;
use nms_proto::nettask::{Flags, MsgType};
use nms_transport::{alert, Endpoint};

use crate::collect::Collector;

struct ScheduledTask {
    task: Task,
    next_run: Instant,
}

struct RunnerInner {
    tasks: Mutex<Vec<ScheduledTask>>,
    stop: AtomicBool,
    collector: Collector,
    endpoint: Endpoint,
    server_key: String,
    alert_addr: SocketAddr,
    identifier: String,
}

/// Single-threaded measurement scheduler. Tasks run sequentially when due;
/// one slow probe delays the others rather than spawning unbounded
/// workers.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

impl TaskRunner {
    pub fn new(
        endpoint: Endpoint,
        alert_addr: SocketAddr,
        identifier: String,
        simulate: bool,
    ) -> TaskRunner {
        let server_key = endpoint
            .server_key()
            .expect("task runner requires an agent endpoint")
            .to_owned();
        TaskRunner {
            inner: Arc::new(RunnerInner {
                tasks: Mutex::new(Vec::new()),
                stop: AtomicBool::new(false),
                collector: Collector::new(simulate),
                endpoint,
                server_key,
                alert_addr,
                identifier,
            }),
        }
    }

    /// Register a task received over SEND_TASKS. A task with a known id
    /// replaces the previous definition.
    pub fn add_task(&self, task: Task) {
        let mut tasks = self.inner.tasks.lock().unwrap();
        let next_run = Instant::now() + Duration::from_secs(task.frequency);
        tracing::info!(task_id = %task.task_id, frequency = task.frequency, "task registered");
        if let Some(slot) = tasks.iter_mut().find(|s| s.task.task_id == task.task_id) {
            *slot = ScheduledTask { task, next_run };
        } else {
            tasks.push(ScheduledTask { task, next_run });
        }
    }

    pub fn task_count(&self) -> usize {
        self.inner.tasks.lock().unwrap().len()
    }

    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    pub fn spawn(&self) -> std::io::Result<JoinHandle<()>> {
        let runner = self.clone();
        thread::Builder::new()
            .name("nms-task-runner".into())
            .spawn(move || runner.run_loop())
    }

    fn run_loop(&self) {
        while !self.inner.stop.load(Ordering::SeqCst) {
            let due: Vec<Task> = {
                let mut tasks = self.inner.tasks.lock().unwrap();
                let now = Instant::now();
                tasks
                    .iter_mut()
                    .filter(|s| s.next_run <= now)
                    .map(|s| {
                        s.next_run = now + Duration::from_secs(s.task.frequency);
                        s.task.clone()
                    })
                    .collect()
            };

            for task in due {
                if self.inner.stop.load(Ordering::SeqCst) {
                    return;
                }
                self.run_task(&task);
            }

            thread::sleep(Duration::from_secs(1));
        }
    }

    fn run_task(&self, task: &Task) {
        tracing::debug!(task_id = %task.task_id, "running task");

        let device = task
            .device_metrics
            .as_ref()
            .map(|spec| self.inner.collector.device(spec));
        let link = task
            .link_metrics
            .as_ref()
            .map(|spec| self.inner.collector.link(spec));

        let report = MetricReport {
            task_id: task.task_id.clone(),
            collected_at: Utc::now(),
            device: device.clone(),
            link: link.clone(),
        };
        match serde_json::to_vec(&report) {
            Ok(payload) => {
                if let Err(e) = self.inner.endpoint.send(
                    &self.inner.server_key,
                    &payload,
                    Flags::default(),
                    MsgType::SendMetrics,
                ) {
                    tracing::warn!(task_id = %task.task_id, error = %e, "failed to send metrics");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize metric report"),
        }

        if let Some(conditions) = &task.alertflow_conditions {
            self.evaluate_alerts(task, conditions, device.as_ref(), link.as_ref());
        }
    }

    /// Compare readings against the task's thresholds and ship one
    /// AlertFlow record carrying every breach.
    fn evaluate_alerts(
        &self,
        task: &Task,
        conditions: &nms_common::task::AlertConditions,
        device: Option<&DeviceReadings>,
        link: Option<&LinkReadings>,
    ) {
        let mut alerts = serde_json::Map::new();

        if let (Some(threshold), Some(cpu)) =
            (conditions.cpu_usage, device.and_then(|d| d.cpu_usage))
        {
            if cpu >= threshold {
                alerts.insert(
                    AlertKind::CpuUsage.code().to_string(),
                    json!({ "cpu_usage": cpu, "alert_condition": threshold }),
                );
            }
        }

        if let (Some(threshold), Some(ram)) =
            (conditions.ram_usage, device.and_then(|d| d.ram_usage))
        {
            if ram >= threshold {
                alerts.insert(
                    AlertKind::RamUsage.code().to_string(),
                    json!({ "ram_usage": ram, "alert_condition": threshold }),
                );
            }
        }

        if let Some(threshold) = conditions.interface_stats {
            if let Some(device) = device {
                let breaches: Vec<serde_json::Value> = device
                    .interface_stats
                    .iter()
                    .filter(|(_, &pps)| pps >= threshold)
                    .map(|(name, &pps)| {
                        json!({
                            "interface": name,
                            "interface_stats": pps,
                            "alert_condition": threshold,
                        })
                    })
                    .collect();
                if !breaches.is_empty() {
                    alerts.insert(
                        AlertKind::InterfaceStats.code().to_string(),
                        serde_json::Value::Array(breaches),
                    );
                }
            }
        }

        if let (Some(threshold), Some(loss)) = (
            conditions.packet_loss,
            link.and_then(|l| l.packet_loss_pct),
        ) {
            if loss >= threshold {
                alerts.insert(
                    AlertKind::PacketLoss.code().to_string(),
                    json!({ "packet_loss": loss, "alert_condition": threshold }),
                );
            }
        }

        if let (Some(threshold), Some(jitter)) =
            (conditions.jitter, link.and_then(|l| l.jitter_ms))
        {
            if jitter >= threshold {
                alerts.insert(
                    AlertKind::Jitter.code().to_string(),
                    json!({ "jitter": jitter, "alert_condition": threshold }),
                );
            }
        }

        if alerts.is_empty() {
            return;
        }

        tracing::warn!(task_id = %task.task_id, count = alerts.len(), "alert conditions met");
        let payload = serde_json::Value::Object(alerts).to_string();
        if let Err(e) = alert::send_alert(
            self.inner.alert_addr,
            &self.inner.identifier,
            payload.as_bytes(),
        ) {
            tracing::warn!(error = %e, "failed to deliver alert");
        }
    }
}
