//! Task definitions: the unit of work the server assigns to an agent.
//!
//! Tasks travel as JSON over SEND_TASKS, exactly as they appear in the
//! server configuration file.

use serde::{Deserialize, Serialize};

/// A periodic measurement job for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    /// Seconds between runs.
    pub frequency: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_metrics: Option<DeviceMetricsSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_metrics: Option<LinkMetricsSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alertflow_conditions: Option<AlertConditions>,
}

/// Which local device readings to collect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetricsSpec {
    #[serde(default)]
    pub cpu_usage: bool,
    #[serde(default)]
    pub ram_usage: bool,
    /// Interfaces to sample packet rates for; empty means none.
    #[serde(default)]
    pub interface_stats: Vec<String>,
}

/// Which link probes to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkMetricsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<PingSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iperf: Option<IperfSpec>,
}

/// ICMP probe parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingSpec {
    pub destination: String,
    #[serde(default = "default_packet_count")]
    pub packet_count: u32,
    #[serde(default)]
    pub options: Vec<LinkProbeOption>,
}

fn default_packet_count() -> u32 {
    10
}

/// iperf3 probe parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IperfSpec {
    pub server: String,
    #[serde(default = "default_iperf_port")]
    pub port: u16,
    /// Test duration in seconds.
    #[serde(default = "default_iperf_duration")]
    pub duration: u64,
    /// Run over UDP (jitter/loss) instead of TCP (bandwidth).
    #[serde(default)]
    pub udp: bool,
    #[serde(default)]
    pub options: Vec<LinkProbeOption>,
}

fn default_iperf_port() -> u16 {
    5201
}

fn default_iperf_duration() -> u64 {
    5
}

/// Readings a link probe can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkProbeOption {
    Latency,
    Jitter,
    PacketLoss,
    Bandwidth,
}

/// Thresholds that escalate a reading into an AlertFlow record. A reading
/// at or above its threshold raises the alert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_usage: Option<f64>,
    /// Packets per second per interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_stats: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_loss: Option<f64>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_json_roundtrip() {
        let json = r#"{
            "task_id": "task-203",
            "frequency": 20,
            "device_metrics": {
                "cpu_usage": true,
                "ram_usage": true,
                "interface_stats": ["eth0", "eth1"]
            },
            "link_metrics": {
                "ping": {
                    "destination": "10.0.0.1",
                    "packet_count": 5,
                    "options": ["latency", "jitter", "packet_loss"]
                }
            },
            "alertflow_conditions": {
                "cpu_usage": 0.9,
                "jitter": 50.0
            }
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.task_id, "task-203");
        assert_eq!(task.frequency, 20);
        let device = task.device_metrics.as_ref().unwrap();
        assert!(device.cpu_usage);
        assert_eq!(device.interface_stats, ["eth0", "eth1"]);
        let ping = task.link_metrics.as_ref().unwrap().ping.as_ref().unwrap();
        assert_eq!(ping.packet_count, 5);
        assert_eq!(
            ping.options,
            [
                LinkProbeOption::Latency,
                LinkProbeOption::Jitter,
                LinkProbeOption::PacketLoss
            ]
        );
        assert_eq!(task.alertflow_conditions.as_ref().unwrap().cpu_usage, Some(0.9));

        let reparsed: Task =
            serde_json::from_str(&serde_json::to_string(&task).unwrap()).unwrap();
        assert_eq!(reparsed, task);
    }

    #[test]
    fn omitted_sections_default() {
        let task: Task = serde_json::from_str(r#"{"task_id":"t","frequency":60}"#).unwrap();
        assert!(task.device_metrics.is_none());
        assert!(task.link_metrics.is_none());
        assert!(task.alertflow_conditions.is_none());
    }

    #[test]
    fn ping_defaults_apply() {
        let ping: PingSpec =
            serde_json::from_str(r#"{"destination":"8.8.8.8"}"#).unwrap();
        assert_eq!(ping.packet_count, 10);
        assert!(ping.options.is_empty());
    }
}
