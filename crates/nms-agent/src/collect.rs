//! Measurement collectors: device readings via `sysinfo`, link probes via
//! the `ping` and `iperf3` binaries. In simulate mode every reading is a
//! plausible random value, for development hosts without real probes.

use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;

use nms_common::metrics::{DeviceReadings, LinkReadings};
use nms_common::task::{DeviceMetricsSpec, IperfSpec, LinkMetricsSpec, LinkProbeOption, PingSpec};

/// How long the interface packet counters are sampled for.
const INTERFACE_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

pub struct Collector {
    simulate: bool,
}

impl Collector {
    pub fn new(simulate: bool) -> Self {
        Collector { simulate }
    }

    // ─── Device metrics ──────────────────────────────────────────────────

    pub fn device(&self, spec: &DeviceMetricsSpec) -> DeviceReadings {
        let mut readings = DeviceReadings::default();
        if spec.cpu_usage {
            readings.cpu_usage = self.cpu_usage();
        }
        if spec.ram_usage {
            readings.ram_usage = self.ram_usage();
        }
        if !spec.interface_stats.is_empty() {
            readings.interface_stats = self.interface_rates(&spec.interface_stats);
        }
        readings
    }

    /// Global CPU usage as a fraction, sampled over a short window.
    fn cpu_usage(&self) -> Option<f64> {
        if self.simulate {
            use rand::Rng;
            return Some(rand::rng().random_range(0.05..0.60));
        }
        let mut sys = sysinfo::System::new();
        sys.refresh_cpu_all();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu_all();
        Some(f64::from(sys.global_cpu_usage()) / 100.0)
    }

    /// RAM usage as a fraction of total memory.
    fn ram_usage(&self) -> Option<f64> {
        if self.simulate {
            use rand::Rng;
            return Some(rand::rng().random_range(0.20..0.80));
        }
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return None;
        }
        Some(sys.used_memory() as f64 / total as f64)
    }

    /// Packets per second per requested interface.
    fn interface_rates(&self, interfaces: &[String]) -> BTreeMap<String, u64> {
        if self.simulate {
            use rand::Rng;
            let mut rng = rand::rng();
            return interfaces
                .iter()
                .map(|name| (name.clone(), rng.random_range(50..5_000)))
                .collect();
        }

        let mut networks = sysinfo::Networks::new_with_refreshed_list();
        std::thread::sleep(INTERFACE_SAMPLE_WINDOW);
        networks.refresh(true);

        networks
            .iter()
            .filter(|(name, _)| interfaces.iter().any(|want| want == *name))
            .map(|(name, data)| {
                (
                    name.clone(),
                    data.packets_received() + data.packets_transmitted(),
                )
            })
            .collect()
    }

    // ─── Link metrics ────────────────────────────────────────────────────

    pub fn link(&self, spec: &LinkMetricsSpec) -> LinkReadings {
        let mut readings = LinkReadings::default();
        if let Some(ping) = &spec.ping {
            self.run_ping(ping, &mut readings);
        }
        if let Some(iperf) = &spec.iperf {
            self.run_iperf(iperf, &mut readings);
        }
        readings
    }

    fn run_ping(&self, spec: &PingSpec, readings: &mut LinkReadings) {
        if self.simulate {
            use rand::Rng;
            let mut rng = rand::rng();
            apply_ping(
                spec,
                PingStats {
                    latency_ms: rng.random_range(1.0..80.0),
                    jitter_ms: rng.random_range(0.1..10.0),
                    packet_loss_pct: 0.0,
                },
                readings,
            );
            return;
        }

        let output = match Command::new("ping")
            .args(["-n", "-q", "-c"])
            .arg(spec.packet_count.to_string())
            .arg(&spec.destination)
            .output()
        {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                tracing::warn!(
                    destination = %spec.destination,
                    status = %output.status,
                    "ping probe failed"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to run ping");
                return;
            }
        };

        match parse_ping_output(&String::from_utf8_lossy(&output.stdout)) {
            Some(stats) => apply_ping(spec, stats, readings),
            None => tracing::warn!(
                destination = %spec.destination,
                "unparseable ping output"
            ),
        }
    }

    fn run_iperf(&self, spec: &IperfSpec, readings: &mut LinkReadings) {
        if self.simulate {
            use rand::Rng;
            let mut rng = rand::rng();
            if spec.options.contains(&LinkProbeOption::Bandwidth) {
                readings.bandwidth_mbps = Some(rng.random_range(50.0..950.0));
            }
            if spec.udp {
                if spec.options.contains(&LinkProbeOption::Jitter) {
                    readings.jitter_ms = Some(rng.random_range(0.1..5.0));
                }
                if spec.options.contains(&LinkProbeOption::PacketLoss) {
                    readings.packet_loss_pct = Some(0.0);
                }
            }
            return;
        }

        let mut cmd = Command::new("iperf3");
        cmd.arg("-c")
            .arg(&spec.server)
            .args(["-p", &spec.port.to_string()])
            .args(["-t", &spec.duration.to_string()])
            .arg("--json");
        if spec.udp {
            cmd.arg("-u");
        }

        let output = match cmd.output() {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(error = %e, "failed to run iperf3");
                return;
            }
        };

        match serde_json::from_slice(&output.stdout) {
            Ok(value) => apply_iperf(spec, &value, readings),
            Err(e) => tracing::warn!(server = %spec.server, error = %e, "unparseable iperf3 output"),
        }
    }
}

// ─── Probe output parsing ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingStats {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_pct: f64,
}

fn apply_ping(spec: &PingSpec, stats: PingStats, readings: &mut LinkReadings) {
    for option in &spec.options {
        match option {
            LinkProbeOption::Latency => readings.latency_ms = Some(stats.latency_ms),
            LinkProbeOption::Jitter => readings.jitter_ms = Some(stats.jitter_ms),
            LinkProbeOption::PacketLoss => {
                readings.packet_loss_pct = Some(stats.packet_loss_pct)
            }
            LinkProbeOption::Bandwidth => {}
        }
    }
}

/// Parse iputils `ping -q` statistics: the "N% packet loss" summary line
/// and the `rtt min/avg/max/mdev` line. The mdev field stands in for
/// jitter.
pub fn parse_ping_output(output: &str) -> Option<PingStats> {
    let loss_line = output.lines().find(|l| l.contains("packet loss"))?;
    let packet_loss_pct = loss_line
        .split(',')
        .find(|part| part.contains('%'))?
        .trim()
        .split('%')
        .next()?
        .parse::<f64>()
        .ok()?;

    let rtt_line = output
        .lines()
        .find(|l| l.contains("min/avg/max"))?;
    let values: Vec<f64> = rtt_line
        .split('=')
        .nth(1)?
        .trim()
        .split_whitespace()
        .next()?
        .split('/')
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() != 4 {
        return None;
    }

    Some(PingStats {
        latency_ms: values[1],
        jitter_ms: values[3],
        packet_loss_pct,
    })
}

/// Pull the requested readings out of iperf3's `--json` report: TCP runs
/// carry bandwidth under `end.sum_sent`, UDP runs carry jitter and loss
/// under `end.sum`.
fn apply_iperf(spec: &IperfSpec, report: &serde_json::Value, readings: &mut LinkReadings) {
    if report.get("error").is_some() {
        tracing::warn!(server = %spec.server, "iperf3 reported an error");
        return;
    }
    let end = &report["end"];

    for option in &spec.options {
        match option {
            LinkProbeOption::Bandwidth => {
                if let Some(bps) = end["sum_sent"]["bits_per_second"].as_f64() {
                    readings.bandwidth_mbps = Some(bps / 1_000_000.0);
                }
            }
            LinkProbeOption::Jitter if spec.udp => {
                if let Some(jitter) = end["sum"]["jitter_ms"].as_f64() {
                    readings.jitter_ms = Some(jitter);
                }
            }
            LinkProbeOption::PacketLoss if spec.udp => {
                if let Some(lost) = end["sum"]["lost_percent"].as_f64() {
                    readings.packet_loss_pct = Some(lost);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PING_OUTPUT: &str = "\
PING 10.0.0.1 (10.0.0.1) 56(84) bytes of data.

--- 10.0.0.1 ping statistics ---
5 packets transmitted, 4 received, 20% packet loss, time 4006ms
rtt min/avg/max/mdev = 9.543/11.024/12.832/1.131 ms
";

    #[test]
    fn parses_ping_statistics() {
        let stats = parse_ping_output(PING_OUTPUT).unwrap();
        assert_eq!(stats.latency_ms, 11.024);
        assert_eq!(stats.jitter_ms, 1.131);
        assert_eq!(stats.packet_loss_pct, 20.0);
    }

    #[test]
    fn rejects_truncated_ping_output() {
        assert!(parse_ping_output("PING 10.0.0.1\n").is_none());
        assert!(parse_ping_output("").is_none());
    }

    #[test]
    fn ping_options_filter_readings() {
        let spec = PingSpec {
            destination: "10.0.0.1".into(),
            packet_count: 5,
            options: vec![LinkProbeOption::Latency],
        };
        let mut readings = LinkReadings::default();
        apply_ping(
            &spec,
            PingStats {
                latency_ms: 10.0,
                jitter_ms: 2.0,
                packet_loss_pct: 1.0,
            },
            &mut readings,
        );
        assert_eq!(readings.latency_ms, Some(10.0));
        assert_eq!(readings.jitter_ms, None);
        assert_eq!(readings.packet_loss_pct, None);
    }

    #[test]
    fn iperf_tcp_bandwidth() {
        let spec = IperfSpec {
            server: "10.0.0.2".into(),
            port: 5201,
            duration: 5,
            udp: false,
            options: vec![LinkProbeOption::Bandwidth],
        };
        let report = serde_json::json!({
            "end": { "sum_sent": { "bits_per_second": 94_370_000.0 } }
        });
        let mut readings = LinkReadings::default();
        apply_iperf(&spec, &report, &mut readings);
        assert_eq!(readings.bandwidth_mbps, Some(94.37));
    }

    #[test]
    fn iperf_udp_jitter_and_loss() {
        let spec = IperfSpec {
            server: "10.0.0.2".into(),
            port: 5201,
            duration: 5,
            udp: true,
            options: vec![LinkProbeOption::Jitter, LinkProbeOption::PacketLoss],
        };
        let report = serde_json::json!({
            "end": { "sum": { "jitter_ms": 0.085, "lost_percent": 1.25 } }
        });
        let mut readings = LinkReadings::default();
        apply_iperf(&spec, &report, &mut readings);
        assert_eq!(readings.jitter_ms, Some(0.085));
        assert_eq!(readings.packet_loss_pct, Some(1.25));
        assert_eq!(readings.bandwidth_mbps, None);
    }

    #[test]
    fn iperf_error_report_yields_nothing() {
        let spec = IperfSpec {
            server: "10.0.0.2".into(),
            port: 5201,
            duration: 5,
            udp: false,
            options: vec![LinkProbeOption::Bandwidth],
        };
        let report = serde_json::json!({ "error": "unable to connect" });
        let mut readings = LinkReadings::default();
        apply_iperf(&spec, &report, &mut readings);
        assert_eq!(readings, LinkReadings::default());
    }

    #[test]
    fn simulated_collector_honors_selection() {
        let collector = Collector::new(true);
        let readings = collector.device(&DeviceMetricsSpec {
            cpu_usage: true,
            ram_usage: false,
            interface_stats: vec!["eth0".into()],
        });
        let cpu = readings.cpu_usage.unwrap();
        assert!((0.0..=1.0).contains(&cpu));
        assert!(readings.ram_usage.is_none());
        assert!(readings.interface_stats.contains_key("eth0"));
    }
}
