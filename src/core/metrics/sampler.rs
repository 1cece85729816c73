// src/core/metrics/sampler.rs

//! Produces `MetricSnapshot`s from the host via `sysinfo`.
//!
//! The sampler owns the `sysinfo` handles and the baseline counters used to
//! derive rates. Rates require a prior sample with a strictly earlier
//! timestamp; the first sample reports zero for every rate field.

use super::snapshot::*;
use std::time::{Duration, Instant};
use sysinfo::{Disks, Networks, ProcessesToUpdate, System};

/// The blocking window between the two CPU refreshes of a sample.
const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(100);

/// Counter totals captured at the previous sample, for rate derivation.
#[derive(Debug, Clone, Copy)]
struct RateBaseline {
    at: Instant,
    disk_read_bytes: u64,
    disk_written_bytes: u64,
    net_recv_bytes: u64,
    net_sent_bytes: u64,
}

#[derive(Debug)]
pub struct MetricSampler {
    sys: System,
    baseline: Option<RateBaseline>,
}

impl Default for MetricSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSampler {
    pub fn new() -> Self {
        Self {
            sys: System::new(),
            baseline: None,
        }
    }

    /// Collects one snapshot. Blocks (asynchronously) for the CPU sampling
    /// window; everything else reads current kernel counters.
    pub async fn sample(&mut self, node_id: &str, machine_id: &str) -> MetricSnapshot {
        let cpu = self.collect_cpu().await;
        let memory = self.collect_memory();

        let disks = Disks::new_with_refreshed_list();
        let networks = Networks::new_with_refreshed_list();
        let now = Instant::now();

        let disk = self.collect_disk(&disks, now);
        let network = self.collect_network(&networks, now);
        let processes = self.collect_processes();

        self.baseline = Some(RateBaseline {
            at: now,
            disk_read_bytes: total_disk_read(&disks),
            disk_written_bytes: total_disk_written(&disks),
            net_recv_bytes: total_net_recv(&networks),
            net_sent_bytes: total_net_sent(&networks),
        });

        MetricSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            node_id: node_id.to_string(),
            machine_id: machine_id.to_string(),
            metrics: MetricSet {
                cpu,
                memory,
                disk,
                network,
                processes,
                uptime_seconds: System::uptime(),
            },
        }
    }

    async fn collect_cpu(&mut self) -> CpuMetrics {
        self.sys.refresh_cpu_usage();
        tokio::time::sleep(CPU_SAMPLE_WINDOW).await;
        self.sys.refresh_cpu_usage();

        let load = System::load_average();
        CpuMetrics {
            cpu_usage_percent: round2(self.sys.global_cpu_usage() as f64),
            cpu_per_core_percent: self
                .sys
                .cpus()
                .iter()
                .map(|cpu| round2(cpu.cpu_usage() as f64))
                .collect(),
            load_avg_1min: load.one,
            load_avg_5min: load.five,
            load_avg_15min: load.fifteen,
        }
    }

    fn collect_memory(&mut self) -> MemoryMetrics {
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        let used = self.sys.used_memory();
        let swap_total = self.sys.total_swap();
        let swap_used = self.sys.used_swap();
        MemoryMetrics {
            memory_total_gb: bytes_to_gb(total),
            memory_used_gb: bytes_to_gb(used),
            memory_available_gb: bytes_to_gb(self.sys.available_memory()),
            memory_usage_percent: percent(used, total),
            swap_total_gb: bytes_to_gb(swap_total),
            swap_used_gb: bytes_to_gb(swap_used),
            swap_usage_percent: percent(swap_used, swap_total),
        }
    }

    fn collect_disk(&self, disks: &Disks, now: Instant) -> DiskMetrics {
        let mut disk_usage = indexmap::IndexMap::new();
        for disk in disks.list() {
            let total = disk.total_space();
            // Pseudo filesystems and mounts we cannot stat report zero space.
            if total == 0 {
                continue;
            }
            let free = disk.available_space();
            let used = total.saturating_sub(free);
            disk_usage.insert(
                disk.mount_point().to_string_lossy().to_string(),
                MountUsage {
                    total_gb: bytes_to_gb(total),
                    used_gb: bytes_to_gb(used),
                    free_gb: bytes_to_gb(free),
                    usage_percent: percent(used, total),
                },
            );
        }

        let disk_io = match self.baseline {
            Some(prior) => {
                let delta = now.saturating_duration_since(prior.at).as_secs_f64();
                if delta > 0.0 {
                    DiskIoRates {
                        read_mb_per_sec: rate_mb(
                            total_disk_read(disks).saturating_sub(prior.disk_read_bytes),
                            delta,
                        ),
                        write_mb_per_sec: rate_mb(
                            total_disk_written(disks).saturating_sub(prior.disk_written_bytes),
                            delta,
                        ),
                    }
                } else {
                    DiskIoRates {
                        read_mb_per_sec: 0.0,
                        write_mb_per_sec: 0.0,
                    }
                }
            }
            None => DiskIoRates {
                read_mb_per_sec: 0.0,
                write_mb_per_sec: 0.0,
            },
        };

        DiskMetrics {
            disk_usage,
            disk_io,
        }
    }

    fn collect_network(&self, networks: &Networks, now: Instant) -> NetworkMetrics {
        let recv_total = total_net_recv(networks);
        let sent_total = total_net_sent(networks);
        let (recv_rate, sent_rate) = match self.baseline {
            Some(prior) => {
                let delta = now.saturating_duration_since(prior.at).as_secs_f64();
                if delta > 0.0 {
                    (
                        rate_mb(recv_total.saturating_sub(prior.net_recv_bytes), delta),
                        rate_mb(sent_total.saturating_sub(prior.net_sent_bytes), delta),
                    )
                } else {
                    (0.0, 0.0)
                }
            }
            None => (0.0, 0.0),
        };

        let (packets_recv, packets_sent) = networks.iter().fold((0u64, 0u64), |acc, (_, data)| {
            (
                acc.0 + data.total_packets_received(),
                acc.1 + data.total_packets_transmitted(),
            )
        });

        NetworkMetrics {
            bytes_sent_mb_per_sec: sent_rate,
            bytes_recv_mb_per_sec: recv_rate,
            bytes_sent_total: sent_total,
            bytes_recv_total: recv_total,
            packets_sent,
            packets_recv,
            active_connections: active_connection_count(),
        }
    }

    fn collect_processes(&mut self) -> ProcessSummary {
        self.sys.refresh_processes(ProcessesToUpdate::All, true);
        let total_memory = self.sys.total_memory();
        let mut top: Vec<TopProcess> = self
            .sys
            .processes()
            .values()
            .map(|process| TopProcess {
                pid: process.pid().as_u32(),
                name: process.name().to_string_lossy().to_string(),
                memory_percent: round2(percent(process.memory(), total_memory)),
            })
            .collect();
        let process_count = top.len() as u64;
        top.sort_by(|a, b| {
            b.memory_percent
                .partial_cmp(&a.memory_percent)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        top.truncate(5);
        ProcessSummary {
            process_count,
            top_memory_processes: top,
        }
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round2(part as f64 / whole as f64 * 100.0)
    }
}

fn rate_mb(bytes: u64, delta_secs: f64) -> f64 {
    round2(bytes as f64 / (1024.0 * 1024.0) / delta_secs)
}

fn total_disk_read(disks: &Disks) -> u64 {
    disks.list().iter().map(|d| d.usage().total_read_bytes).sum()
}

fn total_disk_written(disks: &Disks) -> u64 {
    disks
        .list()
        .iter()
        .map(|d| d.usage().total_written_bytes)
        .sum()
}

fn total_net_recv(networks: &Networks) -> u64 {
    networks.iter().map(|(_, data)| data.total_received()).sum()
}

fn total_net_sent(networks: &Networks) -> u64 {
    networks
        .iter()
        .map(|(_, data)| data.total_transmitted())
        .sum()
}

// Connection counting reads the kernel's TCP tables directly; platforms
// without procfs report zero.
#[cfg(target_os = "linux")]
fn active_connection_count() -> u64 {
    ["/proc/net/tcp", "/proc/net/tcp6"]
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .map(|contents| contents.lines().count().saturating_sub(1) as u64)
        .sum()
}

#[cfg(not(target_os = "linux"))]
fn active_connection_count() -> u64 {
    0
}
