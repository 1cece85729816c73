// src/core/metrics/snapshot.rs

//! The canonical host-resource sample and its wire form.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Value, json};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One immutable host-resource sample.
///
/// Rate fields (network, disk I/O) are zero on the first sample; afterwards
/// they are `(current - prior) / Δt` against the previous sample.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSnapshot {
    pub timestamp: String,
    pub node_id: String,
    pub machine_id: String,
    pub metrics: MetricSet,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSet {
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub network: NetworkMetrics,
    pub processes: ProcessSummary,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuMetrics {
    pub cpu_usage_percent: f64,
    pub cpu_per_core_percent: Vec<f64>,
    pub load_avg_1min: f64,
    pub load_avg_5min: f64,
    pub load_avg_15min: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryMetrics {
    pub memory_total_gb: f64,
    pub memory_used_gb: f64,
    pub memory_available_gb: f64,
    pub memory_usage_percent: f64,
    pub swap_total_gb: f64,
    pub swap_used_gb: f64,
    pub swap_usage_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MountUsage {
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskIoRates {
    pub read_mb_per_sec: f64,
    pub write_mb_per_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskMetrics {
    pub disk_usage: IndexMap<String, MountUsage>,
    pub disk_io: DiskIoRates,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkMetrics {
    pub bytes_sent_mb_per_sec: f64,
    pub bytes_recv_mb_per_sec: f64,
    pub bytes_sent_total: u64,
    pub bytes_recv_total: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub active_connections: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopProcess {
    pub pid: u32,
    pub name: String,
    pub memory_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub process_count: u64,
    pub top_memory_processes: Vec<TopProcess>,
}

impl MetricSnapshot {
    /// The primary mount's usage: `/` when present, otherwise the first mount.
    pub fn primary_disk(&self) -> Option<&MountUsage> {
        self.metrics
            .disk
            .disk_usage
            .get("/")
            .or_else(|| self.metrics.disk.disk_usage.values().next())
    }

    /// Flattens the snapshot into the canonical POST body for the backend.
    pub fn to_wire(&self) -> Value {
        let primary = self.primary_disk();
        json!({
            "machine_id": self.machine_id,
            "timestamp": self.timestamp,
            "cpu_percent": self.metrics.cpu.cpu_usage_percent,
            "memory_percent": self.metrics.memory.memory_usage_percent,
            "memory_used_mb": (self.metrics.memory.memory_used_gb * 1024.0) as u64,
            "memory_total_mb": (self.metrics.memory.memory_total_gb * 1024.0) as u64,
            "disk_percent": primary.map(|d| d.usage_percent).unwrap_or(0.0),
            "disk_used_gb": primary.map(|d| d.used_gb).unwrap_or(0.0),
            "disk_total_gb": primary.map(|d| d.total_gb).unwrap_or(0.0),
            "network_rx_bytes": self.metrics.network.bytes_recv_total,
            "network_tx_bytes": self.metrics.network.bytes_sent_total,
            "network_rx_rate_mbps": self.metrics.network.bytes_recv_mb_per_sec,
            "network_tx_rate_mbps": self.metrics.network.bytes_sent_mb_per_sec,
            "uptime_seconds": self.metrics.uptime_seconds,
            "process_count": self.metrics.processes.process_count,
            "active_connections": self.metrics.network.active_connections,
            "load_avg_1m": self.metrics.cpu.load_avg_1min,
            "load_avg_5m": self.metrics.cpu.load_avg_5min,
            "load_avg_15m": self.metrics.cpu.load_avg_15min,
        })
    }
}

pub fn bytes_to_gb(bytes: u64) -> f64 {
    round2(bytes as f64 / GIB)
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
