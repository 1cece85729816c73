use indexmap::IndexMap;
use vigild::core::metrics::MetricSampler;
use vigild::core::metrics::snapshot::*;

fn sample_snapshot() -> MetricSnapshot {
    let mut disk_usage = IndexMap::new();
    disk_usage.insert(
        "/data".to_string(),
        MountUsage {
            total_gb: 500.0,
            used_gb: 100.0,
            free_gb: 400.0,
            usage_percent: 20.0,
        },
    );
    disk_usage.insert(
        "/".to_string(),
        MountUsage {
            total_gb: 100.0,
            used_gb: 42.0,
            free_gb: 58.0,
            usage_percent: 42.0,
        },
    );
    MetricSnapshot {
        timestamp: "2024-01-01T10:00:00Z".to_string(),
        node_id: "10.0.0.1".to_string(),
        machine_id: "machine-uuid".to_string(),
        metrics: MetricSet {
            cpu: CpuMetrics {
                cpu_usage_percent: 37.5,
                cpu_per_core_percent: vec![30.0, 45.0],
                load_avg_1min: 1.0,
                load_avg_5min: 0.8,
                load_avg_15min: 0.5,
            },
            memory: MemoryMetrics {
                memory_total_gb: 16.0,
                memory_used_gb: 8.0,
                memory_available_gb: 8.0,
                memory_usage_percent: 50.0,
                swap_total_gb: 2.0,
                swap_used_gb: 0.5,
                swap_usage_percent: 25.0,
            },
            disk: DiskMetrics {
                disk_usage,
                disk_io: DiskIoRates {
                    read_mb_per_sec: 1.5,
                    write_mb_per_sec: 0.5,
                },
            },
            network: NetworkMetrics {
                bytes_sent_mb_per_sec: 0.25,
                bytes_recv_mb_per_sec: 0.75,
                bytes_sent_total: 1_000_000,
                bytes_recv_total: 2_000_000,
                packets_sent: 900,
                packets_recv: 1800,
                active_connections: 12,
            },
            processes: ProcessSummary {
                process_count: 321,
                top_memory_processes: vec![TopProcess {
                    pid: 42,
                    name: "postgres".to_string(),
                    memory_percent: 12.5,
                }],
            },
            uptime_seconds: 86_400,
        },
    }
}

#[test]
fn test_primary_disk_prefers_root() {
    let snapshot = sample_snapshot();
    let primary = snapshot.primary_disk().unwrap();
    assert_eq!(primary.usage_percent, 42.0);
}

#[test]
fn test_wire_form_flattening() {
    let snapshot = sample_snapshot();
    let wire = snapshot.to_wire();

    assert_eq!(wire["machine_id"], "machine-uuid");
    assert_eq!(wire["timestamp"], "2024-01-01T10:00:00Z");
    assert_eq!(wire["cpu_percent"], 37.5);
    assert_eq!(wire["memory_percent"], 50.0);
    assert_eq!(wire["memory_used_mb"], 8192);
    assert_eq!(wire["memory_total_mb"], 16384);
    assert_eq!(wire["disk_percent"], 42.0);
    assert_eq!(wire["disk_used_gb"], 42.0);
    assert_eq!(wire["disk_total_gb"], 100.0);
    assert_eq!(wire["network_rx_bytes"], 2_000_000);
    assert_eq!(wire["network_tx_bytes"], 1_000_000);
    assert_eq!(wire["network_rx_rate_mbps"], 0.75);
    assert_eq!(wire["network_tx_rate_mbps"], 0.25);
    assert_eq!(wire["uptime_seconds"], 86_400);
    assert_eq!(wire["process_count"], 321);
    assert_eq!(wire["load_avg_1m"], 1.0);
}

#[test]
fn test_wire_form_without_mounts() {
    let mut snapshot = sample_snapshot();
    snapshot.metrics.disk.disk_usage.clear();
    let wire = snapshot.to_wire();
    assert_eq!(wire["disk_percent"], 0.0);
    assert_eq!(wire["disk_total_gb"], 0.0);
}

#[tokio::test]
async fn test_first_sample_has_zero_rates() {
    let mut sampler = MetricSampler::new();
    let snapshot = sampler.sample("node-a", "machine-a").await;

    assert_eq!(snapshot.metrics.disk.disk_io.read_mb_per_sec, 0.0);
    assert_eq!(snapshot.metrics.disk.disk_io.write_mb_per_sec, 0.0);
    assert_eq!(snapshot.metrics.network.bytes_sent_mb_per_sec, 0.0);
    assert_eq!(snapshot.metrics.network.bytes_recv_mb_per_sec, 0.0);
}

#[tokio::test]
async fn test_snapshot_shape() {
    let mut sampler = MetricSampler::new();
    let snapshot = sampler.sample("node-a", "machine-a").await;

    assert_eq!(snapshot.node_id, "node-a");
    assert_eq!(snapshot.machine_id, "machine-a");
    assert!(chrono::DateTime::parse_from_rfc3339(&snapshot.timestamp).is_ok());
    assert!(snapshot.metrics.processes.process_count > 0);
    assert!(snapshot.metrics.processes.top_memory_processes.len() <= 5);
    assert!(snapshot.metrics.memory.memory_total_gb > 0.0);

    // The second sample has a prior baseline; rates are derivable and
    // non-negative.
    let second = sampler.sample("node-a", "machine-a").await;
    assert!(second.metrics.network.bytes_recv_mb_per_sec >= 0.0);
    assert!(second.metrics.disk.disk_io.read_mb_per_sec >= 0.0);
}
