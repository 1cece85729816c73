// src/core/metrics/processes.rs

//! Process-level monitoring behind the `/api/processes` surface: top-N
//! listings, per-pid details, kill with TERM-then-KILL escalation, bounded
//! in-memory history, and process trees.

use super::snapshot::round2;
use crate::core::errors::AgentError;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, Signal, System, Users};

/// Snapshots retained per pid.
const HISTORY_SIZE: usize = 1000;

/// History for pids not seen for this long is discarded.
const HISTORY_MAX_AGE_HOURS: i64 = 48;

/// How long a terminated process is given to exit before escalation.
const KILL_WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub username: Option<String>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_mb: f64,
    pub status: String,
    pub started_at: Option<String>,
    pub cmdline: String,
    pub num_threads: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPoint {
    pub timestamp: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSort {
    Cpu,
    Memory,
}

/// Monitors and manages host processes. The `sysinfo` handle is private to
/// this monitor; callers go through the async API.
#[derive(Debug)]
pub struct ProcessMonitor {
    sys: tokio::sync::Mutex<System>,
    history: Mutex<HashMap<u32, VecDeque<HistoryPoint>>>,
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self {
            sys: tokio::sync::Mutex::new(System::new()),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Lists processes ordered by CPU or memory, capped at `limit`.
    /// Each listing also appends a history point per process.
    pub async fn list(&self, limit: usize, sort: ProcessSort) -> Vec<ProcessInfo> {
        let mut sys = self.sys.lock().await;
        // Two refreshes separated by a short window make cpu_usage meaningful.
        sys.refresh_processes(ProcessesToUpdate::All, true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let users = Users::new_with_refreshed_list();
        let total_memory = {
            sys.refresh_memory();
            sys.total_memory()
        };

        let mut infos: Vec<ProcessInfo> = sys
            .processes()
            .values()
            .map(|process| describe(process, &users, total_memory))
            .collect();

        self.record_history(&infos);
        self.cleanup_old_history();

        match sort {
            ProcessSort::Cpu => infos.sort_by(|a, b| cmp_f64(b.cpu_percent, a.cpu_percent)),
            ProcessSort::Memory => {
                infos.sort_by(|a, b| cmp_f64(b.memory_percent, a.memory_percent))
            }
        }
        infos.truncate(limit);
        infos
    }

    /// Detailed information for one process.
    pub async fn details(&self, pid: u32) -> Result<Value, AgentError> {
        let mut sys = self.sys.lock().await;
        let target = Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        sys.refresh_memory();

        let users = Users::new_with_refreshed_list();
        let total_memory = sys.total_memory();
        let process = sys
            .process(target)
            .ok_or_else(|| AgentError::NotFound(format!("process {pid} not found")))?;

        let info = describe(process, &users, total_memory);
        Ok(json!({
            "success": true,
            "pid": info.pid,
            "name": info.name,
            "username": info.username,
            "cpu_percent": info.cpu_percent,
            "memory_percent": info.memory_percent,
            "memory_mb": info.memory_mb,
            "status": info.status,
            "started_at": info.started_at,
            "cmdline": info.cmdline,
            "num_threads": info.num_threads,
            "parent_pid": process.parent().map(|p| p.as_u32()),
        }))
    }

    /// Kills a process: SIGTERM first (unless `force`), escalating to
    /// SIGKILL when the process survives the grace period.
    pub async fn kill(&self, pid: u32, force: bool) -> Result<Value, AgentError> {
        let target = Pid::from_u32(pid);
        let name = {
            let mut sys = self.sys.lock().await;
            sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
            let process = sys
                .process(target)
                .ok_or_else(|| AgentError::NotFound("process not found or already terminated".to_string()))?;
            let name = process.name().to_string_lossy().to_string();
            let signalled = if force {
                process.kill()
            } else {
                process.kill_with(Signal::Term).unwrap_or_else(|| process.kill())
            };
            if !signalled {
                return Err(AgentError::InvalidRequest(
                    "permission denied - insufficient privileges".to_string(),
                ));
            }
            name
        };

        let mut forced = force;
        if !self.wait_for_exit(target, KILL_WAIT).await {
            // TERM did not take; escalate.
            let mut sys = self.sys.lock().await;
            sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
            if let Some(process) = sys.process(target) {
                process.kill();
                forced = true;
            }
        }

        tracing::info!(
            "terminated process {name} (pid {pid}, forced={forced})"
        );
        Ok(json!({
            "success": true,
            "message": format!("Process {name} (PID: {pid}) terminated"),
            "pid": pid,
            "name": name,
            "forced": forced,
        }))
    }

    async fn wait_for_exit(&self, target: Pid, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            tokio::time::sleep(Duration::from_millis(200)).await;
            {
                let mut sys = self.sys.lock().await;
                sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
                if sys.process(target).is_none() {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// Historical metrics for one pid within the given hour window.
    pub fn history(&self, pid: u32, hours: i64) -> Value {
        let history = self.history.lock();
        let Some(points) = history.get(&pid) else {
            return json!({
                "pid": pid,
                "history": [],
                "message": "No history available for this process",
            });
        };

        let cutoff = Utc::now() - TimeDelta::hours(hours);
        let filtered: Vec<&HistoryPoint> = points
            .iter()
            .filter(|p| after(&p.timestamp, cutoff))
            .collect();

        let statistics = if filtered.is_empty() {
            Value::Null
        } else {
            let cpu: Vec<f64> = filtered.iter().map(|p| p.cpu_percent).collect();
            let mem: Vec<f64> = filtered.iter().map(|p| p.memory_percent).collect();
            json!({
                "avg_cpu": round2(cpu.iter().sum::<f64>() / cpu.len() as f64),
                "max_cpu": round2(cpu.iter().cloned().fold(f64::MIN, f64::max)),
                "avg_memory": round2(mem.iter().sum::<f64>() / mem.len() as f64),
                "max_memory": round2(mem.iter().cloned().fold(f64::MIN, f64::max)),
            })
        };

        json!({
            "pid": pid,
            "hours": hours,
            "history": filtered,
            "statistics": statistics,
            "data_points": filtered.len(),
        })
    }

    /// Parent and recursive children of one process.
    pub async fn tree(&self, pid: u32) -> Result<Value, AgentError> {
        let mut sys = self.sys.lock().await;
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let target = Pid::from_u32(pid);
        let process = sys
            .process(target)
            .ok_or_else(|| AgentError::NotFound(format!("process {pid} not found")))?;

        let parent = process.parent().and_then(|ppid| {
            sys.process(ppid).map(|p| {
                json!({
                    "pid": ppid.as_u32(),
                    "name": p.name().to_string_lossy(),
                    "status": p.status().to_string(),
                })
            })
        });

        let mut children = Vec::new();
        collect_children(&sys, target, &mut children);

        Ok(json!({
            "success": true,
            "pid": pid,
            "name": process.name().to_string_lossy(),
            "parent": parent,
            "children": children,
            "total_children": children.len(),
        }))
    }

    fn record_history(&self, infos: &[ProcessInfo]) {
        let now = Utc::now().to_rfc3339();
        let mut history = self.history.lock();
        for info in infos {
            let points = history.entry(info.pid).or_default();
            points.push_back(HistoryPoint {
                timestamp: now.clone(),
                cpu_percent: info.cpu_percent,
                memory_percent: info.memory_percent,
                memory_mb: info.memory_mb,
            });
            while points.len() > HISTORY_SIZE {
                points.pop_front();
            }
        }
    }

    fn cleanup_old_history(&self) {
        let cutoff = Utc::now() - TimeDelta::hours(HISTORY_MAX_AGE_HOURS);
        let mut history = self.history.lock();
        history.retain(|_, points| {
            while points
                .front()
                .map(|p| !after(&p.timestamp, cutoff))
                .unwrap_or(false)
            {
                points.pop_front();
            }
            !points.is_empty()
        });
    }
}

fn describe(process: &sysinfo::Process, users: &Users, total_memory: u64) -> ProcessInfo {
    let memory = process.memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        round2(memory as f64 / total_memory as f64 * 100.0)
    };
    ProcessInfo {
        pid: process.pid().as_u32(),
        name: process.name().to_string_lossy().to_string(),
        username: process
            .user_id()
            .and_then(|uid| users.get_user_by_id(uid))
            .map(|user| user.name().to_string()),
        cpu_percent: round2(process.cpu_usage() as f64),
        memory_percent,
        memory_mb: round2(memory as f64 / (1024.0 * 1024.0)),
        status: process.status().to_string(),
        started_at: start_time_rfc3339(process.start_time()),
        cmdline: cmdline(process),
        num_threads: process.tasks().map(|tasks| tasks.len()),
    }
}

fn cmdline(process: &sysinfo::Process) -> String {
    let cmd = process
        .cmd()
        .iter()
        .map(|part| part.to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(" ");
    if cmd.is_empty() {
        process.name().to_string_lossy().to_string()
    } else {
        cmd
    }
}

fn start_time_rfc3339(epoch_secs: u64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(epoch_secs as i64, 0).map(|t| t.to_rfc3339())
}

fn collect_children(sys: &System, parent: Pid, out: &mut Vec<Value>) {
    for (pid, process) in sys.processes() {
        if process.parent() == Some(parent) {
            out.push(json!({
                "pid": pid.as_u32(),
                "name": process.name().to_string_lossy(),
                "status": process.status().to_string(),
                "memory_mb": round2(process.memory() as f64 / (1024.0 * 1024.0)),
            }));
            collect_children(sys, *pid, out);
        }
    }
}

fn after(timestamp: &str, cutoff: DateTime<Utc>) -> bool {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|t| t.with_timezone(&Utc) > cutoff)
        .unwrap_or(false)
}

fn cmp_f64(a: f64, b: f64) -> std::cmp::Ordering {
    a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
}
