// Host resource sampling backed by sysinfo

use crate::utils::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use sysinfo::{CpuExt, DiskExt, NetworkExt, System, SystemExt};
use tokio::sync::Mutex;
use tracing::debug;

/// Host resource usage, all values in percent (0-100)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub network_percent: f64,
}

/// Source of host resource usage
#[async_trait::async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn sample(&self) -> Result<ResourceUsage>;
}

struct ProbeState {
    system: System,
    last_network_refresh: Instant,
}

/// Resource probe reading the local host through sysinfo.
///
/// CPU and network figures are deltas between consecutive samples, so the
/// first sample after construction reports them against the construction
/// time.
pub struct SysinfoProbe {
    state: Mutex<ProbeState>,
    network_capacity_bytes_per_sec: u64,
}

impl SysinfoProbe {
    pub fn new(network_capacity_bytes_per_sec: u64) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_disks_list();
        system.refresh_networks_list();

        Self {
            state: Mutex::new(ProbeState {
                system,
                last_network_refresh: Instant::now(),
            }),
            network_capacity_bytes_per_sec,
        }
    }
}

#[async_trait::async_trait]
impl ResourceProbe for SysinfoProbe {
    async fn sample(&self) -> Result<ResourceUsage> {
        let mut state = self.state.lock().await;
        let ProbeState {
            system,
            last_network_refresh,
        } = &mut *state;

        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_disks();
        system.refresh_networks();

        let cpus = system.cpus();
        let cpu_percent = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|c| f64::from(c.cpu_usage())).sum::<f64>() / cpus.len() as f64
        };

        let total_memory = system.total_memory();
        let memory_percent = if total_memory > 0 {
            (system.used_memory() as f64 / total_memory as f64) * 100.0
        } else {
            0.0
        };

        // Most-utilized mount point
        let disk_percent = system
            .disks()
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                let used = d.total_space().saturating_sub(d.available_space());
                (used as f64 / d.total_space() as f64) * 100.0
            })
            .fold(0.0, f64::max);

        let elapsed = last_network_refresh.elapsed().as_secs_f64();
        *last_network_refresh = Instant::now();
        let bytes: u64 = system
            .networks()
            .into_iter()
            .map(|(_, data)| data.received() + data.transmitted())
            .sum();
        let network_percent = if elapsed > 0.0 && self.network_capacity_bytes_per_sec > 0 {
            ((bytes as f64 / elapsed) / self.network_capacity_bytes_per_sec as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        let usage = ResourceUsage {
            cpu_percent: cpu_percent.clamp(0.0, 100.0),
            memory_percent: memory_percent.clamp(0.0, 100.0),
            disk_percent,
            network_percent,
        };
        debug!(?usage, "Sampled host resources");
        Ok(usage)
    }
}
