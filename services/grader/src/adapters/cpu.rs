//! Host CPU utilization read through `sysinfo`.

use async_trait::async_trait;
use grading_core::ports::SystemMetrics;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use sysinfo::{CpuRefreshKind, RefreshKind, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tracing::warn;

struct Sampler {
    system: System,
    refreshed_at: Instant,
    last_usage: Option<f64>,
}

/// Global CPU usage between two consecutive refreshes of a long-lived [`System`].
///
/// `sysinfo` needs two readings to compute usage, so the system is refreshed once at
/// construction. Queries arriving faster than [`MINIMUM_CPU_UPDATE_INTERVAL`] reuse the
/// previous value instead of producing a meaningless delta.
pub struct HostMetrics {
    sampler: Mutex<Sampler>,
}

impl HostMetrics {
    pub fn new() -> Self {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            warn!("CPU usage is not available on this platform; admission will wait for it.");
        }
        let system = System::new_with_specifics(
            RefreshKind::new().with_cpu(CpuRefreshKind::new().with_cpu_usage()),
        );
        Self {
            sampler: Mutex::new(Sampler {
                system,
                refreshed_at: Instant::now(),
                last_usage: None,
            }),
        }
    }
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemMetrics for HostMetrics {
    async fn cpu_usage(&self) -> Option<f64> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return None;
        }
        let mut sampler = self.sampler.lock().unwrap_or_else(PoisonError::into_inner);
        if sampler.refreshed_at.elapsed() < MINIMUM_CPU_UPDATE_INTERVAL {
            return sampler.last_usage;
        }

        sampler.system.refresh_cpu_usage();
        sampler.refreshed_at = Instant::now();
        let usage = f64::from(sampler.system.global_cpu_usage()) / 100.0;
        sampler.last_usage = usage.is_finite().then(|| usage.clamp(0.0, 1.0));
        sampler.last_usage
    }
}
