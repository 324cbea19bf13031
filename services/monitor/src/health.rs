//! Process resource sampling for the watchdog.

use crate::config::WatchdogConfig;
use serde::Serialize;
use std::fmt;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Resource usage of this process at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthSample {
    /// Resident set size in bytes
    pub memory_bytes: u64,
    /// CPU usage in percent of one core
    pub cpu_percent: f32,
}

/// Source of health samples.
pub trait HealthSampler: Send {
    /// Returns `None` when the process could not be inspected.
    fn sample(&mut self) -> Option<HealthSample>;
}

/// Samples the current process with `sysinfo`.
pub struct ProcessSampler {
    system: System,
    pid: Option<Pid>,
}

impl fmt::Debug for ProcessSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSampler")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = %e, "Cannot determine own pid, health sampling disabled");
                None
            }
        };

        let mut system = System::new();
        // CPU usage is a delta between refreshes; prime the first one
        if let Some(pid) = pid {
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        }

        Self { system, pid }
    }
}

impl HealthSampler for ProcessSampler {
    fn sample(&mut self) -> Option<HealthSample> {
        let pid = self.pid?;
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.system.process(pid).map(|process| HealthSample {
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
        })
    }
}

/// Ceilings a sample is checked against.
#[derive(Debug, Clone, Copy)]
pub struct HealthLimits {
    pub max_memory_bytes: u64,
    pub max_cpu_percent: f32,
    /// Consecutive breaching samples before the process counts as unhealthy
    pub breach_samples: u32,
}

impl HealthLimits {
    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self {
            max_memory_bytes: config.max_memory_mb.saturating_mul(1024 * 1024),
            max_cpu_percent: config.max_cpu_percent,
            breach_samples: config.breach_samples.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthVerdict {
    Healthy,
    /// Over a ceiling, but not for long enough yet
    Breaching { consecutive: u32, reason: String },
    Unhealthy { reason: String },
}

/// Tracks sustained breaches across samples.
#[derive(Debug)]
pub struct HealthMonitor {
    limits: HealthLimits,
    consecutive: u32,
    last: Option<HealthSample>,
}

impl HealthMonitor {
    pub fn new(limits: HealthLimits) -> Self {
        Self {
            limits,
            consecutive: 0,
            last: None,
        }
    }

    pub fn last_sample(&self) -> Option<HealthSample> {
        self.last
    }

    /// Forget accumulated breaches, e.g. after a restart.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn observe(&mut self, sample: HealthSample) -> HealthVerdict {
        self.last = Some(sample);

        let reason = if sample.memory_bytes > self.limits.max_memory_bytes {
            Some(format!(
                "memory {} MiB over limit {} MiB",
                sample.memory_bytes / (1024 * 1024),
                self.limits.max_memory_bytes / (1024 * 1024)
            ))
        } else if sample.cpu_percent > self.limits.max_cpu_percent {
            Some(format!(
                "cpu {:.1}% over limit {:.1}%",
                sample.cpu_percent, self.limits.max_cpu_percent
            ))
        } else {
            None
        };

        let Some(reason) = reason else {
            if self.consecutive > 0 {
                debug!(previous_breaches = self.consecutive, "Resource usage back under limits");
            }
            self.consecutive = 0;
            return HealthVerdict::Healthy;
        };

        self.consecutive += 1;
        if self.consecutive >= self.limits.breach_samples {
            self.consecutive = 0;
            HealthVerdict::Unhealthy { reason }
        } else {
            HealthVerdict::Breaching {
                consecutive: self.consecutive,
                reason,
            }
        }
    }
}
