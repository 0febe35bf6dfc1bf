//! Run-wide safety thresholds.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use sysinfo::System;
use tokio::time::Instant;
use tracing::error;

use crate::controls::AugmentControls;

/// Sliding window over which failed calls are counted.
pub const FAILURE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Source of resource pressure readings.
pub trait ResourceProbe {
    /// Used memory as a percentage of total, when it can be read.
    fn memory_percent(&mut self) -> Option<f32>;
}

/// Reads host memory through `sysinfo`.
pub struct SystemProbe {
    system: System,
}

impl SystemProbe {
    /// Creates a probe without loading anything up front.
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn memory_percent(&mut self) -> Option<f32> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return None;
        }
        Some((self.system.used_memory() as f64 / total as f64 * 100.0) as f32)
    }
}

/// Threshold that tripped.
#[derive(Debug, Clone, PartialEq)]
pub enum SafetyTrip {
    /// Too many failed calls inside [`FAILURE_WINDOW`].
    FailureRate {
        /// Failures inside the window.
        failures: usize,
        /// Configured ceiling.
        limit: usize,
    },
    /// Too many batches ended permanently failed.
    FailedBatches {
        /// Permanently failed batches so far.
        failed: usize,
        /// Configured ceiling.
        limit: usize,
    },
    /// Host memory above the configured ceiling.
    MemoryPressure {
        /// Observed usage.
        percent: f32,
        /// Configured ceiling.
        limit: f32,
    },
}

impl fmt::Display for SafetyTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafetyTrip::FailureRate { failures, limit } => {
                write!(f, "{failures} failed calls in the last hour (limit {limit})")
            }
            SafetyTrip::FailedBatches { failed, limit } => {
                write!(f, "{failed} permanently failed batches (limit {limit})")
            }
            SafetyTrip::MemoryPressure { percent, limit } => {
                write!(f, "memory usage {percent:.1}% above {limit:.1}%")
            }
        }
    }
}

/// Observes failures and resource pressure across the whole run.
pub struct SafetyMonitor {
    max_fails_per_hour: usize,
    failed_batch_ceiling: usize,
    memory_ceiling_percent: f32,
    recent_failures: VecDeque<Instant>,
    failed_batches: usize,
    probe: Box<dyn ResourceProbe>,
}

impl SafetyMonitor {
    /// Monitor reading host memory through [`SystemProbe`].
    pub fn new(controls: &AugmentControls) -> Self {
        Self::with_probe(controls, Box::new(SystemProbe::new()))
    }

    /// Monitor with a custom resource probe.
    pub fn with_probe(controls: &AugmentControls, probe: Box<dyn ResourceProbe>) -> Self {
        Self {
            max_fails_per_hour: controls.max_fails_per_hour(),
            failed_batch_ceiling: controls.failed_batch_ceiling(),
            memory_ceiling_percent: controls.memory_ceiling_percent(),
            recent_failures: VecDeque::new(),
            failed_batches: 0,
            probe,
        }
    }

    /// Records one failed service call.
    pub fn record_call_failure(&mut self) {
        let now = Instant::now();
        self.recent_failures.push_back(now);
        self.prune(now);
    }

    /// Records one permanently failed batch.
    pub fn record_failed_batch(&mut self) {
        self.failed_batches += 1;
    }

    /// Failed calls inside the window.
    pub fn recent_failures(&mut self) -> usize {
        self.prune(Instant::now());
        self.recent_failures.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.recent_failures.front() {
            if now.duration_since(*oldest) >= FAILURE_WINDOW {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Checks every threshold; `Some` means the run must stop.
    pub fn check(&mut self) -> Option<SafetyTrip> {
        let failures = self.recent_failures();
        let trip = if failures >= self.max_fails_per_hour {
            Some(SafetyTrip::FailureRate {
                failures,
                limit: self.max_fails_per_hour,
            })
        } else if self.failed_batches >= self.failed_batch_ceiling {
            Some(SafetyTrip::FailedBatches {
                failed: self.failed_batches,
                limit: self.failed_batch_ceiling,
            })
        } else {
            self.probe
                .memory_percent()
                .filter(|percent| *percent > self.memory_ceiling_percent)
                .map(|percent| SafetyTrip::MemoryPressure {
                    percent,
                    limit: self.memory_ceiling_percent,
                })
        };
        if let Some(trip) = &trip {
            error!(reason = %trip, "safety threshold exceeded");
        }
        trip
    }
}
