//! Load-driven pool sizing

use chunkflow_config::PoolConfig;
use sysinfo::System;

/// System resource usage as fractions of the total
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemPressure {
    pub memory_ratio: Option<f64>,
    pub cpu_ratio: Option<f64>,
}

/// Source of [`SystemPressure`] samples
pub trait PressureProbe: Send {
    fn sample(&mut self) -> SystemPressure;
}

/// Reads memory and CPU usage through `sysinfo`
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PressureProbe for SysinfoProbe {
    fn sample(&mut self) -> SystemPressure {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();

        let total = self.system.total_memory();
        let memory_ratio = (total > 0).then(|| self.system.used_memory() as f64 / total as f64);
        let cpu_ratio = Some(f64::from(self.system.global_cpu_usage()) / 100.0);

        SystemPressure {
            memory_ratio,
            cpu_ratio,
        }
    }
}

/// Reports no pressure at all
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPressure;

impl PressureProbe for NoPressure {
    fn sample(&mut self) -> SystemPressure {
        SystemPressure::default()
    }
}

/// Per-category inputs of a sizing decision
#[derive(Debug, Clone, Copy)]
pub struct CategoryLoad {
    pub backlog: usize,
    /// Live plus in-creation contexts
    pub size: usize,
    pub idle: usize,
    pub target: usize,
    pub baseline: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingDecision {
    /// Raise the target size
    Grow { to: usize },
    /// Lower the target; surplus contexts retire once idle
    Shrink { to: usize },
    Hold,
}

pub struct PoolSizingController {
    expansion_threshold: f64,
    high_memory_threshold: f64,
    high_cpu_threshold: f64,
}

impl PoolSizingController {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            expansion_threshold: config.pool_expansion_threshold,
            high_memory_threshold: config.high_memory_threshold,
            high_cpu_threshold: config.high_cpu_threshold,
        }
    }

    /// `headroom` is how many more contexts the global cap allows
    pub fn decide(&self, load: CategoryLoad, pressure: SystemPressure, headroom: usize) -> SizingDecision {
        let memory_high = pressure
            .memory_ratio
            .is_some_and(|ratio| ratio >= self.high_memory_threshold);
        // busy contexts are retired as they finish their current task
        if memory_high {
            return if load.size > 1 {
                SizingDecision::Shrink { to: load.size - 1 }
            } else {
                SizingDecision::Hold
            };
        }

        let cpu_high = pressure
            .cpu_ratio
            .is_some_and(|ratio| ratio >= self.high_cpu_threshold);
        let overloaded = load.backlog as f64 > load.size as f64 * self.expansion_threshold;
        if overloaded && load.size < load.max && !cpu_high {
            let wanted = (load.backlog as f64 / self.expansion_threshold).ceil() as usize;
            let to = wanted.min(load.max).min(load.size + headroom);
            if to > load.size && to > load.target {
                return SizingDecision::Grow { to };
            }
        }

        if load.backlog == 0 && load.size > load.baseline && load.idle > 0 {
            return SizingDecision::Shrink { to: load.size - 1 };
        }

        if load.target < load.baseline {
            return SizingDecision::Grow { to: load.baseline };
        }

        SizingDecision::Hold
    }
}
