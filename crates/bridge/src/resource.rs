//! Memory/CPU sampling (SPEC_FULL.md §4.2, §5). The teacher declares
//! `sysinfo` in its Cargo.toml but never calls it; this is its first real
//! use in the workspace.

use sysinfo::System;

pub const MEM_WARNING_PCT: f64 = 90.0;
pub const MEM_CRITICAL_PCT: f64 = 95.0;
pub const CPU_WARNING_PCT: f32 = 70.0;
pub const CPU_CRITICAL_PCT: f32 = 85.0;

/// Emergency flush rejects new publishes until usage falls back to this.
pub const MEM_EMERGENCY_PCT: f64 = 95.0;
pub const MEM_RECOVER_PCT: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResourceLevel {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub mem_used_pct: f64,
    pub cpu_pct: f32,
}

impl ResourceSample {
    /// Worst of the memory and CPU classifications, per §4.2's resource
    /// monitor ("critical if any critical, degraded if any warning").
    pub fn level(&self) -> ResourceLevel {
        let mem_level = if self.mem_used_pct >= MEM_CRITICAL_PCT {
            ResourceLevel::Critical
        } else if self.mem_used_pct >= MEM_WARNING_PCT {
            ResourceLevel::Warning
        } else {
            ResourceLevel::Normal
        };

        let cpu_level = if self.cpu_pct >= CPU_CRITICAL_PCT {
            ResourceLevel::Critical
        } else if self.cpu_pct >= CPU_WARNING_PCT {
            ResourceLevel::Warning
        } else {
            ResourceLevel::Normal
        };

        match (mem_level, cpu_level) {
            (ResourceLevel::Critical, _) | (_, ResourceLevel::Critical) => ResourceLevel::Critical,
            (ResourceLevel::Warning, _) | (_, ResourceLevel::Warning) => ResourceLevel::Warning,
            _ => ResourceLevel::Normal,
        }
    }
}

pub struct ResourceMonitor {
    sys: System,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        Self { sys }
    }

    pub fn sample(&mut self) -> ResourceSample {
        self.sys.refresh_memory();
        self.sys.refresh_cpu_usage();

        let total = self.sys.total_memory().max(1);
        let used = self.sys.used_memory();
        let mem_used_pct = used as f64 / total as f64 * 100.0;
        let cpu_pct = self.sys.global_cpu_usage();

        ResourceSample { mem_used_pct, cpu_pct }
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
