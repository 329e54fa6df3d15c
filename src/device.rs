//! Device memory detection and profile resolution
//!
//! Physical RAM decides the memory budget the lifecycle manager may spend on
//! loaded models. The probe is a trait so tests and configuration can pin the
//! value instead of asking the operating system.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Assumed total RAM when the device query fails (6 GB)
pub const DEFAULT_TOTAL_RAM_BYTES: u64 = 6 * 1024 * 1024 * 1024;

/// Named memory profile for a class of device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    /// Minimum total RAM (GB) a device needs to qualify
    pub min_ram_gb: f64,
    pub ram_budget_mb: u64,
    pub hot_models: Vec<String>,
    pub max_concurrent_models: usize,
}

impl DeviceProfile {
    fn new(
        name: &str,
        min_ram_gb: f64,
        ram_budget_mb: u64,
        hot_models: &[&str],
        max_concurrent_models: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            min_ram_gb,
            ram_budget_mb,
            hot_models: hot_models.iter().map(|s| s.to_string()).collect(),
            max_concurrent_models,
        }
    }
}

/// Built-in profiles, ascending by RAM threshold
pub static DEVICE_PROFILES: LazyLock<Vec<DeviceProfile>> = LazyLock::new(|| {
    vec![
        DeviceProfile::new("low", 4.0, 800, &["lfm2-350m"], 2),
        DeviceProfile::new(
            "mid",
            6.0,
            1500,
            &["lfm25-mobile-actions", "lfm2-350m"],
            3,
        ),
        DeviceProfile::new(
            "high",
            8.0,
            2500,
            &["lfm25-mobile-actions", "lfm2-350m"],
            4,
        ),
        DeviceProfile::new(
            "flagship",
            12.0,
            4000,
            &["lfm25-mobile-actions", "lfm2-350m"],
            5,
        ),
    ]
});

/// Pick the highest-threshold built-in profile the device qualifies for
pub fn resolve_profile(total_ram_bytes: u64) -> DeviceProfile {
    resolve_profile_from(&DEVICE_PROFILES, total_ram_bytes)
}

/// Pick from an arbitrary profile list; falls back to the lowest-tier profile.
/// An empty list yields a zero-budget profile.
pub fn resolve_profile_from(profiles: &[DeviceProfile], total_ram_bytes: u64) -> DeviceProfile {
    let total_ram_gb = total_ram_bytes as f64 / BYTES_PER_GB;

    let mut sorted: Vec<&DeviceProfile> = profiles.iter().collect();
    sorted.sort_by(|a, b| a.min_ram_gb.total_cmp(&b.min_ram_gb));

    let Some(lowest) = sorted.first() else {
        return DeviceProfile::new("none", 0.0, 0, &[], 0);
    };

    let matched = sorted
        .iter()
        .rev()
        .find(|p| p.min_ram_gb <= total_ram_gb)
        .copied()
        .unwrap_or(*lowest);

    matched.clone()
}

/// Source of the device's total physical memory
pub trait MemoryProbe: Send + Sync {
    fn total_memory_bytes(&self) -> Result<u64>;
}

/// Queries the operating system through sysinfo
#[derive(Debug, Default)]
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    fn total_memory_bytes(&self) -> Result<u64> {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            anyhow::bail!("sysinfo reported zero total memory");
        }
        Ok(total)
    }
}

/// Fixed value, used for configuration overrides and tests
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryProbe(pub u64);

impl MemoryProbe for FixedMemoryProbe {
    fn total_memory_bytes(&self) -> Result<u64> {
        Ok(self.0)
    }
}

/// Query total RAM, assuming 6 GB when the probe fails
pub fn detect_total_memory(probe: &dyn MemoryProbe) -> u64 {
    match probe.total_memory_bytes() {
        Ok(bytes) => {
            tracing::info!(
                total_ram_gb = format!("{:.1}", bytes as f64 / BYTES_PER_GB),
                "Detected device memory"
            );
            bytes
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                default_gb = DEFAULT_TOTAL_RAM_BYTES / (1024 * 1024 * 1024),
                "Failed to query device memory, assuming default"
            );
            DEFAULT_TOTAL_RAM_BYTES
        }
    }
}
