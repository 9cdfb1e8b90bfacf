use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::core::hardware::{BlockDevice, DeviceInventory};

#[cfg(target_os = "linux")]
mod linux;
mod simulated;

#[cfg(target_os = "linux")]
pub use linux::{LinuxAdapter, parse_lsblk};
pub use simulated::{SimulatedAdapter, Simulator};

/// Size of the backing file for the simulated drive
const SIMULATED_DISK_BYTES: u64 = 256 * 1024 * 1024;

/// Inventory for platforms without a supported enumeration tool.
pub struct UnsupportedPlatform;

impl DeviceInventory for UnsupportedPlatform {
    fn list_devices(&self) -> Result<Vec<BlockDevice>> {
        warn!(
            os = std::env::consts::OS,
            "Device enumeration is not supported on this platform"
        );
        Ok(Vec::new())
    }
}

pub fn get_inventory(config: &AppConfig) -> Result<Arc<dyn DeviceInventory>> {
    if config.simulation {
        let (adapter, controller) = SimulatedAdapter::new();
        let backing = simulated_disk_path();
        prepare_backing_file(&backing)?;
        controller.add_device(&backing, SIMULATED_DISK_BYTES);
        info!(path = %backing.display(), "Simulation mode: using a file-backed drive");
        return Ok(Arc::new(adapter));
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxAdapter::new(&config.tools.lsblk)))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Ok(Arc::new(UnsupportedPlatform))
    }
}

fn simulated_disk_path() -> PathBuf {
    std::env::temp_dir().join("isoflash-simulated-disk.img")
}

/// Sparse file standing in for a raw device.
fn prepare_backing_file(path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to create simulated disk {}", path.display()))?;
    file.set_len(SIMULATED_DISK_BYTES)
        .context("Failed to size simulated disk")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_platform_lists_nothing() {
        assert!(UnsupportedPlatform.list_devices().unwrap().is_empty());
    }
}
