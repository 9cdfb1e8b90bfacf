use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::core::hardware::{BlockDevice, DeviceInventory, Partition, PartitionTable};

/// Controller for a [`SimulatedAdapter`]: plug, unplug and swap devices.
#[derive(Clone)]
pub struct Simulator {
    devices: Arc<Mutex<Vec<BlockDevice>>>,
}

impl Simulator {
    pub fn add(&self, device: BlockDevice) {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices.retain(|d| d.path != device.path);
        devices.push(device);
    }

    /// Plug in a blank USB stick at `path`.
    pub fn add_device(&self, path: impl Into<PathBuf>, size_bytes: u64) -> BlockDevice {
        let device = simulated_device(path.into(), size_bytes);
        self.add(device.clone());
        device
    }

    pub fn remove_device(&self, path: &Path) {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices.retain(|d| d.path != path);
    }

    /// Mutate the device at `path` in place, e.g. to mount a partition.
    pub fn update_device<F>(&self, path: &Path, f: F)
    where
        F: FnOnce(&mut BlockDevice),
    {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(device) = devices.iter_mut().find(|d| d.path == path) {
            f(device);
        }
    }
}

/// In-memory inventory for tests and `--simulation` runs.
pub struct SimulatedAdapter {
    devices: Arc<Mutex<Vec<BlockDevice>>>,
}

impl SimulatedAdapter {
    pub fn new() -> (Self, Simulator) {
        let devices = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                devices: devices.clone(),
            },
            Simulator { devices },
        )
    }
}

impl DeviceInventory for SimulatedAdapter {
    fn list_devices(&self) -> anyhow::Result<Vec<BlockDevice>> {
        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        Ok(devices.clone())
    }
}

fn simulated_device(path: PathBuf, size_bytes: u64) -> BlockDevice {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    BlockDevice {
        partitions: vec![Partition {
            path: PathBuf::from(format!("{}1", path.display())),
            size_bytes: size_bytes.saturating_sub(1024 * 1024),
            filesystem: "vfat".to_string(),
            label: format!("SIM_{}", name.to_uppercase()),
            mount_point: None,
            volumes: Vec::new(),
        }],
        path,
        size_bytes,
        label: String::new(),
        partition_table: PartitionTable::Mbr,
        model: "Simulated Disk".to_string(),
        transport: "usb".to_string(),
        mount_point: None,
    }
}
