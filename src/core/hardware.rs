use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A snapshot of one removable block device.
///
/// Descriptors are rebuilt on every inventory query and are never cached:
/// the drive may be removed or swapped between listing and use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub label: String,
    pub partition_table: PartitionTable,
    pub model: String,
    pub transport: String,
    pub mount_point: Option<PathBuf>,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub filesystem: String,
    pub label: String,
    pub mount_point: Option<PathBuf>,
    /// Volumes stacked on this partition, such as an unlocked LUKS mapping
    /// or LVM logical volumes.
    pub volumes: Vec<Partition>,
}

impl Partition {
    /// Mount points of this partition and everything stacked on it.
    pub fn mount_points(&self) -> Vec<&Path> {
        let mut mounts: Vec<&Path> = self.mount_point.iter().map(PathBuf::as_path).collect();
        for volume in &self.volumes {
            mounts.extend(volume.mount_points());
        }
        mounts
    }
}

/// Partition table layouts understood by the reformat operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTable {
    Gpt,
    Mbr,
    Unknown,
}

impl PartitionTable {
    /// Parse the `PTTYPE` column reported by lsblk or a user-supplied name.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "gpt" => Self::Gpt,
            "mbr" | "dos" | "msdos" => Self::Mbr,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpt => "gpt",
            Self::Mbr => "mbr",
            Self::Unknown => "unknown",
        }
    }

    /// Label name as understood by `parted mklabel`.
    pub fn parted_label(&self) -> Option<&'static str> {
        match self {
            Self::Gpt => Some("gpt"),
            Self::Mbr => Some("msdos"),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for PartitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identifying attributes of a device as seen at listing time.
///
/// Requests carry this instead of the full descriptor; the orchestrator
/// compares it against a fresh descriptor right before any destructive step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub model: String,
}

impl BlockDevice {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            path: self.path.clone(),
            size_bytes: self.size_bytes,
            model: self.model.clone(),
        }
    }

    /// All mount points held by the device, its partitions, or any volume
    /// stacked on them.
    pub fn mount_points(&self) -> Vec<&Path> {
        let mut mounts: Vec<&Path> = self.mount_point.iter().map(PathBuf::as_path).collect();
        for partition in &self.partitions {
            mounts.extend(partition.mount_points());
        }
        mounts
    }

    pub fn is_mounted(&self) -> bool {
        !self.mount_points().is_empty()
    }
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let model = if self.model.is_empty() {
            "Unknown Model"
        } else {
            &self.model
        };

        write!(
            f,
            "{:<12} {:>8.1} GB  {:<6} {}",
            self.path.display(),
            self.size_bytes as f64 / 1e9,
            self.partition_table,
            model
        )?;

        if !self.label.is_empty() {
            write!(f, " [{}]", self.label)?;
        }
        if self.is_mounted() {
            write!(f, " (mounted)")?;
        }
        Ok(())
    }
}

pub trait DeviceInventory: Send + Sync {
    /// List all currently connected removable devices.
    ///
    /// NOTE: Implementations may shell out and block; call from a blocking
    /// context (e.g., via spawn_blocking) when inside the runtime.
    fn list_devices(&self) -> anyhow::Result<Vec<BlockDevice>>;

    /// Fresh lookup of a single device by path.
    fn describe(&self, path: &Path) -> anyhow::Result<Option<BlockDevice>> {
        Ok(self
            .list_devices()?
            .into_iter()
            .find(|device| device.path == path))
    }
}
