use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::hardware::{BlockDevice, DeviceInventory, Partition, PartitionTable};

const LSBLK_COLUMNS: &str = "NAME,PATH,SIZE,TYPE,RM,HOTPLUG,TRAN,MODEL,LABEL,FSTYPE,PTTYPE,MOUNTPOINT";

/// Device inventory backed by `lsblk`'s JSON output.
pub struct LinuxAdapter {
    lsblk: PathBuf,
}

impl LinuxAdapter {
    pub fn new(lsblk: impl Into<PathBuf>) -> Self {
        Self {
            lsblk: lsblk.into(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new("lsblk")
    }
}

impl DeviceInventory for LinuxAdapter {
    fn list_devices(&self) -> Result<Vec<BlockDevice>> {
        let output = match Command::new(&self.lsblk)
            .args(["-J", "-b", "-o", LSBLK_COLUMNS])
            .output()
        {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    tool = %self.lsblk.display(),
                    "Device enumeration tool not found, no devices listed"
                );
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to run {}", self.lsblk.display()));
            }
        };

        if !output.status.success() {
            bail!(
                "{} failed ({}): {}",
                self.lsblk.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let devices = parse_lsblk(&output.stdout)?;
        debug!(count = devices.len(), "Removable devices listed");
        Ok(devices)
    }
}

#[derive(Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    size: Option<LsblkNumber>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    rm: Option<LsblkFlag>,
    #[serde(default)]
    hotplug: Option<LsblkFlag>,
    #[serde(default)]
    tran: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    pttype: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// Older util-linux prints numbers as strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum LsblkNumber {
    Number(u64),
    Text(String),
}

impl LsblkNumber {
    fn value(&self) -> u64 {
        match self {
            Self::Number(n) => *n,
            Self::Text(s) => s.trim().parse().unwrap_or(0),
        }
    }
}

/// Booleans are `true`/`false` in recent util-linux and `"1"`/`"0"` before.
#[derive(Deserialize)]
#[serde(untagged)]
enum LsblkFlag {
    Bool(bool),
    Number(u8),
    Text(String),
}

impl LsblkFlag {
    fn is_set(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0,
            Self::Text(s) => s.trim() == "1" || s.trim().eq_ignore_ascii_case("true"),
        }
    }
}

impl LsblkDevice {
    fn device_path(&self) -> PathBuf {
        match self.path.as_deref().filter(|p| !p.is_empty()) {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("/dev").join(&self.name),
        }
    }

    fn size_bytes(&self) -> u64 {
        self.size.as_ref().map(LsblkNumber::value).unwrap_or(0)
    }

    fn flag(flag: &Option<LsblkFlag>) -> bool {
        flag.as_ref().is_some_and(LsblkFlag::is_set)
    }

    fn is_removable_disk(&self) -> bool {
        let is_disk = self.kind.as_deref() == Some("disk");
        let external = Self::flag(&self.rm)
            || Self::flag(&self.hotplug)
            || self.tran.as_deref() == Some("usb");
        is_disk && external && !self.name.starts_with("loop") && self.size_bytes() > 0
    }
}

fn text(value: &Option<String>) -> String {
    value.as_deref().map(str::trim).unwrap_or_default().to_string()
}

fn mount_point(value: &Option<String>) -> Option<PathBuf> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(PathBuf::from)
}

/// A child node and everything stacked beneath it (crypt mappings, LVM).
fn partition(node: &LsblkDevice) -> Partition {
    Partition {
        path: node.device_path(),
        size_bytes: node.size_bytes(),
        filesystem: text(&node.fstype),
        label: text(&node.label),
        mount_point: mount_point(&node.mountpoint),
        volumes: node.children.iter().map(partition).collect(),
    }
}

/// Parse `lsblk -J -b` output into removable whole-disk descriptors.
pub fn parse_lsblk(json: &[u8]) -> Result<Vec<BlockDevice>> {
    let parsed: LsblkOutput =
        serde_json::from_slice(json).context("Failed to parse lsblk output")?;

    let devices = parsed
        .blockdevices
        .iter()
        .filter(|dev| dev.is_removable_disk())
        .map(|dev| BlockDevice {
            path: dev.device_path(),
            size_bytes: dev.size_bytes(),
            label: text(&dev.label),
            partition_table: PartitionTable::from_str(&text(&dev.pttype)),
            model: text(&dev.model),
            transport: text(&dev.tran),
            mount_point: mount_point(&dev.mountpoint),
            partitions: dev.children.iter().map(partition).collect(),
        })
        .filter(|dev| !dev.path.as_os_str().is_empty())
        .collect();

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODERN: &str = r#"{
   "blockdevices": [
      {"name":"nvme0n1", "path":"/dev/nvme0n1", "size":512110190592, "type":"disk", "rm":false, "hotplug":false, "tran":"nvme", "model":"Samsung SSD 980", "label":null, "fstype":null, "pttype":"gpt", "mountpoint":null,
         "children": [
            {"name":"nvme0n1p1", "path":"/dev/nvme0n1p1", "size":536870912, "type":"part", "rm":false, "hotplug":false, "tran":null, "model":null, "label":null, "fstype":"vfat", "pttype":"gpt", "mountpoint":"/boot/efi"}
         ]
      },
      {"name":"sdb", "path":"/dev/sdb", "size":16008609792, "type":"disk", "rm":true, "hotplug":true, "tran":"usb", "model":"Cruzer Blade    ", "label":null, "fstype":null, "pttype":"dos", "mountpoint":null,
         "children": [
            {"name":"sdb1", "path":"/dev/sdb1", "size":16007561216, "type":"part", "rm":true, "hotplug":true, "tran":null, "model":null, "label":"STICK", "fstype":"vfat", "pttype":"dos", "mountpoint":"/media/user/STICK"}
         ]
      },
      {"name":"sdc", "path":"/dev/sdc", "size":0, "type":"disk", "rm":true, "hotplug":true, "tran":"usb", "model":"Card Reader", "label":null, "fstype":null, "pttype":null, "mountpoint":null},
      {"name":"loop0", "path":"/dev/loop0", "size":4096, "type":"loop", "rm":false, "hotplug":false, "tran":null, "model":null, "label":null, "fstype":"squashfs", "pttype":null, "mountpoint":"/snap/core/1"}
   ]
}"#;

    // util-linux 2.34 style: strings everywhere, no PATH column
    const LEGACY: &str = r#"{
   "blockdevices": [
      {"name": "sdd", "size": "8053063680", "type": "disk", "rm": "1", "hotplug": "1", "tran": "usb", "model": "Flash Disk", "label": null, "fstype": null, "pttype": "gpt", "mountpoint": null}
   ]
}"#;

    #[test]
    fn keeps_only_removable_disks_with_size() {
        let devices = parse_lsblk(MODERN.as_bytes()).unwrap();
        assert_eq!(devices.len(), 1);

        let dev = &devices[0];
        assert_eq!(dev.path, PathBuf::from("/dev/sdb"));
        assert_eq!(dev.size_bytes, 16_008_609_792);
        assert_eq!(dev.model, "Cruzer Blade");
        assert_eq!(dev.partition_table, PartitionTable::Mbr);
        assert_eq!(dev.transport, "usb");
    }

    #[test]
    fn partitions_carry_filesystem_and_mounts() {
        let devices = parse_lsblk(MODERN.as_bytes()).unwrap();
        let part = &devices[0].partitions[0];
        assert_eq!(part.path, PathBuf::from("/dev/sdb1"));
        assert_eq!(part.filesystem, "vfat");
        assert_eq!(part.label, "STICK");
        assert_eq!(part.mount_point, Some(PathBuf::from("/media/user/STICK")));
        assert!(devices[0].is_mounted());
    }

    #[test]
    fn legacy_string_columns_are_understood() {
        let devices = parse_lsblk(LEGACY.as_bytes()).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].path, PathBuf::from("/dev/sdd"));
        assert_eq!(devices[0].size_bytes, 8_053_063_680);
        assert_eq!(devices[0].partition_table, PartitionTable::Gpt);
        assert!(devices[0].partitions.is_empty());
    }

    // Unlocked LUKS container whose mapping is mounted
    const ENCRYPTED: &str = r#"{
   "blockdevices": [
      {"name":"sdb", "path":"/dev/sdb", "size":32015679488, "type":"disk", "rm":true, "hotplug":true, "tran":"usb", "model":"DataTraveler", "label":null, "fstype":null, "pttype":"gpt", "mountpoint":null,
         "children": [
            {"name":"sdb1", "path":"/dev/sdb1", "size":32014630912, "type":"part", "rm":true, "hotplug":true, "tran":null, "model":null, "label":null, "fstype":"crypto_LUKS", "pttype":"gpt", "mountpoint":null,
               "children": [
                  {"name":"luks-x", "path":"/dev/mapper/luks-x", "size":32012533760, "type":"crypt", "rm":false, "hotplug":false, "tran":null, "model":null, "label":"DATA", "fstype":"ext4", "pttype":null, "mountpoint":"/media/user/DATA"}
               ]
            }
         ]
      }
   ]
}"#;

    #[test]
    fn mounts_on_stacked_volumes_count_as_mounted() {
        let devices = parse_lsblk(ENCRYPTED.as_bytes()).unwrap();
        let dev = &devices[0];
        let part = &dev.partitions[0];
        assert_eq!(part.filesystem, "crypto_LUKS");
        assert_eq!(part.mount_point, None);
        assert_eq!(part.volumes[0].path, PathBuf::from("/dev/mapper/luks-x"));

        assert!(dev.is_mounted());
        assert_eq!(dev.mount_points(), vec![std::path::Path::new("/media/user/DATA")]);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_lsblk(b"NAME SIZE\nsda 1T").is_err());
    }

    #[test]
    fn missing_tool_yields_empty_inventory() {
        let adapter = LinuxAdapter::new("/nonexistent/lsblk");
        assert!(adapter.list_devices().unwrap().is_empty());
    }
}
