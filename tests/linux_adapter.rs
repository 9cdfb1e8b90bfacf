//! lsblk-backed inventory tests.
//!
//! `lsblk` is replaced by shell scripts printing canned output, so these run
//! anywhere. The test against the real tool is ignored by default.
//!
//! Run ignored tests: `cargo test --test linux_adapter -- --ignored`

#![cfg(target_os = "linux")]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use isoflash::adapters::LinuxAdapter;
use isoflash::core::{DeviceInventory, PartitionTable};
use isoflash::logging::{LogConfig, LogLevel, LogSink};
use tempfile::tempdir;

const TWO_STICKS: &str = r#"{
   "blockdevices": [
      {"name":"sda", "path":"/dev/sda", "size":256060514304, "type":"disk", "rm":false, "hotplug":false, "tran":"sata", "model":"INTERNAL SSD", "label":null, "fstype":null, "pttype":"gpt", "mountpoint":null},
      {"name":"sdb", "path":"/dev/sdb", "size":31406948352, "type":"disk", "rm":true, "hotplug":true, "tran":"usb", "model":"Ultra Fit", "label":null, "fstype":null, "pttype":"gpt", "mountpoint":null,
         "children": [
            {"name":"sdb1", "path":"/dev/sdb1", "size":31373393920, "type":"part", "rm":true, "hotplug":true, "tran":null, "model":null, "label":"Ventoy", "fstype":"exfat", "pttype":"gpt", "mountpoint":null},
            {"name":"sdb2", "path":"/dev/sdb2", "size":33554432, "type":"part", "rm":true, "hotplug":true, "tran":null, "model":null, "label":"VTOYEFI", "fstype":"vfat", "pttype":"gpt", "mountpoint":null}
         ]
      },
      {"name":"sdc", "path":"/dev/sdc", "size":7751073792, "type":"disk", "rm":false, "hotplug":true, "tran":"usb", "model":"DataTraveler", "label":null, "fstype":null, "pttype":"dos", "mountpoint":null}
   ]
}"#;

fn fake_lsblk(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("lsblk");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn quiet(level: LogLevel) -> LogConfig {
    LogConfig {
        json: false,
        level,
        console: false,
    }
}

#[test]
fn test_lists_removable_disks() {
    let temp = tempdir().unwrap();
    let json = temp.path().join("out.json");
    std::fs::write(&json, TWO_STICKS).unwrap();
    let lsblk = fake_lsblk(temp.path(), &format!("cat '{}'", json.display()));

    let devices = LinuxAdapter::new(lsblk).list_devices().unwrap();

    let paths: Vec<_> = devices.iter().map(|d| d.path.clone()).collect();
    assert_eq!(paths, vec![PathBuf::from("/dev/sdb"), PathBuf::from("/dev/sdc")]);
    assert_eq!(devices[0].partition_table, PartitionTable::Gpt);
    assert_eq!(devices[0].partitions.len(), 2);
    assert_eq!(devices[1].partition_table, PartitionTable::Mbr);
}

#[test]
fn test_describe_finds_one_device() {
    let temp = tempdir().unwrap();
    let json = temp.path().join("out.json");
    std::fs::write(&json, TWO_STICKS).unwrap();
    let adapter = LinuxAdapter::new(fake_lsblk(temp.path(), &format!("cat '{}'", json.display())));

    let sdb = adapter.describe(Path::new("/dev/sdb")).unwrap().unwrap();
    assert_eq!(sdb.model, "Ultra Fit");
    assert_eq!(sdb.partitions[0].label, "Ventoy");

    // Internal disks are never offered
    assert!(adapter.describe(Path::new("/dev/sda")).unwrap().is_none());
}

#[test]
fn test_requested_columns() {
    let temp = tempdir().unwrap();
    let args = temp.path().join("args");
    let lsblk = fake_lsblk(
        temp.path(),
        &format!("echo \"$@\" > '{}'; echo '{{\"blockdevices\": []}}'", args.display()),
    );

    assert!(LinuxAdapter::new(lsblk).list_devices().unwrap().is_empty());

    let recorded = std::fs::read_to_string(args).unwrap();
    assert_eq!(
        recorded.trim(),
        "-J -b -o NAME,PATH,SIZE,TYPE,RM,HOTPLUG,TRAN,MODEL,LABEL,FSTYPE,PTTYPE,MOUNTPOINT"
    );
}

#[test]
fn test_tool_failure_is_an_error() {
    let temp = tempdir().unwrap();
    let lsblk = fake_lsblk(temp.path(), "echo 'lsblk: unknown column' >&2; exit 1");

    let err = LinuxAdapter::new(lsblk).list_devices().unwrap_err();
    assert!(err.to_string().contains("unknown column"));
}

#[test]
fn test_missing_tool_warns_once_and_lists_nothing() {
    let (subscriber, sink) = LogSink::build(&quiet(LogLevel::Info));
    let mut rx = sink.subscribe();

    let devices = tracing::subscriber::with_default(subscriber, || {
        LinuxAdapter::new("/nonexistent/bin/lsblk").list_devices()
    })
    .unwrap();

    assert!(devices.is_empty());

    let mut warnings = Vec::new();
    while let Ok(record) = rx.try_recv() {
        if record.level == LogLevel::Warning {
            warnings.push(record);
        }
    }
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].message.contains("not found"));
}

#[test]
#[ignore = "requires util-linux lsblk"]
fn test_real_lsblk() {
    let devices = LinuxAdapter::with_defaults().list_devices().unwrap();
    for device in devices {
        assert!(device.size_bytes > 0);
        assert!(device.path.starts_with("/dev"));
    }
}
