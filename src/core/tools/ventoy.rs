//! Ventoy installation and ISO placement.
//!
//! The installer script is driven non-interactively: it asks for confirmation
//! twice before touching the disk, and both prompts get a `y`. Once installed,
//! Ventoy boots any ISO found on its data partition, so flashing an image is
//! a plain file copy.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ToolCommand;
use crate::config::ToolPaths;
use crate::core::error::OperationError;
use crate::core::hardware::{BlockDevice, Partition};
use crate::core::progress::{Progress, ProgressReporter, Stage};

/// Label Ventoy gives its exFAT data partition
pub const DATA_LABEL: &str = "Ventoy";

/// Buffer size for file I/O operations (128KB for optimal throughput)
const BUFFER_SIZE: usize = 128 * 1024;

/// How often to send progress updates (bytes between updates)
const PROGRESS_UPDATE_INTERVAL: u64 = 8 * 1024 * 1024;

/// Appended to the destination name while a copy is in flight
const PARTIAL_SUFFIX: &str = ".part";

/// Answers to the installer's two confirmation prompts
const CONFIRMATIONS: &str = "y\ny\n";

/// Force-install Ventoy onto `device`. Re-running on a Ventoy disk reinstalls.
pub fn install(tools: &ToolPaths, installer: &Path, device: &Path) -> ToolCommand {
    let mut cmd = ToolCommand::new(&tools.shell)
        .arg(installer.as_os_str())
        .arg("-I")
        .arg(device.as_os_str())
        .stdin(CONFIRMATIONS);
    // The script locates its helper binaries relative to its own directory
    if let Some(dir) = installer.parent().filter(|d| !d.as_os_str().is_empty()) {
        cmd = cmd.current_dir(dir);
    }
    cmd
}

/// Mount `partition` at `target`. With `owner` set, the FAT/exFAT mount is
/// handed to that uid/gid so an unprivileged caller can write to it.
pub fn mount(
    tools: &ToolPaths,
    partition: &Path,
    target: &Path,
    owner: Option<(u32, u32)>,
) -> ToolCommand {
    let mut cmd = ToolCommand::new(&tools.mount);
    if let Some((uid, gid)) = owner {
        cmd = cmd.arg("-o").arg(format!("uid={},gid={}", uid, gid));
    }
    cmd.arg(partition.as_os_str()).arg(target.as_os_str())
}

pub fn unmount(tools: &ToolPaths, target: &Path) -> ToolCommand {
    ToolCommand::new(&tools.umount).arg(target.as_os_str())
}

/// The partition ISOs go to: the one labelled `Ventoy`, else the first.
pub fn data_partition(device: &BlockDevice) -> Option<&Partition> {
    device
        .partitions
        .iter()
        .find(|p| p.label.eq_ignore_ascii_case(DATA_LABEL))
        .or_else(|| device.partitions.first())
}

/// Copy `image` into `dest_dir`, keeping its file name. Returns the new path.
///
/// Data goes to a `.part` file that replaces the destination only once it is
/// complete and synced, so an existing ISO of the same name survives a failed
/// or cancelled copy. The partial file is removed on failure.
pub async fn copy_image(
    image: &Path,
    dest_dir: &Path,
    reporter: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<PathBuf, OperationError> {
    let image = image.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();
    let reporter = reporter.clone();
    let cancel = cancel.clone();

    tokio::task::spawn_blocking(move || {
        let file_name = image
            .file_name()
            .ok_or_else(|| copy_err(format!("{} has no file name", image.display())))?;
        let dest = dest_dir.join(file_name);
        let mut partial_name = file_name.to_os_string();
        partial_name.push(PARTIAL_SUFFIX);
        let partial = dest_dir.join(partial_name);

        let copied = copy_file_with_progress(&image, &partial, &reporter, &cancel).and_then(|bytes| {
            fs::rename(&partial, &dest)
                .map(|()| bytes)
                .map_err(|e| copy_err(format!("failed to move copy into place at {}: {}", dest.display(), e)))
        });

        match copied {
            Ok(bytes) => {
                info!(
                    destination = %dest.display(),
                    total_bytes = bytes,
                    "ISO copied to Ventoy drive"
                );
                reporter.blocking_emit(
                    Stage::CopyingImage,
                    Progress::Percent(100),
                    format!("Copied {} bytes to {}", bytes, dest.display()),
                );
                Ok(dest)
            }
            Err(e) => {
                if partial.exists() {
                    if let Err(rm) = fs::remove_file(&partial) {
                        warn!(path = %partial.display(), error = %rm, "Failed to remove partial copy");
                    }
                }
                Err(e)
            }
        }
    })
    .await
    .map_err(|e| copy_err(format!("copy task aborted: {}", e)))?
}

fn copy_err(reason: String) -> OperationError {
    OperationError::Copy {
        reason,
        raw_output: String::new(),
    }
}

fn copy_file_with_progress(
    source: &Path,
    dest: &Path,
    reporter: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<u64, OperationError> {
    let src = File::open(source)
        .map_err(|e| copy_err(format!("failed to open {}: {}", source.display(), e)))?;
    let total = src.metadata().map(|m| m.len()).unwrap_or(0);

    let dst = File::create(dest)
        .map_err(|e| copy_err(format!("failed to create {}: {}", dest.display(), e)))?;

    debug!(source = %source.display(), dest = %dest.display(), total_bytes = total, "Copying image");

    let mut reader = BufReader::with_capacity(BUFFER_SIZE, src);
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dst);
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut copied: u64 = 0;
    let mut last_update: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(OperationError::Cancelled {
                raw_output: String::new(),
            });
        }

        let n = reader
            .read(&mut buffer)
            .map_err(|e| copy_err(format!("failed reading {}: {}", source.display(), e)))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buffer[..n])
            .map_err(|e| copy_err(format!("failed writing {}: {}", dest.display(), e)))?;
        copied += n as u64;

        if copied - last_update >= PROGRESS_UPDATE_INTERVAL {
            reporter.blocking_emit(
                Stage::CopyingImage,
                Progress::ratio(copied, total),
                format!("{} of {} bytes copied", copied, total),
            );
            last_update = copied;
        }
    }

    let file = writer
        .into_inner()
        .map_err(|e| copy_err(format!("failed flushing {}: {}", dest.display(), e.error())))?;
    file.sync_all()
        .map_err(|e| copy_err(format!("failed syncing {}: {}", dest.display(), e)))?;

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hardware::PartitionTable;
    use tempfile::tempdir;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn partition(path: &str, label: &str) -> Partition {
        Partition {
            path: PathBuf::from(path),
            size_bytes: 1024,
            filesystem: "exfat".to_string(),
            label: label.to_string(),
            mount_point: None,
            volumes: Vec::new(),
        }
    }

    fn device(partitions: Vec<Partition>) -> BlockDevice {
        BlockDevice {
            path: PathBuf::from("/dev/sdb"),
            size_bytes: 8 * 1024 * 1024 * 1024,
            label: String::new(),
            partition_table: PartitionTable::Mbr,
            model: "Flash Disk".to_string(),
            transport: "usb".to_string(),
            mount_point: None,
            partitions,
        }
    }

    #[test]
    fn prefers_partition_labelled_ventoy() {
        let dev = device(vec![partition("/dev/sdb2", "VTOYEFI"), partition("/dev/sdb1", "Ventoy")]);
        assert_eq!(data_partition(&dev).unwrap().path, PathBuf::from("/dev/sdb1"));
    }

    #[test]
    fn falls_back_to_first_partition() {
        let dev = device(vec![partition("/dev/sdb1", ""), partition("/dev/sdb2", "VTOYEFI")]);
        assert_eq!(data_partition(&dev).unwrap().path, PathBuf::from("/dev/sdb1"));
        assert!(data_partition(&device(vec![])).is_none());
    }

    #[test]
    fn installer_runs_from_its_directory() {
        let cmd = install(
            &ToolPaths::default(),
            Path::new("/opt/ventoy-1.0.90/Ventoy2Disk.sh"),
            Path::new("/dev/sdb"),
        );
        assert_eq!(cmd.to_string(), "sh /opt/ventoy-1.0.90/Ventoy2Disk.sh -I /dev/sdb");
        assert_eq!(cmd.current_dir, Some(PathBuf::from("/opt/ventoy-1.0.90")));
        assert_eq!(cmd.stdin.as_deref(), Some(CONFIRMATIONS.as_bytes()));
    }

    #[test]
    fn mount_passes_owner_when_given() {
        let tools = ToolPaths::default();
        let plain = mount(&tools, Path::new("/dev/sdb1"), Path::new("/mnt/x"), None);
        assert_eq!(plain.to_string(), "mount /dev/sdb1 /mnt/x");

        let owned = mount(&tools, Path::new("/dev/sdb1"), Path::new("/mnt/x"), Some((1000, 1000)));
        assert_eq!(owned.to_string(), "mount -o uid=1000,gid=1000 /dev/sdb1 /mnt/x");
    }

    #[tokio::test]
    async fn test_copy_image_into_directory() {
        let temp = tempdir().unwrap();
        let image = temp.path().join("debian-11.7.0-amd64-netinst.iso");
        let content = vec![7u8; BUFFER_SIZE * 2 + 5];
        std::fs::write(&image, &content).unwrap();
        let mount = temp.path().join("mnt");
        std::fs::create_dir(&mount).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let reporter = ProgressReporter::new(Uuid::now_v7(), tx, CancellationToken::new());

        let dest = copy_image(&image, &mount, &reporter, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(dest, mount.join("debian-11.7.0-amd64-netinst.iso"));
        assert_eq!(std::fs::read(&dest).unwrap(), content);
        assert!(!mount.join("debian-11.7.0-amd64-netinst.iso.part").exists());
        let last = rx.recv().await.unwrap();
        assert_eq!(last.progress, Progress::Percent(100));
    }

    #[tokio::test]
    async fn test_copy_into_missing_directory_is_copy_error() {
        let temp = tempdir().unwrap();
        let image = temp.path().join("a.iso");
        std::fs::write(&image, b"iso").unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let reporter = ProgressReporter::new(Uuid::now_v7(), tx, CancellationToken::new());

        let err = copy_image(
            &image,
            &temp.path().join("not-mounted"),
            &reporter,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), crate::core::FailureKind::Copy);
    }

    #[tokio::test]
    async fn test_cancelled_copy_removes_partial_file() {
        let temp = tempdir().unwrap();
        let image = temp.path().join("a.iso");
        std::fs::write(&image, b"iso").unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let reporter = ProgressReporter::new(Uuid::now_v7(), tx, CancellationToken::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let out = temp.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let err = copy_image(&image, &out, &reporter, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::FailureKind::Cancelled);
        assert!(!out.join("a.iso").exists());
        assert!(!out.join("a.iso.part").exists());
    }

    #[tokio::test]
    async fn test_failed_copy_keeps_existing_iso() {
        let temp = tempdir().unwrap();
        let image = temp.path().join("a.iso");
        std::fs::write(&image, b"new iso").unwrap();
        let out = temp.path().join("out");
        std::fs::create_dir(&out).unwrap();
        std::fs::write(out.join("a.iso"), b"old iso").unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let reporter = ProgressReporter::new(Uuid::now_v7(), tx, cancel.clone());
        cancel.cancel();

        let err = copy_image(&image, &out, &reporter, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::FailureKind::Cancelled);
        assert_eq!(std::fs::read(out.join("a.iso")).unwrap(), b"old iso");
        assert!(!out.join("a.iso.part").exists());
    }

    #[tokio::test]
    async fn test_copy_replaces_existing_iso_when_complete() {
        let temp = tempdir().unwrap();
        let image = temp.path().join("a.iso");
        std::fs::write(&image, b"new iso").unwrap();
        let out = temp.path().join("out");
        std::fs::create_dir(&out).unwrap();
        std::fs::write(out.join("a.iso"), b"old iso").unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let reporter = ProgressReporter::new(Uuid::now_v7(), tx, CancellationToken::new());

        copy_image(&image, &out, &reporter, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(out.join("a.iso")).unwrap(), b"new iso");
    }

    #[tokio::test]
    async fn test_unreadable_source_is_copy_error() {
        let temp = tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let reporter = ProgressReporter::new(Uuid::now_v7(), tx, CancellationToken::new());

        let err = copy_image(
            &temp.path().join("vanished.iso"),
            temp.path(),
            &reporter,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), crate::core::FailureKind::Copy);
    }
}
