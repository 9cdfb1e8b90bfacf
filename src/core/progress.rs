//! Progress events and in-memory tracking of active operations.
//!
//! Events flow from the worker to exactly one consumer through a channel of
//! capacity one. They are never persisted. [`ActiveOperations`] remembers
//! which devices have an operation in flight.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Pause between attempts to deliver an event from a blocking worker
const BLOCKING_RETRY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Validating,
    Partitioning,
    Flashing,
    Syncing,
    InstallingVentoy,
    CopyingImage,
    Hashing,
    Finished,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validating => "validating",
            Self::Partitioning => "partitioning",
            Self::Flashing => "flashing",
            Self::Syncing => "syncing",
            Self::InstallingVentoy => "installing-ventoy",
            Self::CopyingImage => "copying-image",
            Self::Hashing => "hashing",
            Self::Finished => "finished",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Progress {
    Percent(u8),
    Indeterminate,
}

impl Progress {
    /// Percentage of `done` over `total`, clamped to 100. Unknown totals
    /// yield indeterminate progress.
    pub fn ratio(done: u64, total: u64) -> Self {
        if total == 0 {
            return Self::Indeterminate;
        }
        let pct = (done as u128 * 100 / total as u128).min(100) as u8;
        Self::Percent(pct)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub request_id: Uuid,
    pub stage: Stage,
    pub progress: Progress,
    pub log_line: String,
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.progress {
            Progress::Percent(p) => write!(f, "[{:>3}%] {}: {}", p, self.stage, self.log_line),
            Progress::Indeterminate => write!(f, "[ .. ] {}: {}", self.stage, self.log_line),
        }
    }
}

/// Producer side of a request's event stream.
///
/// Send failures mean the consumer stopped listening; the operation keeps
/// running and the events are discarded. Once the request is cancelled a
/// send waiting on a full channel gives up, so a consumer that cancels and
/// stops draining never stalls the worker.
#[derive(Clone)]
pub struct ProgressReporter {
    request_id: Uuid,
    tx: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
}

impl ProgressReporter {
    pub fn new(request_id: Uuid, tx: mpsc::Sender<ProgressEvent>, cancel: CancellationToken) -> Self {
        Self {
            request_id,
            tx,
            cancel,
        }
    }

    fn event(&self, stage: Stage, progress: Progress, line: impl Into<String>) -> ProgressEvent {
        ProgressEvent {
            request_id: self.request_id,
            stage,
            progress,
            log_line: line.into(),
        }
    }

    pub async fn emit(&self, stage: Stage, progress: Progress, line: impl Into<String>) {
        let event = self.event(stage, progress, line);
        tokio::select! {
            _ = self.tx.send(event) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// For use inside `spawn_blocking` workers.
    pub fn blocking_emit(&self, stage: Stage, progress: Progress, line: impl Into<String>) {
        let mut event = self.event(stage, progress, line);
        loop {
            match self.tx.try_send(event) {
                Ok(()) | Err(TrySendError::Closed(_)) => return,
                Err(TrySendError::Full(pending)) => {
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    event = pending;
                    std::thread::sleep(BLOCKING_RETRY);
                }
            }
        }
    }
}

/// Thread-safe registry of devices with an operation in flight.
///
/// At most one operation may hold a device at a time. Claims are released
/// when the returned [`DeviceClaim`] is dropped.
#[derive(Clone, Default)]
pub struct ActiveOperations {
    inner: Arc<Mutex<HashMap<PathBuf, Uuid>>>,
}

impl ActiveOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `device` for `request_id`. Returns `None` when another request
    /// already holds it.
    pub fn claim(&self, device: &Path, request_id: Uuid) -> Option<DeviceClaim> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(device) {
            return None;
        }
        map.insert(device.to_path_buf(), request_id);
        Some(DeviceClaim {
            owner: self.clone(),
            device: device.to_path_buf(),
        })
    }

    fn release(&self, device: &Path) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(device);
    }

    /// The request currently holding `device`, if any.
    pub fn holder(&self, device: &Path) -> Option<Uuid> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(device).copied()
    }

    pub fn active_count(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.len()
    }
}

/// Exclusive hold on a device path; released on drop.
pub struct DeviceClaim {
    owner: ActiveOperations,
    device: PathBuf,
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.owner.release(&self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_clamps_and_handles_unknown_total() {
        assert_eq!(Progress::ratio(50, 200), Progress::Percent(25));
        assert_eq!(Progress::ratio(300, 200), Progress::Percent(100));
        assert_eq!(Progress::ratio(10, 0), Progress::Indeterminate);
        assert_eq!(
            Progress::ratio(u64::MAX, u64::MAX),
            Progress::Percent(100)
        );
    }

    #[test]
    fn events_serialize_with_request_id() {
        let id = Uuid::now_v7();
        let event = ProgressEvent {
            request_id: id,
            stage: Stage::Flashing,
            progress: Progress::Percent(40),
            log_line: "40% written".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["request_id"], id.to_string());
        assert_eq!(json["stage"], "Flashing");
    }

    #[test]
    fn claim_is_exclusive_per_device() {
        let active = ActiveOperations::new();
        let sdb = Path::new("/dev/sdb");
        let sdc = Path::new("/dev/sdc");

        let first = active.claim(sdb, Uuid::now_v7()).expect("first claim");
        assert!(active.claim(sdb, Uuid::now_v7()).is_none());

        // Other devices are independent
        let _other = active.claim(sdc, Uuid::now_v7()).expect("independent device");
        assert_eq!(active.active_count(), 2);

        drop(first);
        assert!(active.holder(sdb).is_none());
        assert!(active.claim(sdb, Uuid::now_v7()).is_some());
    }

    #[test]
    fn blocking_emit_gives_up_on_full_channel_after_cancel() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let reporter = ProgressReporter::new(Uuid::now_v7(), tx, cancel.clone());

        reporter.blocking_emit(Stage::Hashing, Progress::Percent(10), "fills the channel");

        let trigger = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        // Nobody drains; this returns only because of the cancellation
        reporter.blocking_emit(Stage::Hashing, Progress::Percent(20), "dropped");
        canceller.join().unwrap();

        assert_eq!(rx.try_recv().unwrap().progress, Progress::Percent(10));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn emit_gives_up_on_full_channel_after_cancel() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let reporter = ProgressReporter::new(Uuid::now_v7(), tx, cancel.clone());

        reporter.emit(Stage::Flashing, Progress::Percent(40), "40% written").await;
        cancel.cancel();
        reporter.emit(Stage::Flashing, Progress::Percent(50), "50% written").await;
    }

    #[tokio::test]
    async fn reporter_survives_dropped_consumer() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let reporter = ProgressReporter::new(Uuid::now_v7(), tx, CancellationToken::new());
        reporter
            .emit(Stage::Hashing, Progress::Indeterminate, "nobody listening")
            .await;
    }
}
