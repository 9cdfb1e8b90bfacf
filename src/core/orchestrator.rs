//! Execution of device operations.
//!
//! Each request runs on its own task and reports through an
//! [`OperationHandle`]: a single-consumer stream of progress events, a
//! cancellation switch, the current lifecycle state and exactly one final
//! result. Errors never escape the task; they become
//! [`OperationResult::Failure`] and the orchestrator stays usable.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::{getgid, getuid};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::error::{FailureKind, OperationError, ToolStep, classify_tool_failure};
use super::hardware::{BlockDevice, DeviceIdentity, DeviceInventory, Partition, PartitionTable};
use super::models::{Failure, Operation, OperationRequest, OperationResult, OperationState};
use super::progress::{ActiveOperations, DeviceClaim, Progress, ProgressEvent, ProgressReporter, Stage};
use super::tools::{RunError, ToolCommand, dd, parted, ventoy};
use super::verifier::{self, VerifyOutcome};
use crate::config::AppConfig;
use crate::context::AppContext;
use crate::logging::LogThrottle;

/// Interval between polls for the Ventoy data partition
const SETTLE_POLL: Duration = Duration::from_millis(500);

pub struct Orchestrator {
    ctx: AppContext,
    inventory: Arc<dyn DeviceInventory>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext, inventory: Arc<dyn DeviceInventory>) -> Self {
        Self { ctx, inventory }
    }

    pub async fn list_devices(&self) -> anyhow::Result<Vec<BlockDevice>> {
        let inventory = self.inventory.clone();
        tokio::task::spawn_blocking(move || inventory.list_devices()).await?
    }

    pub async fn describe(&self, path: &Path) -> anyhow::Result<Option<BlockDevice>> {
        let inventory = self.inventory.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || inventory.describe(&path)).await?
    }

    pub fn config(&self) -> &AppConfig {
        &self.ctx.config
    }

    pub fn active(&self) -> &ActiveOperations {
        &self.ctx.active
    }

    /// Start `request` in the background.
    pub fn execute(&self, request: OperationRequest) -> OperationHandle {
        let (tx, events) = mpsc::channel(1);
        let (state_tx, state) = watch::channel(OperationState::Pending);
        let cancel = CancellationToken::new();

        let worker = Worker {
            id: request.id,
            ctx: self.ctx.clone(),
            inventory: self.inventory.clone(),
            reporter: ProgressReporter::new(request.id, tx, cancel.clone()),
            cancel: cancel.clone(),
            state: state_tx,
        };

        let span = info_span!(
            "operation",
            request_id = %request.id,
            kind = request.operation.name()
        );
        let task = tokio::spawn(worker.run(request.operation).instrument(span));

        OperationHandle {
            id: request.id,
            events,
            cancel,
            state,
            task,
        }
    }
}

/// Caller's view of one running request.
pub struct OperationHandle {
    id: Uuid,
    events: mpsc::Receiver<ProgressEvent>,
    cancel: CancellationToken,
    state: watch::Receiver<OperationState>,
    task: JoinHandle<OperationResult>,
}

impl OperationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next progress event, or `None` once the operation stopped reporting.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    /// Ask the operation to stop. Best effort: a tool already past the point
    /// of no return still finishes or is killed mid-write.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels this operation, for use from another task.
    pub fn canceller(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> OperationState {
        *self.state.borrow()
    }

    /// Stop consuming events and wait for the result.
    pub async fn finish(self) -> OperationResult {
        let Self { events, task, .. } = self;
        drop(events);

        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Operation task failed");
                OperationResult::Failure(Failure {
                    kind: FailureKind::Internal,
                    reason: format!("operation task failed: {}", e),
                    raw_output: String::new(),
                })
            }
        }
    }

    /// Feed every event to `on_event`, then return the result.
    pub async fn run<F>(mut self, mut on_event: F) -> OperationResult
    where
        F: FnMut(&ProgressEvent),
    {
        while let Some(event) = self.next_event().await {
            on_event(&event);
        }
        self.finish().await
    }
}

struct Worker {
    id: Uuid,
    ctx: AppContext,
    inventory: Arc<dyn DeviceInventory>,
    reporter: ProgressReporter,
    cancel: CancellationToken,
    state: watch::Sender<OperationState>,
}

impl Worker {
    async fn run(self, operation: Operation) -> OperationResult {
        info!("Operation started");
        self.state.send_replace(OperationState::Validating);

        match self.dispatch(operation).await {
            Ok(digest) => {
                self.state.send_replace(OperationState::Succeeded);
                info!("Operation succeeded");
                OperationResult::Success { digest }
            }
            Err(failure) => {
                self.state.send_replace(OperationState::Failed);
                if failure.kind == FailureKind::Cancelled {
                    warn!(reason = %failure.reason, "Operation cancelled");
                } else {
                    error!(
                        kind = ?failure.kind,
                        reason = %failure.reason,
                        raw_output = %failure.raw_output,
                        "Operation failed"
                    );
                }
                OperationResult::Failure(failure)
            }
        }
    }

    async fn dispatch(&self, operation: Operation) -> Result<Option<String>, Failure> {
        let outcome = match operation {
            Operation::VerifyHash { image, expected } => {
                return self.verify_hash(&image, expected.as_deref()).await;
            }
            Operation::Reformat { device, table } => {
                let _claim = self.claim(&device)?;
                self.reformat(&device, table).await
            }
            Operation::FlashDd { device, image } => {
                let _claim = self.claim(&device)?;
                self.flash_dd(&device, &image).await
            }
            Operation::FlashVentoy { device, image } => {
                let _claim = self.claim(&device)?;
                self.flash_ventoy(&device, &image).await
            }
        };
        outcome.map_err(Failure::from)?;

        self.emit(Stage::Finished, Progress::Percent(100), "Done").await;
        Ok(None)
    }

    /// Take the device for the lifetime of the returned claim.
    fn claim(&self, device: &DeviceIdentity) -> Result<DeviceClaim, OperationError> {
        self.ctx.active.claim(&device.path, self.id).ok_or_else(|| {
            OperationError::busy(format!(
                "another operation is already running on {}",
                device.path.display()
            ))
        })
    }

    async fn verify_hash(
        &self,
        image: &Path,
        expected: Option<&str>,
    ) -> Result<Option<String>, Failure> {
        self.state.send_replace(OperationState::Running);

        let outcome = verifier::verify_image(image, expected, &self.reporter, &self.cancel)
            .await
            .map_err(Failure::from)?;

        match outcome {
            VerifyOutcome::Match { digest } => {
                self.emit(
                    Stage::Finished,
                    Progress::Percent(100),
                    format!("SHA-256 {} matches", digest),
                )
                .await;
                Ok(Some(digest))
            }
            VerifyOutcome::Unchecked { digest } => {
                self.emit(
                    Stage::Finished,
                    Progress::Percent(100),
                    format!("SHA-256 {} (no expected value to compare)", digest),
                )
                .await;
                Ok(Some(digest))
            }
            VerifyOutcome::Mismatch { computed, expected } => Err(Failure {
                reason: format!("hash mismatch: computed {}, expected {}", computed, expected),
                kind: FailureKind::HashMismatch { computed, expected },
                raw_output: String::new(),
            }),
        }
    }

    async fn reformat(
        &self,
        device: &DeviceIdentity,
        table: PartitionTable,
    ) -> Result<(), OperationError> {
        let cmd = parted::mklabel(&self.ctx.config.tools, &device.path, table).ok_or_else(|| {
            OperationError::Write {
                reason: format!("cannot create a partition table of type {}", table),
                raw_output: String::new(),
            }
        })?;

        self.prepare_device(device).await?;

        self.emit(
            Stage::Partitioning,
            Progress::Indeterminate,
            format!("Writing {} partition table to {}", table, device.path.display()),
        )
        .await;
        self.run_tool(ToolStep::Partition, Stage::Partitioning, &cmd, |_| {
            Progress::Indeterminate
        })
        .await?;

        info!(device = %device.path.display(), %table, "Partition table written");
        Ok(())
    }

    async fn flash_dd(&self, device: &DeviceIdentity, image: &Path) -> Result<(), OperationError> {
        let image_size = source_size(image).await?;
        if image_size > device.size_bytes {
            return Err(OperationError::Write {
                reason: format!(
                    "{} is {} bytes but {} holds only {}",
                    image.display(),
                    image_size,
                    device.path.display(),
                    device.size_bytes
                ),
                raw_output: String::new(),
            });
        }

        self.prepare_device(device).await?;

        let tools = &self.ctx.config.tools;
        let cmd = dd::write_image(tools, image, &device.path, &self.ctx.config.block_size);
        let throttle = LogThrottle::new(Duration::from_secs(2));

        self.emit(
            Stage::Flashing,
            Progress::ratio(0, image_size),
            format!("Writing {} to {}", image.display(), device.path.display()),
        )
        .await;
        self.run_tool(ToolStep::BlockCopy, Stage::Flashing, &cmd, |line| {
            match dd::parse_bytes_copied(line) {
                Some(bytes) => {
                    if throttle.should_log() {
                        debug!(bytes, total_bytes = image_size, "dd progress");
                    }
                    Progress::ratio(bytes, image_size)
                }
                None => Progress::Indeterminate,
            }
        })
        .await?;

        self.emit(Stage::Syncing, Progress::Indeterminate, "Flushing write caches")
            .await;
        self.run_tool(ToolStep::BlockCopy, Stage::Syncing, &dd::sync(tools), |_| {
            Progress::Indeterminate
        })
        .await?;

        info!(
            device = %device.path.display(),
            image = %image.display(),
            total_bytes = image_size,
            "Image written"
        );
        Ok(())
    }

    async fn flash_ventoy(
        &self,
        device: &DeviceIdentity,
        image: &Path,
    ) -> Result<(), OperationError> {
        source_size(image).await?;
        let installer = self.installer()?;

        self.prepare_device(device).await?;

        let cmd = ventoy::install(&self.ctx.config.tools, &installer, &device.path);
        self.emit(
            Stage::InstallingVentoy,
            Progress::Indeterminate,
            format!("Installing Ventoy to {}", device.path.display()),
        )
        .await;
        self.run_tool(ToolStep::VentoyInstall, Stage::InstallingVentoy, &cmd, |_| {
            Progress::Indeterminate
        })
        .await?;
        info!(device = %device.path.display(), "Ventoy installed");

        let partition = self.wait_for_data_partition(device).await?;
        let dest = self.place_image(image, &partition).await?;

        info!(
            device = %device.path.display(),
            destination = %dest.display(),
            "ISO placed on Ventoy drive"
        );
        Ok(())
    }

    fn installer(&self) -> Result<PathBuf, OperationError> {
        let Some(installer) = self.ctx.config.ventoy.installer.clone() else {
            return Err(OperationError::InstallerNotFound {
                reason: "no installer configured (set ventoy.installer)".to_string(),
            });
        };
        if !installer.is_file() {
            return Err(OperationError::InstallerNotFound {
                reason: format!("{} does not exist", installer.display()),
            });
        }
        Ok(installer)
    }

    /// Checks shared by every destructive operation, in order: the device is
    /// unchanged, nothing on it is mounted, and privileges are available.
    async fn prepare_device(&self, expected: &DeviceIdentity) -> Result<(), OperationError> {
        self.emit(
            Stage::Validating,
            Progress::Indeterminate,
            format!("Checking {}", expected.path.display()),
        )
        .await;

        let current = self.revalidate(expected).await?;

        let mounts = current.mount_points();
        if !mounts.is_empty() {
            let listed: Vec<String> = mounts.iter().map(|m| m.display().to_string()).collect();
            return Err(OperationError::busy(format!(
                "{} is mounted at {}",
                expected.path.display(),
                listed.join(", ")
            )));
        }

        self.ctx.runner.ensure_privileges()?;

        if self.cancel.is_cancelled() {
            return Err(OperationError::Cancelled {
                raw_output: String::new(),
            });
        }
        self.state.send_replace(OperationState::Running);
        Ok(())
    }

    async fn revalidate(&self, expected: &DeviceIdentity) -> Result<BlockDevice, OperationError> {
        let inventory = self.inventory.clone();
        let path = expected.path.clone();

        let looked_up = tokio::task::spawn_blocking(move || inventory.describe(&path))
            .await
            .map_err(|e| OperationError::DeviceMismatch {
                reason: format!("device lookup aborted: {}", e),
            })?
            .map_err(|e| OperationError::DeviceMismatch {
                reason: format!("could not re-read devices: {:#}", e),
            })?;

        let Some(current) = looked_up else {
            return Err(OperationError::DeviceMismatch {
                reason: format!("{} is no longer connected", expected.path.display()),
            });
        };

        if current.size_bytes != expected.size_bytes || current.model != expected.model {
            return Err(OperationError::DeviceMismatch {
                reason: format!(
                    "{} was {} bytes ({}), now {} bytes ({})",
                    expected.path.display(),
                    expected.size_bytes,
                    expected.model,
                    current.size_bytes,
                    current.model
                ),
            });
        }

        Ok(current)
    }

    async fn wait_for_data_partition(
        &self,
        device: &DeviceIdentity,
    ) -> Result<Partition, OperationError> {
        let timeout = Duration::from_secs(self.ctx.config.ventoy.settle_timeout_secs);
        let deadline = Instant::now() + timeout;

        loop {
            let inventory = self.inventory.clone();
            let path = device.path.clone();
            let looked_up = tokio::task::spawn_blocking(move || inventory.describe(&path)).await;

            match looked_up {
                Ok(Ok(Some(current))) => {
                    if let Some(partition) = ventoy::data_partition(&current) {
                        debug!(partition = %partition.path.display(), "Ventoy data partition found");
                        return Ok(partition.clone());
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => debug!(error = %e, "Device lookup failed while settling"),
                Err(e) => debug!(error = %e, "Device lookup aborted while settling"),
            }

            if Instant::now() >= deadline {
                return Err(OperationError::Copy {
                    reason: format!(
                        "Ventoy data partition on {} did not appear within {}s",
                        device.path.display(),
                        timeout.as_secs()
                    ),
                    raw_output: String::new(),
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(SETTLE_POLL) => {}
                _ = self.cancel.cancelled() => {
                    return Err(OperationError::Cancelled { raw_output: String::new() });
                }
            }
        }
    }

    /// Copy the ISO onto the data partition, mounting it first if needed.
    async fn place_image(
        &self,
        image: &Path,
        partition: &Partition,
    ) -> Result<PathBuf, OperationError> {
        if let Some(mount_point) = &partition.mount_point {
            self.emit(
                Stage::CopyingImage,
                Progress::Percent(0),
                format!("Copying {} to {}", image.display(), mount_point.display()),
            )
            .await;
            return ventoy::copy_image(image, mount_point, &self.reporter, &self.cancel).await;
        }

        let mount_dir = tempfile::Builder::new()
            .prefix("isoflash-ventoy-")
            .tempdir()
            .map_err(|e| OperationError::Copy {
                reason: format!("failed to create a mount point: {}", e),
                raw_output: String::new(),
            })?;

        let tools = &self.ctx.config.tools;
        let owner = self
            .ctx
            .runner
            .escalates()
            .then(|| (getuid().as_raw(), getgid().as_raw()));
        let mount = ventoy::mount(tools, &partition.path, mount_dir.path(), owner);
        self.run_tool(ToolStep::Mount, Stage::CopyingImage, &mount, |_| {
            Progress::Indeterminate
        })
        .await?;

        self.emit(
            Stage::CopyingImage,
            Progress::Percent(0),
            format!("Copying {} to {}", image.display(), partition.path.display()),
        )
        .await;
        let copied = ventoy::copy_image(image, mount_dir.path(), &self.reporter, &self.cancel).await;

        // Unmount even after cancellation, the copy is already stopped
        let unmount = ventoy::unmount(tools, mount_dir.path());
        let unmounted = self
            .run_tool_with(
                ToolStep::Mount,
                Stage::CopyingImage,
                &unmount,
                &CancellationToken::new(),
                |_| Progress::Indeterminate,
            )
            .await;

        if let Err(e) = &unmounted {
            // Removing the directory would recurse into the still-mounted drive
            let kept = mount_dir.keep();
            warn!(path = %kept.display(), error = %e, "Leaving mount point in place");
        }

        let dest = copied?;
        unmounted?;
        Ok(dest)
    }

    async fn emit(&self, stage: Stage, progress: Progress, line: impl Into<String>) {
        self.reporter.emit(stage, progress, line).await;
    }

    async fn run_tool<P>(
        &self,
        step: ToolStep,
        stage: Stage,
        tool: &ToolCommand,
        progress_of: P,
    ) -> Result<String, OperationError>
    where
        P: FnMut(&str) -> Progress,
    {
        self.run_tool_with(step, stage, tool, &self.cancel, progress_of)
            .await
    }

    /// Run a privileged tool, turning each output line into a progress event.
    async fn run_tool_with<P>(
        &self,
        step: ToolStep,
        stage: Stage,
        tool: &ToolCommand,
        cancel: &CancellationToken,
        mut progress_of: P,
    ) -> Result<String, OperationError>
    where
        P: FnMut(&str) -> Progress,
    {
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let run = self.ctx.runner.run_privileged(tool, cancel, move |line| {
            let _ = line_tx.send(line.to_string());
        });
        tokio::pin!(run);

        let result = loop {
            tokio::select! {
                Some(line) = line_rx.recv() => {
                    let progress = progress_of(&line);
                    self.emit(stage, progress, line).await;
                }
                result = &mut run => break result,
            }
        };
        while let Ok(line) = line_rx.try_recv() {
            let progress = progress_of(&line);
            self.emit(stage, progress, line).await;
        }

        let program = tool.program_name();
        match result {
            Ok(output) if output.success() => Ok(output.output),
            Ok(output) => Err(classify_tool_failure(
                step,
                format!("{} exited with {}", program, output.status),
                output.output,
            )),
            Err(RunError::Cancelled { output, .. }) => {
                Err(OperationError::Cancelled { raw_output: output })
            }
            Err(RunError::NotFound { program }) => Err(missing_tool(step, program)),
            Err(e @ RunError::Spawn { .. }) => {
                Err(classify_tool_failure(step, e.to_string(), String::new()))
            }
        }
    }
}

fn missing_tool(step: ToolStep, program: String) -> OperationError {
    let reason = format!("{} not found", program);
    match step {
        ToolStep::VentoyInstall => OperationError::InstallerNotFound { reason },
        _ => classify_tool_failure(step, reason, String::new()),
    }
}

/// Size of a readable source image.
async fn source_size(image: &Path) -> Result<u64, OperationError> {
    let not_found = |e: std::io::Error| OperationError::SourceNotFound {
        reason: format!("{}: {}", image.display(), e),
    };

    let file = tokio::fs::File::open(image).await.map_err(not_found)?;
    let metadata = file.metadata().await.map_err(not_found)?;
    if !metadata.is_file() {
        return Err(OperationError::SourceNotFound {
            reason: format!("{} is not a regular file", image.display()),
        });
    }
    Ok(metadata.len())
}
