//! Failure taxonomy for device operations.
//!
//! Every variant carries a human-readable reason plus whatever raw diagnostic
//! text the external tool produced, so callers can show both.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("device changed since it was listed: {reason}")]
    DeviceMismatch { reason: String },

    #[error("device is busy: {reason}")]
    DeviceBusy { reason: String, raw_output: String },

    #[error("insufficient privileges: {reason}")]
    Permission { reason: String, raw_output: String },

    #[error("source image not readable: {reason}")]
    SourceNotFound { reason: String },

    #[error("write failed: {reason}")]
    Write { reason: String, raw_output: String },

    #[error("Ventoy installer not found: {reason}")]
    InstallerNotFound { reason: String },

    #[error("Ventoy installation failed: {reason}")]
    Install { reason: String, raw_output: String },

    #[error("copy to Ventoy drive failed: {reason}")]
    Copy { reason: String, raw_output: String },

    #[error("operation cancelled; the device may be left in an undefined state")]
    Cancelled { raw_output: String },
}

/// Classification of a failed request, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    DeviceMismatch,
    DeviceBusy,
    Permission,
    SourceNotFound,
    Write,
    InstallerNotFound,
    Install,
    Copy,
    HashMismatch { computed: String, expected: String },
    Cancelled,
    Internal,
}

impl OperationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::DeviceMismatch { .. } => FailureKind::DeviceMismatch,
            Self::DeviceBusy { .. } => FailureKind::DeviceBusy,
            Self::Permission { .. } => FailureKind::Permission,
            Self::SourceNotFound { .. } => FailureKind::SourceNotFound,
            Self::Write { .. } => FailureKind::Write,
            Self::InstallerNotFound { .. } => FailureKind::InstallerNotFound,
            Self::Install { .. } => FailureKind::Install,
            Self::Copy { .. } => FailureKind::Copy,
            Self::Cancelled { .. } => FailureKind::Cancelled,
        }
    }

    pub fn raw_output(&self) -> &str {
        match self {
            Self::DeviceBusy { raw_output, .. }
            | Self::Permission { raw_output, .. }
            | Self::Write { raw_output, .. }
            | Self::Install { raw_output, .. }
            | Self::Copy { raw_output, .. }
            | Self::Cancelled { raw_output } => raw_output,
            Self::DeviceMismatch { .. }
            | Self::SourceNotFound { .. }
            | Self::InstallerNotFound { .. } => "",
        }
    }

    pub fn busy(reason: impl Into<String>) -> Self {
        Self::DeviceBusy {
            reason: reason.into(),
            raw_output: String::new(),
        }
    }

    pub fn permission(reason: impl Into<String>) -> Self {
        Self::Permission {
            reason: reason.into(),
            raw_output: String::new(),
        }
    }
}

/// The step that invoked a failing tool. Decides the fallback kind when the
/// tool's diagnostics don't point at privileges or a busy device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStep {
    Partition,
    BlockCopy,
    VentoyInstall,
    Mount,
}

const PERMISSION_MARKERS: &[&str] = &[
    "permission denied",
    "operation not permitted",
    "password is required",
    "must be root",
    "must be run as root",
    "not in the sudoers",
];

const BUSY_MARKERS: &[&str] = &[
    "device or resource busy",
    "is mounted",
    "in use",
    "target is busy",
];

/// Map a failed tool run onto the taxonomy using its diagnostic text.
pub fn classify_tool_failure(step: ToolStep, reason: String, raw_output: String) -> OperationError {
    let lowered = raw_output.to_lowercase();

    if PERMISSION_MARKERS.iter().any(|m| lowered.contains(m)) {
        return OperationError::Permission { reason, raw_output };
    }
    if BUSY_MARKERS.iter().any(|m| lowered.contains(m)) {
        return OperationError::DeviceBusy { reason, raw_output };
    }

    match step {
        ToolStep::Partition | ToolStep::BlockCopy => OperationError::Write { reason, raw_output },
        ToolStep::VentoyInstall => OperationError::Install { reason, raw_output },
        ToolStep::Mount => OperationError::Copy { reason, raw_output },
    }
}
