use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

use super::error::{FailureKind, OperationError};
use super::hardware::{DeviceIdentity, PartitionTable};

/// A single unit of work submitted to the orchestrator.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub id: Uuid,
    pub operation: Operation,
}

#[derive(Debug, Clone)]
pub enum Operation {
    Reformat {
        device: DeviceIdentity,
        table: PartitionTable,
    },
    FlashDd {
        device: DeviceIdentity,
        image: PathBuf,
    },
    FlashVentoy {
        device: DeviceIdentity,
        image: PathBuf,
    },
    VerifyHash {
        image: PathBuf,
        expected: Option<String>,
    },
}

impl OperationRequest {
    pub fn new(operation: Operation) -> Self {
        Self {
            id: Uuid::now_v7(),
            operation,
        }
    }

    pub fn reformat(device: DeviceIdentity, table: PartitionTable) -> Self {
        Self::new(Operation::Reformat { device, table })
    }

    pub fn flash_dd(device: DeviceIdentity, image: impl Into<PathBuf>) -> Self {
        Self::new(Operation::FlashDd {
            device,
            image: image.into(),
        })
    }

    pub fn flash_ventoy(device: DeviceIdentity, image: impl Into<PathBuf>) -> Self {
        Self::new(Operation::FlashVentoy {
            device,
            image: image.into(),
        })
    }

    pub fn verify_hash(image: impl Into<PathBuf>, expected: Option<String>) -> Self {
        Self::new(Operation::VerifyHash {
            image: image.into(),
            expected,
        })
    }
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reformat { .. } => "reformat",
            Self::FlashDd { .. } => "flash-dd",
            Self::FlashVentoy { .. } => "flash-ventoy",
            Self::VerifyHash { .. } => "verify-hash",
        }
    }
}

/// Lifecycle of a request. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationState {
    Pending,
    Validating,
    Running,
    Succeeded,
    Failed,
}

/// The single result produced for every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OperationResult {
    /// `digest` is set for hash verification.
    Success { digest: Option<String> },
    Failure(Failure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
    pub raw_output: String,
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failure(f) => Some(f),
            Self::Success { .. } => None,
        }
    }
}

impl From<OperationError> for Failure {
    fn from(err: OperationError) -> Self {
        Self {
            kind: err.kind(),
            reason: err.to_string(),
            raw_output: err.raw_output().to_string(),
        }
    }
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { digest: Some(d) } => write!(f, "success (sha256 {})", d),
            Self::Success { digest: None } => write!(f, "success"),
            Self::Failure(failure) => write!(f, "failed: {}", failure.reason),
        }
    }
}
