pub mod catalog;
pub mod error;
pub mod hardware;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod tools;
pub mod verifier;

pub use catalog::{Catalog, CatalogEntry};
pub use error::{FailureKind, OperationError};
pub use hardware::{BlockDevice, DeviceIdentity, DeviceInventory, Partition, PartitionTable};
pub use models::{Failure, Operation, OperationRequest, OperationResult, OperationState};
pub use orchestrator::{OperationHandle, Orchestrator};
pub use progress::{ActiveOperations, Progress, ProgressEvent, Stage};
pub use verifier::VerifyOutcome;
