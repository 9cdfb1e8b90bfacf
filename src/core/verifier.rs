use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::OperationError;
use super::progress::{Progress, ProgressReporter, Stage};

/// Buffer size for streaming reads (128KB keeps memory flat for any image size)
const BUFFER_SIZE: usize = 128 * 1024;

/// Bytes hashed between progress updates
const PROGRESS_UPDATE_INTERVAL: u64 = 8 * 1024 * 1024;

/// Outcome of hashing an image and optionally comparing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Match { digest: String },
    Mismatch { computed: String, expected: String },
    /// No expected value was supplied; the digest is reported as-is.
    Unchecked { digest: String },
}

/// Case-insensitive hex comparison, ignoring surrounding whitespace.
pub fn digests_match(computed: &str, expected: &str) -> bool {
    computed.trim().eq_ignore_ascii_case(expected.trim())
}

/// Hash `image` and compare against `expected` if given.
pub async fn verify_image(
    image: &Path,
    expected: Option<&str>,
    reporter: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<VerifyOutcome, OperationError> {
    let digest = hash_image(image, reporter, cancel).await?;

    let outcome = match expected {
        Some(expected) if digests_match(&digest, expected) => {
            info!(image = %image.display(), %digest, "Image hash matches");
            VerifyOutcome::Match { digest }
        }
        Some(expected) => {
            warn!(
                image = %image.display(),
                computed = %digest,
                expected = %expected.trim(),
                "Image hash does not match expected value"
            );
            VerifyOutcome::Mismatch {
                computed: digest,
                expected: expected.trim().to_string(),
            }
        }
        None => {
            info!(image = %image.display(), %digest, "Image hashed without comparison");
            VerifyOutcome::Unchecked { digest }
        }
    };

    Ok(outcome)
}

/// Compute the lowercase hex SHA-256 of `image`, streaming in fixed chunks.
pub async fn hash_image(
    image: &Path,
    reporter: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<String, OperationError> {
    let image = image.to_path_buf();
    let reporter = reporter.clone();
    let cancel = cancel.clone();

    // Run hashing in a blocking task since it's I/O heavy
    tokio::task::spawn_blocking(move || hash_file_sync(&image, &reporter, &cancel))
        .await
        .map_err(|e| OperationError::SourceNotFound {
            reason: format!("hashing task aborted: {}", e),
        })?
}

fn hash_file_sync(
    path: &Path,
    reporter: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<String, OperationError> {
    let file = File::open(path).map_err(|e| OperationError::SourceNotFound {
        reason: format!("{}: {}", path.display(), e),
    })?;
    let total = file.metadata().map(|m| m.len()).unwrap_or(0);

    debug!(path = %path.display(), total_bytes = total, "Hashing image");

    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut hashed: u64 = 0;
    let mut last_update: u64 = 0;

    reporter.blocking_emit(
        Stage::Hashing,
        Progress::ratio(0, total),
        format!("Computing SHA-256 of {}", path.display()),
    );

    loop {
        if cancel.is_cancelled() {
            return Err(OperationError::Cancelled {
                raw_output: String::new(),
            });
        }

        let n = reader.read(&mut buffer).map_err(|e| OperationError::SourceNotFound {
            reason: format!("failed reading {}: {}", path.display(), e),
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        hashed += n as u64;

        if hashed - last_update >= PROGRESS_UPDATE_INTERVAL {
            reporter.blocking_emit(
                Stage::Hashing,
                Progress::ratio(hashed, total),
                format!("{} of {} bytes hashed", hashed, total),
            );
            last_update = hashed;
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}
