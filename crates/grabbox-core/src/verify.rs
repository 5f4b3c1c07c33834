//! Post-transfer verification.

use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{CoreError, Result};

const READ_CHUNK: usize = 64 * 1024;

/// Confirm the file on disk is exactly `expected_size` bytes and fully
/// readable. The sequential read catches I/O-level truncation or
/// corruption a size check alone would miss. The caller deletes the
/// file on failure; this function never does.
pub async fn verify(path: &Path, expected_size: u64) -> Result<()> {
    let metadata = tokio::fs::metadata(path).await?;
    if metadata.len() != expected_size {
        return Err(CoreError::SizeMismatch {
            expected: expected_size,
            actual: metadata.len(),
        });
    }

    let mut file = File::open(path).await?;
    let mut buf = vec![0u8; READ_CHUNK];
    let mut read_total = 0u64;
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| CoreError::Integrity(e.to_string()))?;
        if n == 0 {
            break;
        }
        read_total += n as u64;
    }

    if read_total != expected_size {
        return Err(CoreError::Integrity(format!(
            "short read: {read_total} of {expected_size} bytes"
        )));
    }
    Ok(())
}
