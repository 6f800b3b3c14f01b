// Single-pass zero overwrite
//
// Writes zeros over the whole addressable range in fixed chunks, then syncs.
// Progress is reported in whole percent, only when it changes.

use crate::{WipeError, WipeResult};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

pub fn zero_fill(
    path: &Path,
    len: u64,
    chunk_bytes: usize,
    progress: &mut dyn FnMut(u8),
) -> WipeResult<()> {
    if chunk_bytes == 0 {
        return Err(WipeError::Config("overwrite chunk size must be non-zero".to_string()));
    }

    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| WipeError::Execution(format!("cannot open {}: {}", path.display(), e)))?;
    file.seek(SeekFrom::Start(0))?;

    let buffer = vec![0u8; chunk_bytes];
    let mut written: u64 = 0;
    let mut last_percent = None;
    progress(0);

    while written < len {
        let remaining = (len - written).min(chunk_bytes as u64) as usize;
        file.write_all(&buffer[..remaining]).map_err(|e| {
            WipeError::Execution(format!(
                "write failed at offset {} on {}: {}",
                written,
                path.display(),
                e
            ))
        })?;
        written += remaining as u64;

        let percent = ((written as u128 * 100) / len as u128) as u8;
        if last_percent != Some(percent) {
            last_percent = Some(percent);
            progress(percent);
        }
    }

    file.sync_all()
        .map_err(|e| WipeError::Execution(format!("sync failed on {}: {}", path.display(), e)))?;
    tracing::debug!(path = %path.display(), bytes = written, "Zero fill complete");

    progress(100);
    Ok(())
}
