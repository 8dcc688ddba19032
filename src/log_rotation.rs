//! Log rotation for per-VM log and metrics files.
//!
//! Rotated logs follow the pattern: `filename.1`, `filename.2`, etc. The
//! drain tasks reopen their output file once it has been renamed away, so a
//! rotation never loses lines.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Size threshold and retention for rotated files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationPolicy {
    /// Rotate once a file reaches this many bytes.
    pub max_bytes: u64,
    /// Number of rotated generations to keep.
    pub max_files: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            max_files: 3,
        }
    }
}

impl RotationPolicy {
    /// Rotate a log file if it exceeds the size limit.
    ///
    /// With `max_files = 3`:
    /// - Current log -> `log.1`
    /// - `log.1` -> `log.2`
    /// - `log.2` -> `log.3`
    /// - `log.3` -> deleted
    ///
    /// Returns `Ok(true)` if rotation occurred, `Ok(false)` if no rotation needed.
    pub fn rotate_if_needed(&self, log_path: &Path) -> io::Result<bool> {
        let metadata = match fs::metadata(log_path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        if metadata.len() < self.max_bytes {
            return Ok(false);
        }

        self.rotate(log_path)?;
        Ok(true)
    }

    /// Force rotate a log file regardless of size.
    pub fn rotate(&self, log_path: &Path) -> io::Result<()> {
        let max = self.max_files.max(1);

        let oldest = generation(log_path, max);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        for i in (1..max).rev() {
            let from = generation(log_path, i);
            if from.exists() {
                fs::rename(&from, generation(log_path, i + 1))?;
            }
        }

        fs::rename(log_path, generation(log_path, 1))
    }

    /// Get the total size of all log files (current + rotated).
    pub fn total_size(&self, log_path: &Path) -> u64 {
        std::iter::once(log_path.to_path_buf())
            .chain((1..=self.max_files).map(|i| generation(log_path, i)))
            .filter_map(|p| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }
}

/// Path of the `n`th rotated generation of `log_path`.
fn generation(log_path: &Path, n: usize) -> PathBuf {
    let mut name = log_path.as_os_str().to_os_string();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}
