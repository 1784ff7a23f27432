//! In-memory log source for testing the tailer and collector without a
//! server.
//!
//! `MockLogSource` behaves like read-through access: each read returns at
//! most `cap` bytes, trimmed back to the last complete line the same way
//! `PgReadFileSource` trims its chunks.

use std::collections::{BTreeMap, HashSet};
use std::io::{BufRead, Cursor};
use std::path::{Path, PathBuf};

use super::source::{LogSource, trim_capped_chunk};
use crate::collector::CollectorError;

/// In-memory log files with a per-read byte cap.
#[derive(Debug, Clone)]
pub struct MockLogSource {
    files: BTreeMap<PathBuf, Vec<u8>>,
    failing: HashSet<PathBuf>,
    cap: u64,
}

impl MockLogSource {
    /// Creates an empty source returning at most `cap` bytes per read.
    pub fn new(cap: u64) -> Self {
        Self {
            files: BTreeMap::new(),
            failing: HashSet::new(),
            cap,
        }
    }

    /// Appends `content` to `path`, creating the file if needed.
    pub fn append(&mut self, path: impl AsRef<Path>, content: &str) {
        self.files
            .entry(path.as_ref().to_path_buf())
            .or_default()
            .extend_from_slice(content.as_bytes());
    }

    /// Makes every read of `path` fail.
    pub fn fail_reads(&mut self, path: impl AsRef<Path>) {
        self.failing.insert(path.as_ref().to_path_buf());
    }

    pub fn size_of(&self, path: impl AsRef<Path>) -> u64 {
        self.files
            .get(path.as_ref())
            .map_or(0, |content| content.len() as u64)
    }
}

impl LogSource for MockLogSource {
    fn list_files(&mut self, dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, CollectorError> {
        let matcher = glob::Pattern::new(pattern).map_err(|e| CollectorError::Pattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        Ok(self
            .files
            .keys()
            .filter(|path| path.parent() == Some(dir))
            .filter(|path| {
                path.file_name()
                    .is_some_and(|name| matcher.matches(&name.to_string_lossy()))
            })
            .cloned()
            .collect())
    }

    fn file_size(&mut self, path: &Path) -> Result<Option<u64>, CollectorError> {
        Ok(self.files.get(path).map(|content| content.len() as u64))
    }

    fn open_at(
        &mut self,
        path: &Path,
        offset: u64,
        size: u64,
    ) -> Result<Option<Box<dyn BufRead + '_>>, CollectorError> {
        if self.failing.contains(path) {
            return Err(CollectorError::Query {
                context: "pg_read_binary_file".to_string(),
                message: format!("could not read file \"{}\"", path.display()),
            });
        }
        let Some(content) = self.files.get(path) else {
            return Ok(None);
        };

        let end = size.min(content.len() as u64);
        let remaining = end.saturating_sub(offset);
        let len = remaining.min(self.cap);
        let start = offset.min(end) as usize;
        let mut bytes = content[start..start + len as usize].to_vec();
        trim_capped_chunk(&mut bytes, len < remaining);
        Ok(Some(Box::new(Cursor::new(bytes))))
    }
}
