//! Per-file offset tracking and entry reassembly.
//!
//! Detects rotation by file size: a file now shorter than the recorded
//! offset was truncated or replaced and is re-read from the start.
//!
//! A source may return less than was asked for (read-through reads are
//! capped). The entry being reassembled is then kept per file until the
//! next read either starts a new entry or reaches the end of the file.

use std::collections::HashMap;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::parser::is_new_log_entry;
use super::source::LogSource;
use crate::collector::{CollectorError, StopSignal};
use crate::storage::PositionStore;

/// Reassembly state carried between reads of one file.
#[derive(Debug, Default)]
struct Partial {
    /// Entry being reassembled from continuation lines.
    entry: String,
    /// Head of a line longer than one capped read.
    carry: Vec<u8>,
}

impl Partial {
    fn is_empty(&self) -> bool {
        self.entry.is_empty() && self.carry.is_empty()
    }
}

/// Reads complete log entries appended to a set of files since the last read.
pub struct FileTailer {
    offsets: HashMap<PathBuf, u64>,
    positions: Option<Arc<dyn PositionStore>>,
    partial: HashMap<PathBuf, Partial>,
}

impl FileTailer {
    /// Creates a tailer. Without a position store every run starts at 0.
    pub fn new(positions: Option<Arc<dyn PositionStore>>) -> Self {
        Self {
            offsets: HashMap::new(),
            positions,
            partial: HashMap::new(),
        }
    }

    /// Seeds in-memory offsets for `paths` from the position store.
    pub fn load_positions(&mut self, paths: &[PathBuf]) {
        for path in paths {
            self.offset(path);
        }
    }

    /// Current offset for `path`, consulting the position store on first use.
    pub fn offset(&mut self, path: &Path) -> u64 {
        if let Some(offset) = self.offsets.get(path) {
            return *offset;
        }
        let offset = match &self.positions {
            Some(store) => store.get_position(path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "failed to load position");
                0
            }),
            None => 0,
        };
        self.offsets.insert(path.to_path_buf(), offset);
        offset
    }

    /// Overrides the offset for `path` without persisting it.
    pub fn set_offset(&mut self, path: &Path, offset: u64) {
        self.offsets.insert(path.to_path_buf(), offset);
    }

    /// Reads new complete lines from `path`, calling `on_entry` once per
    /// reassembled log entry.
    ///
    /// A trailing line without a newline at end of file is left for the next
    /// read. The last entry is emitted once the read reaches the file size;
    /// after a short read it waits for more lines. The offset advances by the
    /// bytes consumed and is persisted when non-zero. Returns the number of
    /// bytes consumed.
    pub fn read_file(
        &mut self,
        source: &mut dyn LogSource,
        path: &Path,
        stop: &StopSignal,
        mut on_entry: impl FnMut(&str),
    ) -> Result<u64, CollectorError> {
        let size = source.file_size(path)?;
        let mut partial = self.partial.remove(path).unwrap_or_default();
        let Some(size) = size else {
            // Rotated away: nothing more will follow what was buffered.
            flush(&mut partial.entry, &mut on_entry);
            return Ok(0);
        };

        let mut offset = self.offset(path);
        if size < offset {
            debug!(path = %path.display(), offset, size, "log file rotated, reading from start");
            flush(&mut partial.entry, &mut on_entry);
            partial.carry.clear();
            offset = 0;
            self.offsets.insert(path.to_path_buf(), 0);
        }
        if offset >= size {
            self.keep(path, partial);
            return Ok(0);
        }

        let mut reader = match source.open_at(path, offset, size) {
            Ok(Some(reader)) => reader,
            Ok(None) => {
                flush(&mut partial.entry, &mut on_entry);
                return Ok(0);
            }
            Err(e) => {
                self.keep(path, partial);
                return Err(e);
            }
        };

        let mut consumed = 0u64;
        let mut tail = 0u64;
        let mut failure = None;
        let mut raw = Vec::new();
        while !stop.is_stopped() {
            raw.clear();
            let n = match reader.read_until(b'\n', &mut raw) {
                Ok(n) => n,
                Err(e) => {
                    failure = Some(CollectorError::io(format!("read {}", path.display()), e));
                    break;
                }
            };
            if n == 0 {
                break;
            }
            if raw.last() != Some(&b'\n') {
                tail = n as u64;
                break;
            }
            consumed += n as u64;

            let bytes = if partial.carry.is_empty() {
                mem::take(&mut raw)
            } else {
                partial.carry.extend_from_slice(&raw);
                mem::take(&mut partial.carry)
            };
            let line = String::from_utf8_lossy(&bytes);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                push_line(&mut partial.entry, line, &mut on_entry);
            }
        }
        drop(reader);

        let reached_end = offset + consumed + tail >= size;
        if tail > 0 && !reached_end && failure.is_none() {
            // Cut by the read cap, not by a writer in progress.
            warn!(
                path = %path.display(),
                offset = offset + consumed,
                bytes = tail,
                "log line exceeds read chunk, carrying it over"
            );
            partial.carry.extend_from_slice(&raw);
            consumed += tail;
        }
        if reached_end {
            flush(&mut partial.entry, &mut on_entry);
        }
        self.keep(path, partial);

        if consumed > 0 {
            let new_offset = offset + consumed;
            self.offsets.insert(path.to_path_buf(), new_offset);
            if let Some(store) = &self.positions
                && let Err(e) = store.save_position(path, new_offset)
            {
                warn!(path = %path.display(), error = %e, "failed to save position");
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(consumed),
        }
    }

    fn keep(&mut self, path: &Path, partial: Partial) {
        if !partial.is_empty() {
            self.partial.insert(path.to_path_buf(), partial);
        }
    }
}

fn push_line(entry: &mut String, line: &str, on_entry: &mut impl FnMut(&str)) {
    if is_new_log_entry(line) {
        flush(entry, on_entry);
        entry.push_str(line);
    } else if !entry.is_empty() {
        // Newline, not space: a `--` comment must not swallow the next line.
        entry.push('\n');
        entry.push_str(line.trim());
    }
}

fn flush(entry: &mut String, on_entry: &mut impl FnMut(&str)) {
    if !entry.is_empty() {
        on_entry(entry.as_str());
        entry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::log_collector::mock::MockLogSource;
    use crate::collector::log_collector::source::FsLogSource;
    use crate::storage::MemoryPositionStore;
    use std::io::Write;

    fn collect(tailer: &mut FileTailer, path: &Path) -> (u64, Vec<String>) {
        let mut source = FsLogSource::new();
        let mut entries = Vec::new();
        let consumed = tailer
            .read_file(&mut source, path, &StopSignal::new(), |e| {
                entries.push(e.to_string())
            })
            .unwrap();
        (consumed, entries)
    }

    fn collect_from(
        tailer: &mut FileTailer,
        source: &mut MockLogSource,
        path: &Path,
    ) -> Vec<String> {
        let mut entries = Vec::new();
        tailer
            .read_file(source, path, &StopSignal::new(), |e| entries.push(e.to_string()))
            .unwrap();
        entries
    }

    const STATEMENT_HEAD: &str =
        "2025-01-01 00:00:00.000 UTC [1] LOG:  duration: 1.000 ms  statement: SELECT id\n";
    const STATEMENT_TAIL: &str = "\tFROM accounts WHERE id = 1\n";

    #[test]
    fn test_reads_and_reassembles_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg.log");
        std::fs::write(
            &path,
            "2025-01-01 00:00:00.000 UTC [1] LOG:  statement: SELECT id\n\
             \t-- pick columns\n\
             \tFROM accounts\n\
             2025-01-01 00:00:00.001 UTC [1] LOG:  duration: 1.000 ms\n",
        )
        .unwrap();

        let mut tailer = FileTailer::new(None);
        let (consumed, entries) = collect(&mut tailer, &path);
        assert_eq!(consumed, std::fs::metadata(&path).unwrap().len());
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0],
            "2025-01-01 00:00:00.000 UTC [1] LOG:  statement: SELECT id\n-- pick columns\nFROM accounts"
        );

        let (consumed, entries) = collect(&mut tailer, &path);
        assert_eq!(consumed, 0);
        assert!(entries.is_empty());
    }

    #[test]
    fn test_rotation_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg.log");
        let line = "2025-01-01 00:00:00.000 UTC [1] LOG:  statement: SELECT 42\n";
        std::fs::write(&path, line.repeat(4)).unwrap();
        let size = std::fs::metadata(&path).unwrap().len();
        assert!(size < 500);

        let store = Arc::new(MemoryPositionStore::new());
        store.save_position(&path, 500).unwrap();

        let mut tailer = FileTailer::new(Some(store.clone() as Arc<dyn PositionStore>));
        let (consumed, entries) = collect(&mut tailer, &path);
        assert_eq!(consumed, size);
        assert_eq!(entries.len(), 4);
        assert_eq!(store.get_position(&path).unwrap(), size);
    }

    #[test]
    fn test_partial_line_is_held_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg.log");
        let first = "2025-01-01 00:00:00.000 UTC [1] LOG:  statement: SELECT a FROM t\n";
        std::fs::write(&path, format!("{first}2025-01-01 00:00:01.000 UTC [1] LOG:  dur")).unwrap();

        let mut tailer = FileTailer::new(None);
        let (consumed, entries) = collect(&mut tailer, &path);
        assert_eq!(consumed, first.len() as u64);
        assert_eq!(entries.len(), 1);

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "ation: 2.000 ms").unwrap();
        drop(f);

        let (_, entries) = collect(&mut tailer, &path);
        assert_eq!(
            entries,
            vec!["2025-01-01 00:00:01.000 UTC [1] LOG:  duration: 2.000 ms".to_string()]
        );
    }

    #[test]
    fn test_resumes_from_persisted_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg.log");
        let a = "2025-01-01 00:00:00.000 UTC [1] LOG:  statement: SELECT a FROM t\n";
        let b = "2025-01-01 00:00:01.000 UTC [1] LOG:  statement: SELECT b FROM t\n";
        std::fs::write(&path, a).unwrap();

        let store: Arc<dyn PositionStore> = Arc::new(MemoryPositionStore::new());
        let mut tailer = FileTailer::new(Some(store.clone()));
        collect(&mut tailer, &path);

        std::fs::write(&path, format!("{a}{b}")).unwrap();
        let mut restarted = FileTailer::new(Some(store));
        let (_, entries) = collect(&mut restarted, &path);
        assert_eq!(entries, vec![b.trim_end().to_string()]);
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut tailer = FileTailer::new(None);
        let (consumed, entries) = collect(&mut tailer, &dir.path().join("gone.log"));
        assert_eq!(consumed, 0);
        assert!(entries.is_empty());
    }

    #[test]
    fn test_stopped_signal_reads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg.log");
        std::fs::write(&path, "2025-01-01 00:00:00.000 UTC [1] LOG:  x\n").unwrap();

        let stop = StopSignal::new();
        stop.trigger();
        let mut tailer = FileTailer::new(None);
        let mut source = FsLogSource::new();
        let consumed = tailer
            .read_file(&mut source, &path, &stop, |_| panic!("no entries expected"))
            .unwrap();
        assert_eq!(consumed, 0);
        assert_eq!(tailer.offset(&path), 0);
    }

    #[test]
    fn test_orphan_continuation_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg.log");
        std::fs::write(
            &path,
            "  FROM stray\n2025-01-01 00:00:00.000 UTC [1] LOG:  statement: SELECT 5 FROM t\n",
        )
        .unwrap();

        let mut tailer = FileTailer::new(None);
        let (_, entries) = collect(&mut tailer, &path);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].ends_with("SELECT 5 FROM t"));
    }

    #[test]
    fn test_capped_read_keeps_entry_until_continuation_arrives() {
        let path = Path::new("/logs/postgresql-1.log");
        let mut source = MockLogSource::new(STATEMENT_HEAD.len() as u64 + 5);
        source.append(path, STATEMENT_HEAD);
        source.append(path, STATEMENT_TAIL);

        let mut tailer = FileTailer::new(None);
        let first = collect_from(&mut tailer, &mut source, path);
        assert!(first.is_empty());
        assert_eq!(tailer.offset(path), STATEMENT_HEAD.len() as u64);

        let second = collect_from(&mut tailer, &mut source, path);
        assert_eq!(
            second,
            vec![
                "2025-01-01 00:00:00.000 UTC [1] LOG:  duration: 1.000 ms  statement: SELECT id\n\
                 FROM accounts WHERE id = 1"
                    .to_string()
            ]
        );
        assert_eq!(tailer.offset(path), source.size_of(path));
    }

    #[test]
    fn test_line_longer_than_read_cap_is_carried_over() {
        let path = Path::new("/logs/postgresql-1.log");
        let a = "2025-01-01 00:00:00.000 UTC [1] LOG:  statement: SELECT a, b, c FROM wide_table\n";
        let b = "2025-01-01 00:00:01.000 UTC [2] LOG:  statement: SELECT d, e FROM other_table\n";
        let mut source = MockLogSource::new(16);
        source.append(path, a);
        source.append(path, b);
        let size = source.size_of(path);

        let store = Arc::new(MemoryPositionStore::new());
        let mut tailer = FileTailer::new(Some(store.clone() as Arc<dyn PositionStore>));
        let mut entries = Vec::new();
        for _ in 0..64 {
            if tailer.offset(path) >= size {
                break;
            }
            entries.extend(collect_from(&mut tailer, &mut source, path));
        }

        assert_eq!(entries, vec![a.trim_end().to_string(), b.trim_end().to_string()]);
        assert_eq!(store.get_position(path).unwrap(), size);
    }

    #[test]
    fn test_pending_entries_are_kept_per_file() {
        let a = Path::new("/logs/postgresql-a.log");
        let b = Path::new("/logs/postgresql-b.log");
        let mut source = MockLogSource::new(STATEMENT_HEAD.len() as u64 + 5);
        source.append(a, STATEMENT_HEAD);
        source.append(a, STATEMENT_TAIL);
        source.append(b, "\tFROM stray\n");

        let mut tailer = FileTailer::new(None);
        assert!(collect_from(&mut tailer, &mut source, a).is_empty());
        // Orphan continuation in another file must not extend a's entry.
        assert!(collect_from(&mut tailer, &mut source, b).is_empty());

        let entries = collect_from(&mut tailer, &mut source, a);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].ends_with("SELECT id\nFROM accounts WHERE id = 1"));
    }

    #[test]
    fn test_read_failure_keeps_offset() {
        let path = Path::new("/logs/postgresql-1.log");
        let mut source = MockLogSource::new(1024);
        source.append(path, STATEMENT_HEAD);
        source.fail_reads(path);

        let mut tailer = FileTailer::new(None);
        let err = tailer
            .read_file(&mut source, path, &StopSignal::new(), |_| panic!("no entries expected"))
            .unwrap_err();
        assert!(matches!(err, CollectorError::Query { .. }));
        assert_eq!(tailer.offset(path), 0);
    }
}
