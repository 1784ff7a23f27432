//! Log file access strategies.
//!
//! `FsLogSource` reads the log directory directly. `PgReadFileSource` reads it
//! through the monitored server (`pg_ls_dir` / `pg_read_binary_file`), for
//! hosts where the directory is not locally readable.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use postgres::Client;
use tracing::debug;

use crate::collector::error::{LOCAL_READ_GUIDANCE, READ_SERVER_FILES_GUIDANCE};
use crate::collector::CollectorError;
use crate::pg::format_postgres_error;

/// Upper bound on bytes fetched by one read-through call.
pub const READ_THROUGH_CHUNK: u64 = 1024 * 1024;

/// Uniform access to log files, whichever way they are reached.
pub trait LogSource: Send {
    /// Files in `dir` whose names match the glob `pattern`, oldest first.
    fn list_files(&mut self, dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, CollectorError>;

    /// Current size of `path`, or `None` if it no longer exists.
    fn file_size(&mut self, path: &Path) -> Result<Option<u64>, CollectorError>;

    /// Opens `path` for reading the byte range `[offset, size)`.
    ///
    /// A source may return fewer bytes than requested. Returns `None` if the
    /// file disappeared since it was stat'd.
    fn open_at(
        &mut self,
        path: &Path,
        offset: u64,
        size: u64,
    ) -> Result<Option<Box<dyn BufRead + '_>>, CollectorError>;
}

/// Direct filesystem access.
#[derive(Debug, Default)]
pub struct FsLogSource;

impl FsLogSource {
    pub fn new() -> Self {
        Self
    }
}

fn fs_error(context: String, e: io::Error) -> CollectorError {
    if e.kind() == io::ErrorKind::PermissionDenied {
        CollectorError::PermissionDenied {
            message: format!("{context}: {e}"),
            guidance: LOCAL_READ_GUIDANCE.to_string(),
        }
    } else {
        CollectorError::io(context, e)
    }
}

impl LogSource for FsLogSource {
    fn list_files(&mut self, dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, CollectorError> {
        match fs::read_dir(dir) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(fs_error(format!("read_dir {}", dir.display()), e)),
        }

        let full = dir.join(pattern);
        let full = full.to_string_lossy();
        let paths = glob::glob(&full).map_err(|e| CollectorError::Pattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;

        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in paths {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    debug!(path = %e.path().display(), error = %e.error(), "glob entry skipped");
                    continue;
                }
            };
            // Rotated away between listing and stat.
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((mtime, path));
        }

        files.sort();
        Ok(files.into_iter().map(|(_, p)| p).collect())
    }

    fn file_size(&mut self, path: &Path) -> Result<Option<u64>, CollectorError> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(fs_error(format!("stat {}", path.display()), e)),
        }
    }

    fn open_at(
        &mut self,
        path: &Path,
        offset: u64,
        size: u64,
    ) -> Result<Option<Box<dyn BufRead + '_>>, CollectorError> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(fs_error(format!("open {}", path.display()), e)),
        };
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| fs_error(format!("seek {}", path.display()), e))?;

        let len = size.saturating_sub(offset);
        Ok(Some(Box::new(BufReader::new(file.take(len)))))
    }
}

/// Read-through access via server-side file functions.
///
/// Requires superuser or the `pg_read_server_files` role.
pub struct PgReadFileSource {
    client: Client,
}

impl PgReadFileSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Returns the underlying connection.
    pub fn into_client(self) -> Client {
        self.client
    }
}

/// Maps a server error to a collector error, attaching role guidance to
/// privilege failures.
fn pg_error(context: &str, e: &postgres::Error) -> CollectorError {
    let message = format_postgres_error(e);
    let lower = message.to_lowercase();
    if lower.contains("permission denied") || lower.contains("must be superuser") {
        CollectorError::PermissionDenied {
            message: format!("{context}: {message}"),
            guidance: READ_SERVER_FILES_GUIDANCE.to_string(),
        }
    } else {
        CollectorError::Query {
            context: context.to_string(),
            message,
        }
    }
}

impl LogSource for PgReadFileSource {
    fn list_files(&mut self, dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, CollectorError> {
        let matcher = glob::Pattern::new(pattern).map_err(|e| CollectorError::Pattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        let dir_str = dir.to_string_lossy().into_owned();

        let mut tx = self
            .client
            .transaction()
            .map_err(|e| pg_error("pg_ls_dir", &e))?;
        tx.batch_execute("/* pgqstat */ SET LOCAL statement_timeout = '10s'")
            .map_err(|e| pg_error("pg_ls_dir", &e))?;
        let rows = tx
            .query("/* pgqstat */ SELECT name FROM pg_ls_dir($1) AS name", &[&dir_str])
            .map_err(|e| pg_error("pg_ls_dir", &e))?;
        tx.commit().map_err(|e| pg_error("pg_ls_dir", &e))?;

        let mut names: Vec<String> = rows
            .iter()
            .filter_map(|row| row.try_get::<_, String>(0).ok())
            .filter(|name| matcher.matches(name))
            .collect();
        // PostgreSQL log names embed their creation time.
        names.sort();

        Ok(names.into_iter().map(|n| dir.join(n)).collect())
    }

    fn file_size(&mut self, path: &Path) -> Result<Option<u64>, CollectorError> {
        let path_str = path.to_string_lossy().into_owned();
        let row = self
            .client
            .query_one("/* pgqstat */ SELECT (pg_stat_file($1, true)).size", &[&path_str])
            .map_err(|e| pg_error("pg_stat_file", &e))?;
        let size: Option<i64> = row.try_get(0).map_err(|e| pg_error("pg_stat_file", &e))?;
        Ok(size.map(|s| s.max(0) as u64))
    }

    fn open_at(
        &mut self,
        path: &Path,
        offset: u64,
        size: u64,
    ) -> Result<Option<Box<dyn BufRead + '_>>, CollectorError> {
        let path_str = path.to_string_lossy().into_owned();
        let remaining = size.saturating_sub(offset);
        let len = remaining.min(READ_THROUGH_CHUNK);
        let capped = len < remaining;
        let (offset, len) = (offset as i64, len as i64);

        let row = self
            .client
            .query_one(
                "/* pgqstat */ SELECT pg_read_binary_file($1, $2, $3, true)",
                &[&path_str, &offset, &len],
            )
            .map_err(|e| pg_error("pg_read_binary_file", &e))?;
        let chunk: Option<Vec<u8>> = row
            .try_get(0)
            .map_err(|e| pg_error("pg_read_binary_file", &e))?;

        let Some(mut bytes) = chunk else {
            return Ok(None);
        };
        trim_capped_chunk(&mut bytes, capped);
        Ok(Some(Box::new(Cursor::new(bytes))))
    }
}

/// Cuts a read that stopped short of the requested size back to its last
/// complete line.
///
/// Uncapped reads are left whole so a fragment at end of file stays visible
/// to the reader. A capped read holding no newline is one line longer than
/// the cap and is left whole too; the reader carries it over.
pub fn trim_capped_chunk(bytes: &mut Vec<u8>, capped: bool) {
    let complete = complete_lines_len(bytes);
    if capped && complete > 0 {
        bytes.truncate(complete);
    }
}

/// Length of the prefix of `bytes` ending at the last newline.
pub fn complete_lines_len(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0)
}
