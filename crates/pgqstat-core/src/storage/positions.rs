//! Read-offset persistence.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{PositionStore, StoreError};

const POSITIONS_VERSION: u16 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PositionsFile {
    version: u16,
    positions: BTreeMap<String, u64>,
}

/// Offsets persisted to a single postcard-encoded file.
///
/// Each save rewrites the whole map to `<file>.tmp` and renames it into place.
pub struct FilePositionStore {
    path: PathBuf,
    positions: Mutex<BTreeMap<String, u64>>,
}

impl FilePositionStore {
    /// Opens the store at `path`. A missing file starts an empty store; an
    /// unreadable or foreign-version file is discarded with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        // Leftover from an interrupted save.
        let tmp = tmp_path(&path);
        match fs::remove_file(&tmp) {
            Ok(()) => debug!(path = %tmp.display(), "removed stale positions tmp file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %tmp.display(), error = %e, "failed to remove stale positions tmp file"),
        }

        let positions = match fs::read(&path) {
            Ok(bytes) => match postcard::from_bytes::<PositionsFile>(&bytes) {
                Ok(file) if file.version == POSITIONS_VERSION => file.positions,
                Ok(file) => {
                    warn!(path = %path.display(), version = file.version, "unsupported positions file version, starting fresh");
                    BTreeMap::new()
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt positions file, starting fresh");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StoreError::io(format!("read {}", path.display()), e)),
        };

        debug!(path = %path.display(), files = positions.len(), "positions loaded");
        Ok(Self {
            path,
            positions: Mutex::new(positions),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, u64>> {
        self.positions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, positions: &BTreeMap<String, u64>) -> Result<(), StoreError> {
        let file = PositionsFile {
            version: POSITIONS_VERSION,
            positions: positions.clone(),
        };
        let bytes = postcard::to_allocvec(&file).map_err(|e| StoreError::Encode(e.to_string()))?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::io(format!("create {}", parent.display()), e))?;
        }

        let tmp = tmp_path(&self.path);
        let mut out = fs::File::create(&tmp)
            .map_err(|e| StoreError::io(format!("create {}", tmp.display()), e))?;
        out.write_all(&bytes)
            .and_then(|_| out.sync_all())
            .map_err(|e| StoreError::io(format!("write {}", tmp.display()), e))?;
        drop(out);

        fs::rename(&tmp, &self.path)
            .map_err(|e| StoreError::io(format!("rename {}", tmp.display()), e))
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl PositionStore for FilePositionStore {
    fn get_position(&self, path: &Path) -> Result<u64, StoreError> {
        Ok(self.lock().get(&key(path)).copied().unwrap_or(0))
    }

    fn save_position(&self, path: &Path, offset: u64) -> Result<(), StoreError> {
        let mut positions = self.lock();
        positions.insert(key(path), offset);
        self.write(&positions)
    }

    fn reset(&self) -> Result<(), StoreError> {
        let mut positions = self.lock();
        positions.clear();
        self.write(&positions)
    }
}

/// In-process offsets, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    positions: Mutex<BTreeMap<PathBuf, u64>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PositionStore for MemoryPositionStore {
    fn get_position(&self, path: &Path) -> Result<u64, StoreError> {
        let positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(positions.get(path).copied().unwrap_or(0))
    }

    fn save_position(&self, path: &Path, offset: u64) -> Result<(), StoreError> {
        let mut positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        positions.insert(path.to_path_buf(), offset);
        Ok(())
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.positions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}
