use crate::error::StoreError;
use cellsync_protocol::ChunkRecord;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

const RECORD_EXT: &str = "json";
const TEMP_EXT: &str = "tmp";

/// In-memory chunk index mirrored to one JSON record per chunk.
///
/// The store never validates content; integrity checks happen before
/// [`ChunkStore::put`] is called.
pub struct ChunkStore {
    dir: PathBuf,
    chunks: BTreeMap<String, ChunkRecord>,
}

impl ChunkStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut store = Self {
            dir,
            chunks: BTreeMap::new(),
        };
        store.load_all()?;
        Ok(store)
    }

    /// Rebuilds the index from disk. Unreadable records are skipped.
    pub fn load_all(&mut self) -> Result<usize, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        self.chunks.clear();
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!(dir = %self.dir.display(), error = %e, "Skipping unreadable directory entry");
                    continue;
                }
            };
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            match read_record(&path) {
                Ok(record) => {
                    self.chunks.insert(record.id.clone(), record);
                }
                Err(e) => warn!(error = %e, "Skipping chunk record"),
            }
        }

        info!(
            dir = %self.dir.display(),
            chunks = self.chunks.len(),
            "Chunk store loaded"
        );
        Ok(self.chunks.len())
    }

    /// Inserts or overwrites the chunk, then writes its durable record.
    /// The in-memory entry is kept even when the write fails.
    pub fn put(&mut self, record: ChunkRecord) -> Result<(), StoreError> {
        validate_id(&record.id)?;
        let path = self.record_path(&record.id);
        let result = write_record(&path, &record);
        debug!(chunk = %record.id, bytes = record.data.len(), "Chunk stored");
        self.chunks.insert(record.id.clone(), record);
        result
    }

    pub fn get(&self, chunk_id: &str) -> Option<&ChunkRecord> {
        self.chunks.get(chunk_id)
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.chunks.contains_key(chunk_id)
    }

    /// Snapshot of every held chunk, ordered by id.
    pub fn all_metadata(&self) -> Vec<ChunkRecord> {
        self.chunks.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.chunks.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Replaces the payload of the lowest-id chunk and persists it like any
    /// other write. The declared hash is left as it was.
    pub fn corrupt_first(&mut self, payload: Vec<u8>) -> Option<ChunkRecord> {
        let mut record = self.chunks.values().next()?.clone();
        record.data = payload;
        if let Err(e) = self.put(record.clone()) {
            warn!(chunk = %record.id, error = %e, "Failed to persist corrupted chunk");
        }
        Some(record)
    }

    fn record_path(&self, chunk_id: &str) -> PathBuf {
        self.dir.join(format!("{chunk_id}.{RECORD_EXT}"))
    }
}

/// A chunk id doubles as a record file name, so it must be exactly one
/// plain path component.
fn validate_id(chunk_id: &str) -> Result<(), StoreError> {
    let mut components = Path::new(chunk_id).components();
    let single_name = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    let bad = !single_name
        || chunk_id.contains('/')
        || chunk_id.contains('\\')
        || chunk_id.contains('\0');
    if bad {
        return Err(StoreError::InvalidId(chunk_id.to_string()));
    }
    Ok(())
}

fn read_record(path: &Path) -> Result<ChunkRecord, StoreError> {
    let raw = fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| StoreError::Record {
        path: path.to_path_buf(),
        source,
    })
}

// Temp file + rename so a crash never leaves a truncated record behind.
fn write_record(path: &Path, record: &ChunkRecord) -> Result<(), StoreError> {
    let raw = serde_json::to_vec(record).map_err(|source| StoreError::Record {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension(TEMP_EXT);
    fs::write(&tmp, raw)
        .and_then(|_| fs::rename(&tmp, path))
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}
