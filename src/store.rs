use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::PersistError;
use crate::fingerprint::Fingerprint;
use crate::types::Snapshot;

/// File name of the persisted seen-fingerprint list inside the state dir.
pub const FINGERPRINTS_FILE: &str = "seen_fingerprints.json";

/// Durable last-known state: one snapshot per entity, plus the seen set.
///
/// A missing entry is `Ok(None)` / an empty list, never an error.
pub trait StateStore: Send + Sync {
    fn load(&self, entity_id: &str) -> Result<Option<Snapshot>, PersistError>;

    /// Replace the entity's snapshot. No history is kept.
    fn save(&self, entity_id: &str, snapshot: &Snapshot) -> Result<(), PersistError>;

    fn load_fingerprints(&self) -> Result<Vec<Fingerprint>, PersistError>;

    fn save_fingerprints(&self, fingerprints: &[Fingerprint]) -> Result<(), PersistError>;
}

/// Pretty-printed JSON files under one directory: `<entity_id>.json` per
/// entity and `seen_fingerprints.json` for the seen set.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) the state directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| PersistError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self, entity_id: &str) -> PathBuf {
        self.dir.join(format!("{entity_id}.json"))
    }

    fn fingerprints_path(&self) -> PathBuf {
        self.dir.join(FINGERPRINTS_FILE)
    }

    /// Read a file, mapping "not found" to `None`.
    fn read_optional(path: &Path) -> Result<Option<String>, PersistError> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Write to a sibling temp file, then rename over the target.
    fn write_atomic(path: &Path, contents: &str) -> Result<(), PersistError> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents).map_err(|source| PersistError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl StateStore for FileStore {
    fn load(&self, entity_id: &str) -> Result<Option<Snapshot>, PersistError> {
        let path = self.snapshot_path(entity_id);
        let Some(contents) = Self::read_optional(&path)? else {
            debug!("[{entity_id}] no stored snapshot at {}", path.display());
            return Ok(None);
        };
        let snapshot =
            serde_json::from_str(&contents).map_err(|source| PersistError::Decode { path, source })?;
        Ok(Some(snapshot))
    }

    fn save(&self, entity_id: &str, snapshot: &Snapshot) -> Result<(), PersistError> {
        let path = self.snapshot_path(entity_id);
        let contents = serde_json::to_string_pretty(snapshot).map_err(|source| {
            PersistError::Encode {
                path: path.clone(),
                source,
            }
        })?;
        Self::write_atomic(&path, &contents)
    }

    fn load_fingerprints(&self) -> Result<Vec<Fingerprint>, PersistError> {
        let path = self.fingerprints_path();
        let Some(contents) = Self::read_optional(&path)? else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&contents).map_err(|source| PersistError::Decode { path, source })
    }

    fn save_fingerprints(&self, fingerprints: &[Fingerprint]) -> Result<(), PersistError> {
        let path = self.fingerprints_path();
        let contents = serde_json::to_string_pretty(fingerprints).map_err(|source| {
            PersistError::Encode {
                path: path.clone(),
                source,
            }
        })?;
        Self::write_atomic(&path, &contents)
    }
}

/// Process-local store for `--ephemeral` runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<String, Snapshot>>,
    fingerprints: Mutex<Vec<Fingerprint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn load(&self, entity_id: &str) -> Result<Option<Snapshot>, PersistError> {
        let snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(snapshots.get(entity_id).cloned())
    }

    fn save(&self, entity_id: &str, snapshot: &Snapshot) -> Result<(), PersistError> {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        snapshots.insert(entity_id.to_string(), snapshot.clone());
        Ok(())
    }

    fn load_fingerprints(&self) -> Result<Vec<Fingerprint>, PersistError> {
        let fps = self.fingerprints.lock().unwrap_or_else(|e| e.into_inner());
        Ok(fps.clone())
    }

    fn save_fingerprints(&self, fingerprints: &[Fingerprint]) -> Result<(), PersistError> {
        let mut fps = self.fingerprints.lock().unwrap_or_else(|e| e.into_inner());
        *fps = fingerprints.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::position;

    fn snapshot() -> Snapshot {
        Snapshot::new(vec![
            position("Will it rain?", "Yes", 10.0, 0.55),
            position("Will it rain?", "No", 5.0, 0.45),
        ])
    }

    #[test]
    fn file_store_missing_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.load("nobody").unwrap().is_none());
        assert!(store.load_fingerprints().unwrap().is_empty());
    }

    #[test]
    fn file_store_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let snap = snapshot();
        store.save("whale-1", &snap).unwrap();
        assert_eq!(store.load("whale-1").unwrap(), Some(snap));
        // No leftover temp file.
        assert!(!dir.path().join("whale-1.json.tmp").exists());
    }

    #[test]
    fn file_store_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save("whale-1", &snapshot()).unwrap();
        let smaller = Snapshot::new(vec![position("M", "Yes", 1.0, 0.5)]);
        store.save("whale-1", &smaller).unwrap();
        assert_eq!(store.load("whale-1").unwrap().unwrap().len(), 1);
    }

    #[test]
    fn file_store_is_human_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save("whale-1", &snapshot()).unwrap();
        let raw = fs::read_to_string(dir.path().join("whale-1.json")).unwrap();
        assert!(raw.contains("\"market\": \"Will it rain?\""));
        assert!(raw.contains('\n'));
    }

    #[test]
    fn file_store_corrupt_snapshot_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("whale-1.json"), "{not json").unwrap();
        assert!(matches!(
            store.load("whale-1"),
            Err(PersistError::Decode { .. })
        ));
    }

    #[test]
    fn file_store_fingerprints_are_flat_strings() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let fps = vec![
            Fingerprint::from("w|M|Yes|0.5000|30".to_string()),
            Fingerprint::from("w|M|No|0.5000|60".to_string()),
        ];
        store.save_fingerprints(&fps).unwrap();
        let raw = fs::read_to_string(dir.path().join(FINGERPRINTS_FILE)).unwrap();
        let parsed: Vec<String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, vec!["w|M|Yes|0.5000|30", "w|M|No|0.5000|60"]);
        assert_eq!(store.load_fingerprints().unwrap(), fps);
    }

    #[test]
    fn file_store_creates_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        let store = FileStore::open(&nested).unwrap();
        store.save("x", &snapshot()).unwrap();
        assert!(nested.join("x.json").exists());
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.load("w").unwrap().is_none());
        store.save("w", &snapshot()).unwrap();
        assert_eq!(store.load("w").unwrap().unwrap().len(), 2);
        store
            .save_fingerprints(&[Fingerprint::from("a".to_string())])
            .unwrap();
        assert_eq!(store.load_fingerprints().unwrap().len(), 1);
    }
}
