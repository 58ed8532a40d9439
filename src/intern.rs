//! Path interning: every source path the daemon ever sees is assigned a
//! dense 32-bit id, so symbols and references can be stored under
//! fixed-width keys.
//!
//! Assignment is persistent: the full table is serialized to the
//! `fileids` blob at shutdown and reloaded at startup, so a path keeps
//! its id across daemon restarts. Ids are never reused.

use crate::error::{IndexError, IndexResult};
use crate::types::{FileId, Location};
use crate::DATABASE_VERSION;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    by_path: HashMap<PathBuf, FileId>,
    // Index 0 is the invalid sentinel and stays empty.
    by_id: Vec<PathBuf>,
}

/// Bidirectional `Path <-> FileId` map with a monotonic counter.
///
/// The hot path is id lookup, which takes the lock shared; only first
/// sight of a new path takes it exclusively.
#[derive(Debug, Default)]
pub struct LocationInterner {
    tables: RwLock<Tables>,
}

impl LocationInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id for `path`, assigning the next one on first sight.
    pub fn insert_file(&self, path: &Path) -> FileId {
        if let Some(id) = self.file_id(path) {
            return id;
        }
        let mut tables = self.tables.write().unwrap();
        if let Some(id) = tables.by_path.get(path) {
            return *id;
        }
        if tables.by_id.is_empty() {
            tables.by_id.push(PathBuf::new());
        }
        let id = FileId::new(tables.by_id.len() as u32).unwrap();
        tables.by_id.push(path.to_path_buf());
        tables.by_path.insert(path.to_path_buf(), id);
        id
    }

    /// Lookup without assignment; `None` when the path has never been seen.
    pub fn file_id(&self, path: &Path) -> Option<FileId> {
        self.tables.read().unwrap().by_path.get(path).copied()
    }

    /// Path for a previously assigned id.
    ///
    /// Panics on an id that was never handed out; such an id can only
    /// come from corrupted state, never from this interner.
    pub fn path(&self, id: FileId) -> PathBuf {
        let tables = self.tables.read().unwrap();
        tables.by_id[id.value() as usize].clone()
    }

    /// Convenience for building a location from path + offset.
    pub fn location(&self, path: &Path, offset: u32) -> Location {
        Location::new(self.insert_file(path), offset)
    }

    /// Human-readable `path,offset` form of a location.
    pub fn display(&self, loc: Location) -> String {
        format!("{},{}", self.path(loc.file_id()).display(), loc.offset())
    }

    pub fn file_count(&self) -> usize {
        let tables = self.tables.read().unwrap();
        tables.by_path.len()
    }

    /// Serialize the full table, led by the database version.
    pub fn snapshot<W: Write>(&self, mut writer: W) -> IndexResult<()> {
        let tables = self.tables.read().unwrap();
        bincode::serialize_into(&mut writer, &DATABASE_VERSION)
            .and_then(|_| bincode::serialize_into(&mut writer, &tables.by_id))
            .map_err(|e| IndexError::Serialization(e.to_string()))
    }

    /// Replace the table with a previously written snapshot.
    ///
    /// A snapshot tagged with a different database version is rejected
    /// without touching the current table.
    pub fn restore<R: Read>(&self, mut reader: R) -> IndexResult<()> {
        let version: u32 = bincode::deserialize_from(&mut reader)
            .map_err(|e| IndexError::Serialization(e.to_string()))?;
        if version != DATABASE_VERSION {
            return Err(IndexError::VersionMismatch {
                expected: DATABASE_VERSION,
                found: version,
            });
        }
        let by_id: Vec<PathBuf> = bincode::deserialize_from(&mut reader)
            .map_err(|e| IndexError::Serialization(e.to_string()))?;

        let mut by_path = HashMap::with_capacity(by_id.len().saturating_sub(1));
        for (index, path) in by_id.iter().enumerate().skip(1) {
            by_path.insert(path.clone(), FileId::new(index as u32).unwrap());
        }

        let mut tables = self.tables.write().unwrap();
        tables.by_id = by_id;
        tables.by_path = by_path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_idempotent() {
        let interner = LocationInterner::new();
        let a = interner.insert_file(Path::new("/src/a.c"));
        let b = interner.insert_file(Path::new("/src/b.c"));
        let a2 = interner.insert_file(Path::new("/src/a.c"));

        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(a.value(), 1);
        assert_eq!(b.value(), 2);
    }

    #[test]
    fn test_bijection() {
        let interner = LocationInterner::new();
        let paths = ["/src/a.c", "/src/b.c", "/include/h.h"];
        for p in paths {
            interner.insert_file(Path::new(p));
        }
        for p in paths {
            let id = interner.file_id(Path::new(p)).unwrap();
            assert_eq!(interner.path(id), PathBuf::from(p));
            assert_eq!(interner.file_id(&interner.path(id)), Some(id));
        }
    }

    #[test]
    fn test_unknown_path_has_no_id() {
        let interner = LocationInterner::new();
        assert_eq!(interner.file_id(Path::new("/never/seen.c")), None);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let interner = LocationInterner::new();
        let a = interner.insert_file(Path::new("/src/a.c"));
        let h = interner.insert_file(Path::new("/include/h.h"));

        let mut blob = Vec::new();
        interner.snapshot(&mut blob).unwrap();

        let restored = LocationInterner::new();
        restored.restore(blob.as_slice()).unwrap();

        assert_eq!(restored.file_id(Path::new("/src/a.c")), Some(a));
        assert_eq!(restored.file_id(Path::new("/include/h.h")), Some(h));
        // New assignments continue after the restored counter.
        let next = restored.insert_file(Path::new("/src/new.c"));
        assert_eq!(next.value(), 3);
    }

    #[test]
    fn test_restore_rejects_version_mismatch() {
        let mut blob = Vec::new();
        bincode::serialize_into(&mut blob, &(DATABASE_VERSION + 1)).unwrap();
        bincode::serialize_into(&mut blob, &vec![PathBuf::new(), PathBuf::from("/x.c")]).unwrap();

        let interner = LocationInterner::new();
        interner.insert_file(Path::new("/keep/me.c"));
        let err = interner.restore(blob.as_slice()).unwrap_err();
        assert!(matches!(err, IndexError::VersionMismatch { .. }));
        // Nothing was partially loaded.
        assert_eq!(interner.file_id(Path::new("/x.c")), None);
        assert!(interner.file_id(Path::new("/keep/me.c")).is_some());
    }
}
