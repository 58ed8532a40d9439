//! One project per source root: the indexer, the file tree, and the
//! path bookkeeping used to route queries.

use crate::config::Settings;
use crate::error::{IndexError, IndexResult};
use crate::indexing::{Indexer, JobPool};
use crate::intern::LocationInterner;
use crate::parsing::Frontend;
use crate::sync::Syncer;
use crate::types::FileId;
use ignore::WalkBuilder;
use std::collections::BTreeSet;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};

const SOURCE_EXTENSIONS: &[&str] = &[
    "c", "h", "cc", "cpp", "cxx", "C", "hpp", "hh", "hxx",
];

/// The tree of known files under a source root.
#[derive(Debug, Default)]
pub struct FileManager {
    files: RwLock<BTreeSet<PathBuf>>,
}

impl FileManager {
    /// Walk the root and record every C/C++ file, honoring gitignore
    /// rules the way the rest of the tooling does.
    pub fn init(&self, root: &Path) {
        let walked: BTreeSet<PathBuf> = WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(true)
            .git_exclude(true)
            .follow_links(false)
            .require_git(false)
            .build()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
            })
            .collect();
        info!(files = walked.len(), root = %root.display(), "file manager scanned");
        *self.files.write().unwrap() = walked;
    }

    pub fn contains(&self, path: &Path) -> bool {
        let files = self.files.read().unwrap();
        files.contains(path) || files.iter().any(|f| f.starts_with(path))
    }

    /// Paths whose string form contains `pattern` (all of them when the
    /// pattern is empty).
    pub fn matching(&self, pattern: &str) -> Vec<PathBuf> {
        self.files
            .read()
            .unwrap()
            .iter()
            .filter(|path| pattern.is_empty() || path.to_string_lossy().contains(pattern))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.files.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().unwrap().is_empty()
    }
}

/// Per-source-root composition of indexer, syncer, and file tree.
pub struct Project {
    src_root: PathBuf,
    resolved_src_root: PathBuf,
    /// Where this project's restore blob lives on disk.
    blob_path: PathBuf,
    pub file_manager: FileManager,
    pub indexer: Arc<Indexer>,
}

impl Project {
    /// Build a valid project rooted at `src_root`: start its syncer,
    /// wire the indexer, scan the file tree, and pick up the restore
    /// blob at `blob_path` from a previous run so clean files are not
    /// re-parsed.
    pub fn init(
        src_root: &Path,
        blob_path: PathBuf,
        settings: &Settings,
        interner: Arc<LocationInterner>,
        frontend: Arc<dyn Frontend>,
        pool: Arc<JobPool>,
    ) -> IndexResult<Arc<Self>> {
        let resolved = std::fs::canonicalize(src_root).unwrap_or_else(|_| src_root.to_path_buf());
        let syncer = Syncer::start(settings.store_path(), settings.sync.soft_limit);
        let indexer = Indexer::new(
            interner,
            frontend,
            syncer,
            pool,
            settings.store_path(),
        );
        if let Ok(file) = std::fs::File::open(&blob_path) {
            match indexer.restore(BufReader::new(file)) {
                Ok(()) => info!(root = %src_root.display(), "restored project state"),
                Err(err) => warn!(error = %err, "ignoring stale project blob"),
            }
        }
        let file_manager = FileManager::default();
        file_manager.init(&resolved);
        Ok(Arc::new(Self {
            src_root: src_root.to_path_buf(),
            resolved_src_root: resolved,
            blob_path,
            file_manager,
            indexer,
        }))
    }

    pub fn src_root(&self) -> &Path {
        &self.src_root
    }

    pub fn resolved_src_root(&self) -> &Path {
        &self.resolved_src_root
    }

    /// Whether `path` belongs to this project, and how specifically (the
    /// longest matching root wins across projects).
    pub fn match_len(&self, path: &Path) -> Option<usize> {
        [&self.src_root, &self.resolved_src_root]
            .into_iter()
            .filter(|root| path.starts_with(root))
            .map(|root| root.as_os_str().len())
            .max()
    }

    pub fn is_indexed(&self, file_id: FileId) -> bool {
        self.indexer.is_indexed(file_id)
    }

    /// Persist the restore blob (write to temp, then rename, so a crash
    /// never leaves a half-written blob).
    pub fn save(&self) -> IndexResult<()> {
        if let Some(parent) = self.blob_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IndexError::FileWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let tmp = self.blob_path.with_extension("tmp");
        let file = std::fs::File::create(&tmp).map_err(|e| IndexError::FileWrite {
            path: tmp.clone(),
            source: e,
        })?;
        let mut writer = BufWriter::new(file);
        self.indexer.save(&mut writer)?;
        writer.flush().map_err(|e| IndexError::FileWrite {
            path: tmp.clone(),
            source: e,
        })?;
        drop(writer);
        std::fs::rename(&tmp, &self.blob_path).map_err(|e| IndexError::FileWrite {
            path: self.blob_path.clone(),
            source: e,
        })
    }

    /// Persist the restore blob, stop the syncer, and drop in-memory
    /// scheduling state.
    pub fn unload(&self) {
        if let Err(err) = self.save() {
            error!(error = %err, root = %self.src_root.display(), "cannot save project");
        }
        self.indexer.syncer().stop();
        info!(root = %self.src_root.display(), "project unloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_file_manager_scans_sources() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.c"), "int a;\n").unwrap();
        fs::write(dir.path().join("h.h"), "int h;\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "skip me\n").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.cpp"), "int b;\n").unwrap();

        let manager = FileManager::default();
        manager.init(dir.path());

        assert_eq!(manager.len(), 3);
        assert!(manager.contains(&dir.path().join("a.c")));
        assert!(manager.contains(&dir.path().join("sub")));
        assert!(!manager.contains(&dir.path().join("notes.txt")));
        assert_eq!(manager.matching("b.cpp").len(), 1);
    }

    #[test]
    fn test_project_match_len() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            data_dir: dir.path().join("data"),
            ..Settings::default()
        };
        let project = Project::init(
            dir.path(),
            settings.project_blob_path(dir.path()),
            &settings,
            Arc::new(LocationInterner::new()),
            Arc::new(crate::parsing::CParser::new()),
            Arc::new(JobPool::new(1)),
        )
        .unwrap();

        assert!(project.match_len(&dir.path().join("src/a.c")).is_some());
        assert!(project.match_len(Path::new("/elsewhere/b.c")).is_none());
        project.unload();
    }

    #[test]
    fn test_unload_persists_restore_blob() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            data_dir: dir.path().join("data"),
            ..Settings::default()
        };
        let blob_path = settings.project_blob_path(dir.path());
        let interner = Arc::new(LocationInterner::new());
        let frontend: Arc<dyn Frontend> = Arc::new(crate::parsing::CParser::new());
        let pool = Arc::new(JobPool::new(1));

        fs::write(dir.path().join("a.c"), "int a;\n").unwrap();
        let project = Project::init(
            dir.path(),
            blob_path.clone(),
            &settings,
            Arc::clone(&interner),
            Arc::clone(&frontend),
            Arc::clone(&pool),
        )
        .unwrap();
        project.indexer.index(
            crate::types::SourceInformation::new(dir.path().join("a.c"), Vec::new()),
            crate::types::JobType::Makefile,
        );
        // Unload with no idle-save in between: the blob must be written
        // by unload itself.
        project.unload();
        assert!(blob_path.exists());

        let reloaded = Project::init(
            dir.path(),
            blob_path,
            &settings,
            Arc::clone(&interner),
            frontend,
            pool,
        )
        .unwrap();
        assert_eq!(reloaded.indexer.source_count(), 1);
        reloaded.unload();
    }
}
