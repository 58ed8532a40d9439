//! Per-project indexing scheduler.
//!
//! Tracks which translation units are queued, running, or dirtied while
//! running; enforces at most one active index per source file; counts
//! makefile sessions; computes reverse-dependency dirty sets for
//! re-indexing; and signals when the queue drains.

use crate::error::{IndexError, IndexResult};
use crate::indexing::job::{IndexerJob, JobOutcome, JobStatus};
use crate::indexing::pool::JobPool;
use crate::intern::LocationInterner;
use crate::parsing::{Diagnostic, Frontend};
use crate::storage::Store;
use crate::sync::{read_dependencies, Syncer};
use crate::types::{FileId, JobType, SourceInformation};
use crate::DATABASE_VERSION;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

type JobsCompleteHandler = Box<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct State {
    /// Queued but not yet picked up by a worker.
    pending: HashSet<FileId>,
    /// Picked up, not yet finished.
    in_flight: HashSet<FileId>,
    /// Dirtied while in flight; re-queued once the active job ends.
    dirty: HashSet<FileId>,
    /// Compile record for every unit this project has been asked to
    /// index.
    sources: HashMap<FileId, SourceInformation>,
    /// Parse diagnostics per unit, kept for the errors/fix-its queries.
    diagnostics: HashMap<FileId, Vec<Diagnostic>>,
    session_active: bool,
    session_expected: usize,
    session_completed: usize,
    completed_since_idle: usize,
}

pub struct Indexer {
    interner: Arc<LocationInterner>,
    frontend: Arc<dyn Frontend>,
    syncer: Arc<Syncer>,
    pool: Arc<JobPool>,
    store_path: PathBuf,
    state: Mutex<State>,
    jobs_complete: Mutex<Option<JobsCompleteHandler>>,
}

impl Indexer {
    pub fn new(
        interner: Arc<LocationInterner>,
        frontend: Arc<dyn Frontend>,
        syncer: Arc<Syncer>,
        pool: Arc<JobPool>,
        store_path: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            interner,
            frontend,
            syncer,
            pool,
            store_path,
            state: Mutex::new(State::default()),
            jobs_complete: Mutex::new(None),
        })
    }

    /// Called with the number of jobs completed whenever both the queue
    /// and the in-flight set drain.
    pub fn set_jobs_complete_handler(&self, handler: JobsCompleteHandler) {
        *self.jobs_complete.lock().unwrap() = Some(handler);
    }

    pub fn syncer(&self) -> &Arc<Syncer> {
        &self.syncer
    }

    pub fn store_path(&self) -> &PathBuf {
        &self.store_path
    }

    /// Submit one translation unit. A unit already queued is coalesced;
    /// a unit currently being indexed is marked dirty and re-queued when
    /// the active job finishes.
    pub fn index(self: &Arc<Self>, source: SourceInformation, job_type: JobType) {
        let path = std::fs::canonicalize(&source.source_file)
            .unwrap_or_else(|_| source.source_file.clone());
        let source = SourceInformation::new(path, source.args);
        let file_id = self.interner.insert_file(&source.source_file);

        {
            let mut state = self.state.lock().unwrap();
            let previously_known = state.sources.insert(file_id, source.clone()).is_some();
            if previously_known && job_type != JobType::Dump {
                // Stale records from the previous arguments must go
                // before the fresh index lands.
                self.syncer.add_dirty([file_id].into_iter().collect());
            }
            if state.in_flight.contains(&file_id) {
                state.dirty.insert(file_id);
                return;
            }
            if state.pending.contains(&file_id) {
                return;
            }
            state.pending.insert(file_id);
            if state.session_active {
                state.session_expected += 1;
            }
        }

        self.syncer.throttle();
        self.spawn(file_id, source, job_type);
    }

    fn spawn(self: &Arc<Self>, file_id: FileId, source: SourceInformation, job_type: JobType) {
        let this = Arc::clone(self);
        let boosted = job_type == JobType::Dump;
        self.pool.spawn(boosted, move || {
            this.execute(file_id, source, job_type);
        });
    }

    fn execute(self: &Arc<Self>, file_id: FileId, source: SourceInformation, job_type: JobType) {
        {
            let mut state = self.state.lock().unwrap();
            state.pending.remove(&file_id);
            state.in_flight.insert(file_id);
        }

        let job = IndexerJob::new(
            source,
            job_type,
            Arc::clone(&self.frontend),
            Arc::clone(&self.interner),
        );
        let outcome = if job_type == JobType::Dump {
            // Dump jobs stream through the server; reaching this path
            // means one was routed like an index job, so log it instead.
            let mut sink = |line: String| debug!(target: "dump", "{line}");
            match job.run_dump(&mut sink) {
                Ok(()) => JobOutcome {
                    status: JobStatus::Finished,
                    diagnostics: Vec::new(),
                },
                Err(_) => JobOutcome {
                    status: JobStatus::Failed,
                    diagnostics: Vec::new(),
                },
            }
        } else {
            job.run(&self.syncer)
        };

        self.on_job_finished(file_id, outcome);
    }

    fn on_job_finished(self: &Arc<Self>, file_id: FileId, outcome: JobOutcome) {
        let (redo, complete) = {
            let mut state = self.state.lock().unwrap();
            state.in_flight.remove(&file_id);
            state.diagnostics.insert(file_id, outcome.diagnostics);
            state.completed_since_idle += 1;
            if state.session_active {
                state.session_completed += 1;
            }

            let redo = if state.dirty.remove(&file_id) {
                // One rebuild per dirty notice.
                state.pending.insert(file_id);
                state.sources.get(&file_id).cloned()
            } else {
                None
            };

            let complete = if redo.is_none()
                && state.pending.is_empty()
                && state.in_flight.is_empty()
            {
                Some(std::mem::take(&mut state.completed_since_idle))
            } else {
                None
            };
            (redo, complete)
        };

        if let Some(source) = redo {
            self.syncer.add_dirty([file_id].into_iter().collect());
            self.spawn(file_id, source, JobType::Dirty);
        }
        if let Some(count) = complete {
            debug!(count, "index queue drained");
            if let Some(handler) = self.jobs_complete.lock().unwrap().as_ref() {
                handler(count);
            }
        }
    }

    /// Begin counting a makefile session.
    pub fn begin_makefile(&self) {
        let mut state = self.state.lock().unwrap();
        state.session_active = true;
        state.session_expected = 0;
        state.session_completed = 0;
    }

    /// Close the session and report how many units it submitted. Does
    /// not wait for them to finish.
    pub fn end_makefile(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.session_active = false;
        state.session_expected
    }

    /// Re-index every known file matching `pattern` (substring, or
    /// regular expression when `is_regex`), plus every translation unit
    /// that transitively includes a match. Returns the number of units
    /// queued.
    pub fn reindex(self: &Arc<Self>, pattern: &str, is_regex: bool) -> IndexResult<usize> {
        let matcher: Box<dyn Fn(&str) -> bool> = if is_regex {
            let re = regex::Regex::new(pattern)
                .map_err(|e| IndexError::General(format!("bad pattern {pattern:?}: {e}")))?;
            Box::new(move |path| re.is_match(path))
        } else {
            let needle = pattern.to_string();
            Box::new(move |path| path.contains(&needle))
        };

        let matched: Vec<FileId> = self
            .known_files()
            .into_iter()
            .filter(|file_id| {
                let path = self.interner.path(*file_id);
                matcher(&path.to_string_lossy())
            })
            .collect();
        Ok(self.reindex_files(matched))
    }

    /// External change notification for one path.
    pub fn on_file_changed(self: &Arc<Self>, path: &std::path::Path) -> usize {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        match self.interner.file_id(&canonical) {
            Some(file_id) => self.reindex_files(vec![file_id]),
            None => 0,
        }
    }

    /// Queue a dirty re-index of every translation unit reachable from
    /// `matched` through the dependency graph. The whole visited set is
    /// purged; cycles are cut by the visited set, so no file is queued
    /// twice.
    fn reindex_files(self: &Arc<Self>, matched: Vec<FileId>) -> usize {
        if matched.is_empty() {
            return 0;
        }
        let store = match Store::open_read_only(&self.store_path) {
            Ok(store) => Some(store),
            Err(_) => None,
        };

        let mut visited: BTreeSet<FileId> = BTreeSet::new();
        let mut queue: VecDeque<FileId> = matched.into_iter().collect();
        while let Some(file_id) = queue.pop_front() {
            if !visited.insert(file_id) {
                continue;
            }
            if let Some(store) = &store {
                for dependent in read_dependencies(store, file_id) {
                    if !visited.contains(&dependent) {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        let units: Vec<(FileId, SourceInformation)> = {
            let state = self.state.lock().unwrap();
            visited
                .iter()
                .filter_map(|file_id| {
                    state
                        .sources
                        .get(file_id)
                        .map(|source| (*file_id, source.clone()))
                })
                .collect()
        };
        if units.is_empty() {
            return 0;
        }

        self.syncer.add_dirty(visited);
        let count = units.len();
        for (_, source) in units {
            self.index(source, JobType::Dirty);
        }
        info!(count, "queued dirty re-index");
        count
    }

    /// Every file the project knows about: translation units plus every
    /// file appearing in the dependency graph.
    fn known_files(&self) -> BTreeSet<FileId> {
        let mut files: BTreeSet<FileId> = {
            let state = self.state.lock().unwrap();
            state.sources.keys().copied().collect()
        };
        if let Ok(store) = Store::open_read_only(&self.store_path) {
            if let Ok(keys) = store.keys(crate::storage::Table::Dependency) {
                for key in keys {
                    if key.len() == 4 {
                        let raw = u32::from_be_bytes(key[..4].try_into().unwrap());
                        if let Some(file_id) = FileId::new(raw) {
                            files.insert(file_id);
                        }
                    }
                }
            }
        }
        files
    }

    pub fn source_info(&self, file_id: FileId) -> Option<SourceInformation> {
        self.state.lock().unwrap().sources.get(&file_id).cloned()
    }

    pub fn source_count(&self) -> usize {
        self.state.lock().unwrap().sources.len()
    }

    pub fn is_indexed(&self, file_id: FileId) -> bool {
        let state = self.state.lock().unwrap();
        state.sources.contains_key(&file_id)
            || state.pending.contains(&file_id)
            || state.in_flight.contains(&file_id)
    }

    /// Formatted parse diagnostics, optionally restricted to one path.
    pub fn errors(&self, path_filter: Option<&std::path::Path>) -> String {
        let filter_id = path_filter.and_then(|p| {
            let canonical = std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
            self.interner.file_id(&canonical)
        });
        let state = self.state.lock().unwrap();
        let mut lines = Vec::new();
        for (file_id, diagnostics) in &state.diagnostics {
            if path_filter.is_some() && filter_id != Some(*file_id) {
                continue;
            }
            for diagnostic in diagnostics {
                lines.push(format!(
                    "{},{}: {}",
                    diagnostic.file.display(),
                    diagnostic.offset,
                    diagnostic.message
                ));
            }
        }
        lines.sort();
        lines.join("\n")
    }

    /// Serialize the restore state: the known compile records, keyed by
    /// file id, led by the database version.
    pub fn save<W: Write>(&self, mut writer: W) -> IndexResult<()> {
        let sources: BTreeMap<u32, SourceInformation> = {
            let state = self.state.lock().unwrap();
            state
                .sources
                .iter()
                .map(|(file_id, source)| (file_id.value(), source.clone()))
                .collect()
        };
        bincode::serialize_into(&mut writer, &DATABASE_VERSION)
            .and_then(|_| bincode::serialize_into(&mut writer, &sources))
            .map_err(|e| IndexError::Serialization(e.to_string()))
    }

    /// Load a previously saved restore blob. Clean files will not be
    /// re-parsed after this: their compile records are back, and the
    /// dirty check compares against them.
    pub fn restore<R: Read>(&self, mut reader: R) -> IndexResult<()> {
        let version: u32 = bincode::deserialize_from(&mut reader)
            .map_err(|e| IndexError::Serialization(e.to_string()))?;
        if version != DATABASE_VERSION {
            return Err(IndexError::VersionMismatch {
                expected: DATABASE_VERSION,
                found: version,
            });
        }
        let sources: BTreeMap<u32, SourceInformation> = bincode::deserialize_from(&mut reader)
            .map_err(|e| IndexError::Serialization(e.to_string()))?;

        let mut state = self.state.lock().unwrap();
        for (raw_id, source) in sources {
            // Re-intern rather than trusting the stored id; a rebuilt
            // fileids table may have assigned different ids.
            let file_id = self.interner.insert_file(&source.source_file);
            if file_id.value() != raw_id {
                debug!(
                    path = %source.source_file.display(),
                    stored = raw_id,
                    assigned = file_id.value(),
                    "file id changed across restore"
                );
            }
            state.sources.insert(file_id, source);
        }
        Ok(())
    }
}
