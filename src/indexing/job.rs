//! One indexing job per translation unit.
//!
//! A job drives the front-end over `(source_file, compile_args)`,
//! converts the cursor stream into delta maps keyed by interned
//! locations, and posts the whole batch to the syncer in one call so
//! all six kinds flush together. A job whose abort flag is raised
//! publishes nothing.

use crate::error::IndexError;
use crate::indexing::unix_timestamp;
use crate::intern::LocationInterner;
use crate::parsing::{CursorEvent, CursorPosition, Diagnostic, Frontend};
use crate::symbol::{CursorInfo, FileInformation};
use crate::sync::{DeltaBatch, Syncer};
use crate::types::{CursorKind, JobType, Location, RefKind, SourceInformation};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Finished,
    Failed,
    Aborted,
}

/// What a finished job reports back to the scheduler.
#[derive(Debug)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct IndexerJob {
    pub source: SourceInformation,
    pub job_type: JobType,
    aborted: Arc<AtomicBool>,
    frontend: Arc<dyn Frontend>,
    interner: Arc<LocationInterner>,
}

impl IndexerJob {
    pub fn new(
        source: SourceInformation,
        job_type: JobType,
        frontend: Arc<dyn Frontend>,
        interner: Arc<LocationInterner>,
    ) -> Self {
        Self {
            source,
            job_type,
            aborted: Arc::new(AtomicBool::new(false)),
            frontend,
            interner,
        }
    }

    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.aborted)
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    fn location(&self, position: &CursorPosition) -> Location {
        self.interner.location(&position.file, position.offset)
    }

    /// Parse the unit and post its deltas. Nothing is published when the
    /// abort flag is observed; a parse failure still records the compile
    /// arguments so the unit is not retried until they change.
    pub fn run(&self, syncer: &Syncer) -> JobOutcome {
        let unit = match self
            .frontend
            .parse(&self.source.source_file, &self.source.args, &self.aborted)
        {
            Ok(unit) => unit,
            Err(IndexError::Cancelled) => {
                debug!(file = %self.source.source_file.display(), "index job aborted");
                return JobOutcome {
                    status: JobStatus::Aborted,
                    diagnostics: Vec::new(),
                };
            }
            Err(err) => {
                warn!(
                    file = %self.source.source_file.display(),
                    error = %err,
                    "translation unit failed to parse"
                );
                let mut batch = DeltaBatch::default();
                batch.informations.insert(
                    self.source.source_file.clone(),
                    FileInformation::new(self.source.args.clone(), unix_timestamp()),
                );
                syncer.add_batch(batch);
                return JobOutcome {
                    status: JobStatus::Failed,
                    diagnostics: vec![Diagnostic {
                        file: self.source.source_file.clone(),
                        offset: 0,
                        message: err.to_string(),
                    }],
                };
            }
        };

        let source_id = self.interner.insert_file(&self.source.source_file);
        let mut batch = DeltaBatch::default();

        // Dependency edges: every included file is depended on by this
        // unit, and the unit depends on itself so a direct change dirties
        // it too.
        batch
            .dependencies
            .entry(source_id)
            .or_default()
            .insert(source_id);
        for included in &unit.includes {
            let included_id = self.interner.insert_file(included);
            batch
                .dependencies
                .entry(included_id)
                .or_default()
                .insert(source_id);
        }

        for event in &unit.cursors {
            match event {
                CursorEvent::Symbol {
                    position,
                    kind,
                    definition,
                    name,
                    qualified,
                    signature,
                    usr,
                    length,
                } => {
                    let loc = self.location(position);
                    let info = CursorInfo {
                        kind: *kind,
                        definition: *definition,
                        symbol_name: qualified.clone(),
                        usr: usr.clone(),
                        symbol_length: *length,
                        target: None,
                        references: BTreeSet::new(),
                    };
                    match batch.symbols.entry(loc) {
                        std::collections::hash_map::Entry::Occupied(mut entry) => {
                            entry.get_mut().unite(&info);
                        }
                        std::collections::hash_map::Entry::Vacant(entry) => {
                            entry.insert(info);
                        }
                    }
                    for form in name_forms(name, qualified, signature.as_deref()) {
                        batch.symbol_names.entry(form).or_default().insert(loc);
                    }
                }
                CursorEvent::Reference {
                    position,
                    length,
                    target,
                    kind,
                } => {
                    let ref_loc = self.location(position);
                    let target_loc = self.location(target);
                    batch.references.insert(ref_loc, (target_loc, *kind));
                    // The target's record lists the reference; the
                    // reference's own record points back at the target.
                    batch
                        .symbols
                        .entry(target_loc)
                        .or_default()
                        .references
                        .insert(ref_loc);
                    if *kind == RefKind::Normal {
                        let entry = batch.symbols.entry(ref_loc).or_default();
                        if entry.kind == CursorKind::Invalid {
                            entry.kind = CursorKind::Reference;
                        }
                        if entry.target.is_none() {
                            entry.target = Some(target_loc);
                        }
                        if entry.symbol_length == 0 {
                            entry.symbol_length = *length;
                        }
                    }
                }
            }
        }

        batch.informations.insert(
            self.source.source_file.clone(),
            FileInformation::new(self.source.args.clone(), unix_timestamp()),
        );

        // Last gate before publishing: an aborted job must not leak a
        // partial unit into the store.
        if self.aborted.load(Ordering::Relaxed) {
            return JobOutcome {
                status: JobStatus::Aborted,
                diagnostics: Vec::new(),
            };
        }

        let diagnostics = unit.diagnostics;
        syncer.add_batch(batch);
        JobOutcome {
            status: JobStatus::Finished,
            diagnostics,
        }
    }

    /// Dump mode: stream the cursor events as text instead of writing
    /// deltas.
    pub fn run_dump(&self, sink: &mut dyn FnMut(String)) -> Result<(), IndexError> {
        let unit = self
            .frontend
            .parse(&self.source.source_file, &self.source.args, &self.aborted)?;
        for event in &unit.cursors {
            match event {
                CursorEvent::Symbol {
                    position,
                    kind,
                    definition,
                    qualified,
                    usr,
                    ..
                } => {
                    sink(format!(
                        "{} {} {},{} {}{}",
                        kind.display(),
                        qualified,
                        position.file.display(),
                        position.offset,
                        usr,
                        if *definition { " def" } else { "" },
                    ));
                }
                CursorEvent::Reference {
                    position,
                    target,
                    kind,
                    ..
                } => {
                    sink(format!(
                        "ref{} {},{} -> {},{}",
                        if *kind == RefKind::Linked { " linked" } else { "" },
                        position.file.display(),
                        position.offset,
                        target.file.display(),
                        target.offset,
                    ));
                }
            }
        }
        Ok(())
    }
}

/// All searchable name forms of a declaration: unqualified, qualified,
/// and with the parameter signature appended.
fn name_forms(name: &str, qualified: &str, signature: Option<&str>) -> Vec<String> {
    let mut forms = vec![qualified.to_string()];
    if name != qualified {
        forms.push(name.to_string());
    }
    if let Some(signature) = signature {
        forms.push(format!("{qualified}{signature}"));
        if name != qualified {
            forms.push(format!("{name}{signature}"));
        }
    }
    forms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::CParser;
    use crate::storage::{Store, Table};
    use std::fs;
    use tempfile::TempDir;

    fn run_job(dir: &TempDir, file: &str) -> (Arc<LocationInterner>, std::path::PathBuf) {
        let interner = Arc::new(LocationInterner::new());
        let store_path = dir.path().join("index.db");
        let syncer = Syncer::start(store_path.clone(), 10_000);

        let job = IndexerJob::new(
            SourceInformation::new(dir.path().join(file), Vec::new()),
            JobType::Makefile,
            Arc::new(CParser::new()),
            Arc::clone(&interner),
        );
        let outcome = job.run(&syncer);
        assert_eq!(outcome.status, JobStatus::Finished);
        syncer.wait_idle();
        syncer.stop();
        (interner, store_path)
    }

    #[test]
    fn test_job_persists_symbols_and_names() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("a.c"),
            "int foo(void) { return 0; }\nint main(void) { return foo(); }\n",
        )
        .unwrap();

        let (interner, store_path) = run_job(&dir, "a.c");
        let store = Store::open(&store_path).unwrap();

        let names: BTreeSet<Location> = store.read(Table::SymbolName, b"foo");
        assert_eq!(names.len(), 1);
        let def_loc = *names.iter().next().unwrap();

        let info: CursorInfo = store.read(Table::Symbol, &def_loc.padded_key());
        assert_eq!(info.kind, CursorKind::Function);
        assert!(info.definition);
        assert_eq!(info.references.len(), 1);

        // The call site points back at the definition.
        let call_loc = *info.references.iter().next().unwrap();
        let call: CursorInfo = store.read(Table::Symbol, &call_loc.padded_key());
        assert_eq!(call.target, Some(def_loc));

        // Signature form is searchable too.
        let with_sig: BTreeSet<Location> = store.read(Table::SymbolName, b"foo(void)");
        assert!(with_sig.contains(&def_loc));

        let file_id = interner
            .file_id(&dir.path().join("a.c"))
            .expect("source file interned");
        assert_eq!(def_loc.file_id(), file_id);
    }

    #[test]
    fn test_job_records_dependencies_and_information() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("h.h"), "int helper(void);\n").unwrap();
        fs::write(
            dir.path().join("main.c"),
            "#include \"h.h\"\nint main(void) { return helper(); }\n",
        )
        .unwrap();

        let (interner, store_path) = run_job(&dir, "main.c");
        let store = Store::open(&store_path).unwrap();

        let header = dir.path().join("h.h").canonicalize().unwrap();
        let header_id = interner.file_id(&header).unwrap();
        let source_id = interner.file_id(&dir.path().join("main.c")).unwrap();

        let included_by = crate::sync::read_dependencies(&store, header_id);
        assert!(included_by.contains(&source_id));

        let info: FileInformation = store.read(
            Table::FileInformation,
            &crate::sync::information_key(&dir.path().join("main.c")),
        );
        assert!(info.last_touched > 0);
    }

    #[test]
    fn test_aborted_job_publishes_nothing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.c"), "int foo(void) { return 0; }\n").unwrap();

        let interner = Arc::new(LocationInterner::new());
        let store_path = dir.path().join("index.db");
        let syncer = Syncer::start(store_path.clone(), 10_000);

        let job = IndexerJob::new(
            SourceInformation::new(dir.path().join("a.c"), Vec::new()),
            JobType::Makefile,
            Arc::new(CParser::new()),
            interner,
        );
        job.abort();
        let outcome = job.run(&syncer);
        assert_eq!(outcome.status, JobStatus::Aborted);

        syncer.wait_idle();
        syncer.stop();

        let store = Store::open(&store_path).unwrap();
        assert_eq!(store.count(Table::Symbol).unwrap(), 0);
        assert_eq!(store.count(Table::FileInformation).unwrap(), 0);
    }

    #[test]
    fn test_failed_parse_still_records_information() {
        let dir = TempDir::new().unwrap();
        // Missing file: the front-end cannot even read it.
        let interner = Arc::new(LocationInterner::new());
        let store_path = dir.path().join("index.db");
        let syncer = Syncer::start(store_path.clone(), 10_000);

        let job = IndexerJob::new(
            SourceInformation::new(dir.path().join("gone.c"), vec!["-Wall".into()]),
            JobType::Makefile,
            Arc::new(CParser::new()),
            interner,
        );
        let outcome = job.run(&syncer);
        assert_eq!(outcome.status, JobStatus::Failed);
        assert!(!outcome.diagnostics.is_empty());

        syncer.wait_idle();
        syncer.stop();

        let store = Store::open(&store_path).unwrap();
        let info: FileInformation = store.read(
            Table::FileInformation,
            &crate::sync::information_key(&dir.path().join("gone.c")),
        );
        assert_eq!(info.compile_args, vec!["-Wall".to_string()]);
    }

    #[test]
    fn test_name_forms() {
        let forms = name_forms("bar", "Foo::bar", Some("(int)"));
        assert!(forms.contains(&"Foo::bar".to_string()));
        assert!(forms.contains(&"bar".to_string()));
        assert!(forms.contains(&"Foo::bar(int)".to_string()));
        assert!(forms.contains(&"bar(int)".to_string()));
    }
}
