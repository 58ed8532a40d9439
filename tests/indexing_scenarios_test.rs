//! End-to-end indexing scenarios driven through the library API:
//! index real C sources, then answer queries from the persisted store.

use cindex::indexing::{Indexer, JobPool};
use cindex::parsing::CParser;
use cindex::server::jobs::{self, JobContext};
use cindex::storage::{Store, Table};
use cindex::sync::Syncer;
use cindex::types::{JobType, Location, SourceInformation};
use cindex::LocationInterner;
use crossbeam_channel::{unbounded, Receiver};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    indexer: Arc<Indexer>,
    interner: Arc<LocationInterner>,
    store_path: PathBuf,
    complete: Receiver<usize>,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let interner = Arc::new(LocationInterner::new());
    let store_path = dir.path().join("data").join("index.db");
    let syncer = Syncer::start(store_path.clone(), 100_000);
    let pool = Arc::new(JobPool::new(2));
    let indexer = Indexer::new(
        Arc::clone(&interner),
        Arc::new(CParser::new()),
        syncer,
        pool,
        store_path.clone(),
    );
    let (tx, rx) = unbounded();
    indexer.set_jobs_complete_handler(Box::new(move |count| {
        let _ = tx.send(count);
    }));
    Fixture {
        dir,
        indexer,
        interner,
        store_path,
        complete: rx,
    }
}

impl Fixture {
    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn index(&self, name: &str) {
        self.indexer.index(
            SourceInformation::new(self.dir.path().join(name), Vec::new()),
            JobType::Makefile,
        );
    }

    fn wait_jobs(&self, target: usize) {
        let mut total = 0;
        while total < target {
            total += self
                .complete
                .recv_timeout(Duration::from_secs(10))
                .expect("indexing did not finish");
        }
        self.indexer.syncer().wait_idle();
    }

    fn store(&self) -> Store {
        Store::open_read_only(&self.store_path).unwrap()
    }

    fn canonical(&self, name: &str) -> PathBuf {
        fs::canonicalize(self.dir.path().join(name)).unwrap()
    }

    fn location(&self, name: &str, content: &str, token: &str) -> Location {
        let offset = content.find(token).expect("token present") as u32;
        let file_id = self.interner.file_id(&self.canonical(name)).unwrap();
        Location::new(file_id, offset)
    }
}

const A_C: &str = "int foo(void) { return 0; }\n";
const B_C: &str = "extern int foo(void);\nint main(void) { return foo(); }\n";

/// Two-file project: follow from the call site to the definition, and
/// list the call site from the definition.
#[test]
fn test_follow_and_references_across_files() {
    let fx = fixture();
    fx.write("a.c", A_C);
    fx.write("b.c", B_C);
    fx.index("a.c");
    fx.index("b.c");
    fx.wait_jobs(2);

    let store = fx.store();

    // The call `foo()` inside main.
    let call = fx.location("b.c", B_C, "foo();");
    let followed = jobs::follow_location(&store, &fx.interner, call).unwrap();
    let def = fx.location("a.c", A_C, "foo");
    assert_eq!(
        followed,
        format!("{},{}", fx.canonical("a.c").display(), def.offset())
    );

    // References on the definition see the cross-file call site.
    let (ctx, rx, _aborted) = JobContext::channel();
    jobs::references_location(&store, &fx.interner, &ctx, def);
    drop(ctx);
    let lines: Vec<String> = rx.into_iter().collect();
    assert_eq!(
        lines,
        vec![format!(
            "{},{}",
            fx.canonical("b.c").display(),
            call.offset()
        )]
    );
}

/// Renaming a symbol and re-indexing its file moves the name-index
/// entry; the other file's call site is left dangling, not pointing at
/// the new symbol.
#[test]
fn test_rename_invalidates_old_name() {
    let fx = fixture();
    let a = fx.write("a.c", A_C);
    fx.write("b.c", B_C);
    fx.index("a.c");
    fx.index("b.c");
    fx.wait_jobs(2);

    let a_id = fx.interner.file_id(&fx.canonical("a.c")).unwrap();

    fs::write(&a, "int bar(void) { return 0; }\n").unwrap();
    assert_eq!(fx.indexer.on_file_changed(&a), 1);
    fx.wait_jobs(1);

    let store = fx.store();
    let foo: BTreeSet<Location> = store.read(Table::SymbolName, b"foo");
    assert!(
        foo.iter().all(|loc| loc.file_id() != a_id),
        "foo must no longer be declared in a.c"
    );
    let bar: BTreeSet<Location> = store.read(Table::SymbolName, b"bar");
    assert_eq!(bar.iter().filter(|loc| loc.file_id() == a_id).count(), 1);

    // The call site still resolves only as far as the declaration in
    // b.c; the definition is gone.
    let call = fx.location("b.c", B_C, "foo();");
    let followed = jobs::follow_location(&store, &fx.interner, call).unwrap();
    let decl = fx.location("b.c", B_C, "foo(void)");
    assert_eq!(
        followed,
        format!("{},{}", fx.canonical("b.c").display(), decl.offset())
    );
}

/// A changed header re-queues exactly its dependent units.
#[test]
fn test_header_dirty_closure() {
    let fx = fixture();
    fx.write("h.h", "int helper(void);\n");
    let unit = "#include \"h.h\"\nint user(void) { return helper(); }\n";
    for name in ["a.c", "b.c", "c.c"] {
        fx.write(name, unit);
        fx.index(name);
    }
    fx.wait_jobs(3);

    let count = fx.indexer.reindex("h.h", false).unwrap();
    assert_eq!(count, 3);
    fx.wait_jobs(3);

    // Still exactly one definition entry per unit afterwards.
    let store = fx.store();
    let users: BTreeSet<Location> = store.read(Table::SymbolName, b"user");
    assert_eq!(users.len(), 3);
}

/// Indexing the same unit twice with identical arguments leaves the
/// persisted records byte-identical.
#[test]
fn test_idempotent_reindex() {
    let fx = fixture();
    fx.write("a.c", A_C);
    fx.write("b.c", B_C);
    fx.index("a.c");
    fx.index("b.c");
    fx.wait_jobs(2);

    let snapshot = |store: &Store| {
        let mut rows: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        store
            .for_each(Table::Symbol, |key, value: cindex::CursorInfo| {
                rows.push((key.to_vec(), bincode::serialize(&value).unwrap()));
            })
            .unwrap();
        store
            .for_each(Table::SymbolName, |key, value: BTreeSet<Location>| {
                rows.push((key.to_vec(), bincode::serialize(&value).unwrap()));
            })
            .unwrap();
        rows
    };

    let before = snapshot(&fx.store());

    assert_eq!(fx.indexer.reindex("a.c", false).unwrap(), 1);
    fx.wait_jobs(1);

    let after = snapshot(&fx.store());
    assert_eq!(before, after);
}

/// The interner snapshot keeps ids stable across a restart.
#[test]
fn test_file_ids_survive_restart() {
    let fx = fixture();
    fx.write("a.c", A_C);
    fx.index("a.c");
    fx.wait_jobs(1);

    let a = fx.canonical("a.c");
    let id_before = fx.interner.file_id(&a).unwrap();

    let fileids = fx.dir.path().join("fileids");
    let mut blob = Vec::new();
    fx.interner.snapshot(&mut blob).unwrap();
    fs::write(&fileids, &blob).unwrap();

    let reloaded = LocationInterner::new();
    reloaded
        .restore(fs::read(&fileids).unwrap().as_slice())
        .unwrap();
    assert_eq!(reloaded.file_id(&a), Some(id_before));
    assert_eq!(reloaded.path(id_before), a);
}

/// A unit that fails to parse is recorded (so it is not retried) but
/// contributes no symbols.
#[test]
fn test_missing_file_records_information_only() {
    let fx = fixture();
    fx.indexer.index(
        SourceInformation::new(fx.dir.path().join("gone.c"), vec!["-I/x".into()]),
        JobType::Makefile,
    );
    fx.wait_jobs(1);

    let store = fx.store();
    assert_eq!(store.count(Table::Symbol).unwrap(), 0);
    assert_eq!(store.count(Table::FileInformation).unwrap(), 1);
    assert!(!fx.indexer.errors(None).is_empty());
}
