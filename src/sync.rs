//! Background merging of in-memory index deltas into the store.
//!
//! Each project runs one syncer thread. Indexer jobs hand their deltas
//! to the inbox under a short lock; the thread wakes on a condition
//! variable (10 second timeout), swaps the accumulators out so
//! producers keep filling empty maps, and applies the swapped batch to
//! the four tables in a fixed phase order. All merges are commutative
//! (set union) or last-writer-wins, so the persisted state does not
//! depend on arrival order.

use crate::storage::{Store, StorageResult, Table, WriteBatch};
use crate::symbol::{CursorInfo, FileInformation};
use crate::types::{FileId, Location, RefKind};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

pub type SymbolNameMap = HashMap<String, BTreeSet<Location>>;
pub type SymbolMap = HashMap<Location, CursorInfo>;
pub type ReferenceMap = HashMap<Location, (Location, RefKind)>;
pub type DependencyMap = HashMap<FileId, BTreeSet<FileId>>;
/// The pch map is stored whole under one key, so it stays sorted for a
/// canonical serialized form.
pub type PchDependencyMap = BTreeMap<FileId, BTreeSet<FileId>>;
pub type InformationMap = HashMap<PathBuf, FileInformation>;

/// Store key for a dependency entry.
fn dependency_key(file: FileId) -> [u8; 4] {
    file.value().to_be_bytes()
}

/// Store key for a file-information entry.
pub fn information_key(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

/// Exclusive upper bound of the symbol-key range belonging to one file.
fn file_range(file: FileId) -> ([u8; 8], [u8; 8]) {
    let start = u64::from(file.value()) << 32;
    let end = (u64::from(file.value()) + 1) << 32;
    (start.to_be_bytes(), end.to_be_bytes())
}

/// Everything one indexer job (or one dirty pass) wants persisted.
#[derive(Debug, Default)]
pub struct DeltaBatch {
    pub symbol_names: SymbolNameMap,
    pub symbols: SymbolMap,
    pub references: ReferenceMap,
    pub dependencies: DependencyMap,
    pub pch_dependencies: PchDependencyMap,
    pub informations: InformationMap,
    /// Files whose previous index contents must be purged before this
    /// batch (and anything after it) lands.
    pub dirty: BTreeSet<FileId>,
}

impl DeltaBatch {
    pub fn is_empty(&self) -> bool {
        self.symbol_names.is_empty()
            && self.symbols.is_empty()
            && self.references.is_empty()
            && self.dependencies.is_empty()
            && self.pch_dependencies.is_empty()
            && self.informations.is_empty()
            && self.dirty.is_empty()
    }

    /// Total pending entries, for back-pressure accounting.
    pub fn len(&self) -> usize {
        self.symbol_names.len()
            + self.symbols.len()
            + self.references.len()
            + self.dependencies.len()
            + self.pch_dependencies.len()
            + self.informations.len()
            + self.dirty.len()
    }

    /// Merge `other` into this batch with the per-table semantics the
    /// flush relies on: union for names, `unite` for symbols, union for
    /// dependencies, last-writer-wins for references and informations.
    fn merge(&mut self, other: DeltaBatch) {
        for (name, locations) in other.symbol_names {
            self.symbol_names.entry(name).or_default().extend(locations);
        }
        for (loc, info) in other.symbols {
            match self.symbols.entry(loc) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    entry.get_mut().unite(&info);
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(info);
                }
            }
        }
        self.references.extend(other.references);
        for (file, included_by) in other.dependencies {
            self.dependencies.entry(file).or_default().extend(included_by);
        }
        for (file, members) in other.pch_dependencies {
            self.pch_dependencies.entry(file).or_default().extend(members);
        }
        self.informations.extend(other.informations);
        self.dirty.extend(other.dirty);
    }
}

struct Inbox {
    pending: DeltaBatch,
    stopped: bool,
    in_flush: bool,
}

struct Shared {
    inbox: Mutex<Inbox>,
    /// Wakes the syncer thread.
    wakeup: Condvar,
    /// Signalled after every flush; producers blocked on back-pressure
    /// and tests waiting for idle listen here.
    drained: Condvar,
    store_path: PathBuf,
    soft_limit: usize,
}

/// Handle to one project's sync thread.
pub struct Syncer {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

impl Syncer {
    /// Spawn the sync thread writing into the store at `store_path`.
    pub fn start(store_path: PathBuf, soft_limit: usize) -> Arc<Self> {
        let shared = Arc::new(Shared {
            inbox: Mutex::new(Inbox {
                pending: DeltaBatch::default(),
                stopped: false,
                in_flush: false,
            }),
            wakeup: Condvar::new(),
            drained: Condvar::new(),
            store_path,
            soft_limit,
        });
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("syncer".into())
            .spawn(move || run(thread_shared))
            .expect("failed to spawn syncer thread");
        Arc::new(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Post a whole delta batch under one inbox lock acquisition, so all
    /// six kinds from one translation unit flush together.
    pub fn add_batch(&self, batch: DeltaBatch) {
        if batch.is_empty() {
            return;
        }
        let mut inbox = self.shared.inbox.lock().unwrap();
        inbox.pending.merge(batch);
        self.shared.wakeup.notify_one();
    }

    pub fn add_symbol_names(&self, symbol_names: SymbolNameMap) {
        self.add_batch(DeltaBatch {
            symbol_names,
            ..DeltaBatch::default()
        });
    }

    pub fn add_symbols(&self, symbols: SymbolMap) {
        self.add_batch(DeltaBatch {
            symbols,
            ..DeltaBatch::default()
        });
    }

    pub fn add_references(&self, references: ReferenceMap) {
        self.add_batch(DeltaBatch {
            references,
            ..DeltaBatch::default()
        });
    }

    pub fn add_dependencies(&self, dependencies: DependencyMap) {
        self.add_batch(DeltaBatch {
            dependencies,
            ..DeltaBatch::default()
        });
    }

    pub fn set_pch_dependencies(&self, pch_dependencies: PchDependencyMap) {
        self.add_batch(DeltaBatch {
            pch_dependencies,
            ..DeltaBatch::default()
        });
    }

    pub fn add_file_information(&self, path: PathBuf, info: FileInformation) {
        let mut informations = InformationMap::new();
        informations.insert(path, info);
        self.add_batch(DeltaBatch {
            informations,
            ..DeltaBatch::default()
        });
    }

    /// Queue purging of previous index contents for `files`.
    pub fn add_dirty(&self, files: BTreeSet<FileId>) {
        self.add_batch(DeltaBatch {
            dirty: files,
            ..DeltaBatch::default()
        });
    }

    /// Back-pressure: once the backlog exceeds the soft limit, block the
    /// caller until the flush loop has halved it.
    pub fn throttle(&self) {
        let mut inbox = self.shared.inbox.lock().unwrap();
        if inbox.pending.len() <= self.soft_limit() {
            return;
        }
        let target = self.soft_limit() / 2;
        while inbox.pending.len() > target && !inbox.stopped {
            inbox = self.shared.drained.wait(inbox).unwrap();
        }
    }

    fn soft_limit(&self) -> usize {
        self.shared.soft_limit
    }

    /// Block until every queued delta has been applied.
    pub fn wait_idle(&self) {
        let mut inbox = self.shared.inbox.lock().unwrap();
        while (!inbox.pending.is_empty() || inbox.in_flush) && !inbox.stopped {
            inbox = self.shared.drained.wait(inbox).unwrap();
        }
    }

    /// Ask the thread to exit and join it. The current flush iteration
    /// finishes; deltas still queued are dropped (the durability
    /// boundary is the last committed batch).
    pub fn stop(&self) {
        {
            let mut inbox = self.shared.inbox.lock().unwrap();
            inbox.stopped = true;
            self.shared.wakeup.notify_one();
            self.shared.drained.notify_all();
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Syncer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        let batch = {
            let mut inbox = shared.inbox.lock().unwrap();
            loop {
                if inbox.stopped {
                    return;
                }
                if !inbox.pending.is_empty() {
                    break;
                }
                let (guard, _timeout) = shared
                    .wakeup
                    .wait_timeout(inbox, FLUSH_TIMEOUT)
                    .unwrap();
                inbox = guard;
            }
            inbox.in_flush = true;
            std::mem::take(&mut inbox.pending)
        };

        let result = apply(&shared.store_path, &batch);

        let mut inbox = shared.inbox.lock().unwrap();
        if let Err(err) = result {
            warn!(error = %err, "sync flush failed, re-queueing batch");
            // Merges are commutative, so folding the batch back in and
            // retrying on the next wake cannot lose or duplicate state.
            let mut requeued = batch;
            requeued.merge(std::mem::take(&mut inbox.pending));
            inbox.pending = requeued;
        }
        inbox.in_flush = false;
        shared.drained.notify_all();
    }
}

/// Apply one swapped-out batch. Phase order matters: purges first, then
/// names, then references and symbols against the symbol table, then
/// the dependency graph, the pch set, and the compile records.
fn apply(store_path: &Path, batch: &DeltaBatch) -> StorageResult<()> {
    if !batch.dirty.is_empty() {
        apply_dirty(store_path, &batch.dirty)?;
    }
    if !batch.symbol_names.is_empty() {
        apply_symbol_names(store_path, &batch.symbol_names)?;
    }
    if !batch.references.is_empty() || !batch.symbols.is_empty() {
        apply_symbols(store_path, &batch.references, batch.symbols.clone())?;
    }
    if !batch.dependencies.is_empty() {
        apply_dependencies(store_path, &batch.dependencies)?;
    }
    if !batch.pch_dependencies.is_empty() {
        let mut store = Store::open(store_path)?;
        let mut write = WriteBatch::new(Table::Dependency);
        write.put(b"pch", &batch.pch_dependencies)?;
        store.write(write)?;
    }
    if !batch.informations.is_empty() {
        let mut store = Store::open(store_path)?;
        let mut write = WriteBatch::new(Table::FileInformation);
        for (path, info) in &batch.informations {
            write.put(&information_key(path), info)?;
        }
        store.write(write)?;
    }
    trace!(entries = batch.len(), "sync flush committed");
    Ok(())
}

/// Remove the previous index contents of the given files: their symbol
/// records, and their locations from every symbol-name set. References
/// from clean files into the purged range are left in place; they now
/// point at empty records until the re-index lands.
fn apply_dirty(store_path: &Path, dirty: &BTreeSet<FileId>) -> StorageResult<()> {
    let mut store = Store::open(store_path)?;

    let mut symbols = WriteBatch::new(Table::Symbol);
    for file in dirty {
        let (start, end) = file_range(*file);
        symbols.delete_range(&start, &end);
    }
    store.write(symbols)?;

    let mut names = WriteBatch::new(Table::SymbolName);
    let mut edits: Vec<(Vec<u8>, BTreeSet<Location>)> = Vec::new();
    store.for_each(Table::SymbolName, |key, locations: BTreeSet<Location>| {
        let keep: BTreeSet<Location> = locations
            .iter()
            .copied()
            .filter(|loc| !dirty.contains(&loc.file_id()))
            .collect();
        if keep.len() != locations.len() {
            edits.push((key.to_vec(), keep));
        }
    })?;
    for (key, keep) in edits {
        if keep.is_empty() {
            names.delete(&key);
        } else {
            names.put(&key, &keep)?;
        }
    }
    store.write(names)?;
    Ok(())
}

fn apply_symbol_names(store_path: &Path, symbol_names: &SymbolNameMap) -> StorageResult<()> {
    let mut store = Store::open(store_path)?;
    let mut write = WriteBatch::new(Table::SymbolName);
    for (name, added) in symbol_names {
        let mut current: BTreeSet<Location> = store.read(Table::SymbolName, name.as_bytes());
        let before = current.len();
        current.extend(added.iter().copied());
        if current.len() != before {
            write.put(name.as_bytes(), &current)?;
        }
    }
    store.write(write)?;
    Ok(())
}

/// References and symbols are applied together against the symbol
/// table. A reference whose target is in the incoming symbol map is
/// folded into that in-memory record before it is written; otherwise
/// the on-disk record is read, modified, and queued. Linked references
/// (declaration/definition pairs) additionally symmetrize both sides:
/// each ends up with the union of references, and a null target is
/// filled with the asserted one. An existing target is never
/// overwritten.
fn apply_symbols(
    store_path: &Path,
    references: &ReferenceMap,
    mut symbols: SymbolMap,
) -> StorageResult<()> {
    let mut store = Store::open(store_path)?;
    let mut write = WriteBatch::new(Table::Symbol);

    for (ref_loc, (target_loc, kind)) in references {
        if let Some(mut target_info) = symbols.remove(target_loc) {
            target_info.references.insert(*ref_loc);
            if *kind != RefKind::Normal && ref_loc != target_loc {
                let mut other = symbols.remove(ref_loc).unwrap_or_default();
                other.references.extend(target_info.references.iter().copied());
                target_info.references.extend(other.references.iter().copied());
                if other.target.is_none() {
                    debug!(
                        reference = ref_loc.packed(),
                        target = target_loc.packed(),
                        "linking declaration to definition"
                    );
                    other.target = Some(*target_loc);
                }
                symbols.insert(*ref_loc, other);
            }
            symbols.insert(*target_loc, target_info);
        } else {
            let target_key = target_loc.padded_key();
            let mut current: CursorInfo = store.read(Table::Symbol, &target_key);
            let mut changed_current = current.references.insert(*ref_loc);
            if *kind != RefKind::Normal && ref_loc != target_loc {
                let ref_key = ref_loc.padded_key();
                let mut other: CursorInfo = store.read(Table::Symbol, &ref_key);
                let mut changed_other = other.references.insert(*ref_loc);
                let before_other = other.references.len();
                other.references.extend(current.references.iter().copied());
                changed_other |= other.references.len() != before_other;
                let before_current = current.references.len();
                current.references.extend(other.references.iter().copied());
                changed_current |= current.references.len() != before_current;
                if other.target.is_none() {
                    other.target = Some(*target_loc);
                    changed_other = true;
                }
                if changed_other {
                    write.put(&ref_key, &other)?;
                }
            }
            if changed_current {
                write.put(&target_key, &current)?;
            }
        }
    }

    for (loc, added) in &symbols {
        let key = loc.padded_key();
        let mut current: CursorInfo = store.read(Table::Symbol, &key);
        if current.unite(added) {
            write.put(&key, &current)?;
        }
    }

    store.write(write)?;
    Ok(())
}

fn apply_dependencies(store_path: &Path, dependencies: &DependencyMap) -> StorageResult<()> {
    let mut store = Store::open(store_path)?;
    let mut write = WriteBatch::new(Table::Dependency);
    for (file, added) in dependencies {
        let key = dependency_key(*file);
        let mut current: BTreeSet<FileId> = store.read(Table::Dependency, &key);
        let before = current.len();
        current.extend(added.iter().copied());
        if current.len() != before {
            write.put(&key, &current)?;
        }
    }
    store.write(write)?;
    Ok(())
}

/// Read one file's dependency entry (the set of files that include it).
pub fn read_dependencies(store: &Store, file: FileId) -> BTreeSet<FileId> {
    store.read(Table::Dependency, &dependency_key(file))
}
