//! Query jobs: read-only lookups against the store, streamed line by
//! line to the requesting client.
//!
//! Every job writes through a [`JobContext`]; a context whose client
//! has gone away reports itself aborted, and jobs bail out between
//! lines.

use crate::intern::LocationInterner;
use crate::storage::{Store, Table};
use crate::symbol::CursorInfo;
use crate::types::{CursorKind, Location};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Output side of one running query job.
pub struct JobContext {
    out: Sender<String>,
    aborted: Arc<AtomicBool>,
}

impl JobContext {
    pub fn channel() -> (Self, Receiver<String>, Arc<AtomicBool>) {
        let (tx, rx) = unbounded();
        let aborted = Arc::new(AtomicBool::new(false));
        (
            Self {
                out: tx,
                aborted: Arc::clone(&aborted),
            },
            rx,
            aborted,
        )
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Send one output line. Returns false once the job should stop:
    /// either the abort flag is up or the receiving side is gone.
    pub fn write(&self, line: impl Into<String>) -> bool {
        if self.is_aborted() {
            return false;
        }
        self.out.send(line.into()).is_ok()
    }
}

/// Parse a `path,offset` location. The file must already be known to
/// the interner.
pub fn parse_location(raw: &str, interner: &LocationInterner) -> Option<Location> {
    let (path, offset) = raw.rsplit_once(',')?;
    let offset: u32 = offset.trim().parse().ok()?;
    let path = PathBuf::from(path);
    let file_id = interner.file_id(&path).or_else(|| {
        let canonical = std::fs::canonicalize(&path).ok()?;
        interner.file_id(&canonical)
    })?;
    Some(Location::new(file_id, offset))
}

/// The symbol whose token covers `loc`: the greatest table key at or
/// before the position, accepted when the position falls inside its
/// token.
pub fn find_symbol_at(store: &Store, loc: Location) -> Option<(Location, CursorInfo)> {
    let (key, info): (Vec<u8>, CursorInfo) = store
        .read_floor(Table::Symbol, &loc.padded_key())
        .ok()
        .flatten()?;
    let found = Location::from_padded_key(&key)?;
    if found.file_id() != loc.file_id() {
        return None;
    }
    if !info.contains_offset(found.offset(), loc.offset()) {
        return None;
    }
    Some((found, info))
}

/// A definition (or failing that, any other location) carrying `name`
/// with the same USR, used to hop across translation units when a
/// declaration has no linked definition.
fn find_definition_by_name(
    store: &Store,
    name: &str,
    usr: &str,
    exclude: Location,
) -> Option<Location> {
    if name.is_empty() {
        return None;
    }
    let candidates: BTreeSet<Location> = store.read(Table::SymbolName, name.as_bytes());
    let mut fallback = None;
    for candidate in candidates {
        if candidate == exclude {
            continue;
        }
        let info: CursorInfo = store.read(Table::Symbol, &candidate.padded_key());
        if !usr.is_empty() && info.usr != usr {
            continue;
        }
        if info.definition {
            return Some(candidate);
        }
        fallback.get_or_insert(candidate);
    }
    fallback
}

/// Go-to-definition. Follows the record's target, and when a
/// declaration has no target (its definition lives in another
/// translation unit) falls back to the name index.
pub fn follow_location(
    store: &Store,
    interner: &LocationInterner,
    loc: Location,
) -> Option<String> {
    let (start_loc, start) = find_symbol_at(store, loc)?;

    let mut target = start.target;
    if target.is_none() && !start.definition {
        target = find_definition_by_name(store, &start.symbol_name, &start.usr, start_loc);
    }
    let target = target?;

    let target_info: CursorInfo = store.read(Table::Symbol, &target.padded_key());
    if !target_info.definition {
        let next = target_info.target.or_else(|| {
            find_definition_by_name(store, &target_info.symbol_name, &target_info.usr, target)
        });
        if let Some(next) = next {
            if next != start_loc {
                return Some(interner.display(next));
            }
        }
    }
    Some(interner.display(target))
}

/// Resolve `loc` to its symbol record and emit every reference, pulling
/// in same-USR records from other translation units so cross-file call
/// sites show up.
pub fn references_location(
    store: &Store,
    interner: &LocationInterner,
    ctx: &JobContext,
    loc: Location,
) {
    let Some((start_loc, start)) = find_symbol_at(store, loc) else {
        return;
    };
    let (sym_loc, sym) = if start.kind == CursorKind::Reference {
        match start.target {
            Some(target) => {
                let info: CursorInfo = store.read(Table::Symbol, &target.padded_key());
                (target, info)
            }
            None => (start_loc, start),
        }
    } else {
        (start_loc, start)
    };

    let mut all = sym.references.clone();
    let siblings: BTreeSet<Location> = store.read(Table::SymbolName, sym.symbol_name.as_bytes());
    for sibling in siblings {
        if sibling == sym_loc {
            continue;
        }
        let info: CursorInfo = store.read(Table::Symbol, &sibling.padded_key());
        if info.usr == sym.usr {
            all.extend(info.references.iter().copied());
        }
    }

    for reference in all {
        if !ctx.write(interner.display(reference)) {
            return;
        }
    }
}

/// Every reference to every symbol carrying `name`.
pub fn references_name(store: &Store, interner: &LocationInterner, ctx: &JobContext, name: &str) {
    let locations: BTreeSet<Location> = store.read(Table::SymbolName, name.as_bytes());
    let mut all = BTreeSet::new();
    for location in &locations {
        let info: CursorInfo = store.read(Table::Symbol, &location.padded_key());
        all.extend(info.references.iter().copied());
    }
    for reference in all {
        if !ctx.write(interner.display(reference)) {
            return;
        }
    }
}

/// All symbol names, optionally filtered by substring.
pub fn list_symbols(store: &Store, ctx: &JobContext, pattern: &str) {
    let Ok(keys) = store.keys(Table::SymbolName) else {
        return;
    };
    for key in keys {
        let name = String::from_utf8_lossy(&key);
        if pattern.is_empty() || name.contains(pattern) {
            if !ctx.write(name.into_owned()) {
                return;
            }
        }
    }
}

/// Locations declaring the exact name.
pub fn find_symbols(store: &Store, interner: &LocationInterner, ctx: &JobContext, name: &str) {
    let locations: BTreeSet<Location> = store.read(Table::SymbolName, name.as_bytes());
    for location in locations {
        if !ctx.write(interner.display(location)) {
            return;
        }
    }
}

/// Everything the index knows about the symbol at `loc`.
pub fn cursor_info(store: &Store, interner: &LocationInterner, ctx: &JobContext, loc: Location) {
    let Some((found, info)) = find_symbol_at(store, loc) else {
        ctx.write("no symbol");
        return;
    };
    ctx.write(format!(
        "{} kind: {}{}",
        interner.display(found),
        info.kind.display(),
        if info.definition { " (definition)" } else { "" },
    ));
    if !info.symbol_name.is_empty() {
        ctx.write(format!("name: {}", info.symbol_name));
    }
    if !info.usr.is_empty() {
        ctx.write(format!("usr: {}", info.usr));
    }
    if let Some(target) = info.target {
        ctx.write(format!("target: {}", interner.display(target)));
    }
    for reference in &info.references {
        if !ctx.write(format!("reference: {}", interner.display(*reference))) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::WriteBatch;
    use crate::types::FileId;
    use std::path::Path;
    use tempfile::TempDir;

    fn loc(file: u32, offset: u32) -> Location {
        Location::new(FileId::new(file).unwrap(), offset)
    }

    /// Store shaped like the two-file scenario: a definition in one
    /// file, an extern declaration and a call site in another.
    fn fixture() -> (TempDir, Store, LocationInterner) {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(&dir.path().join("index.db")).unwrap();
        let interner = LocationInterner::new();
        interner.insert_file(Path::new("/src/a.c"));
        interner.insert_file(Path::new("/src/b.c"));

        let def = loc(1, 4);
        let decl = loc(2, 11);
        let call = loc(2, 52);

        let mut batch = WriteBatch::new(Table::Symbol);
        batch
            .put(
                &def.padded_key(),
                &CursorInfo {
                    kind: CursorKind::Function,
                    definition: true,
                    symbol_name: "foo".into(),
                    usr: "c:@F@foo(void)".into(),
                    symbol_length: 3,
                    target: None,
                    references: BTreeSet::new(),
                },
            )
            .unwrap();
        batch
            .put(
                &decl.padded_key(),
                &CursorInfo {
                    kind: CursorKind::Function,
                    definition: false,
                    symbol_name: "foo".into(),
                    usr: "c:@F@foo(void)".into(),
                    symbol_length: 3,
                    target: None,
                    references: [call].into_iter().collect(),
                },
            )
            .unwrap();
        batch
            .put(
                &call.padded_key(),
                &CursorInfo {
                    kind: CursorKind::Reference,
                    symbol_length: 3,
                    target: Some(decl),
                    ..CursorInfo::default()
                },
            )
            .unwrap();
        store.write(batch).unwrap();

        let mut names = WriteBatch::new(Table::SymbolName);
        let set: BTreeSet<Location> = [def, decl].into_iter().collect();
        names.put(b"foo", &set).unwrap();
        store.write(names).unwrap();

        (dir, store, interner)
    }

    #[test]
    fn test_find_symbol_at_covers_token() {
        let (_dir, store, _interner) = fixture();
        // Offset inside the 3-byte token starting at 4.
        assert!(find_symbol_at(&store, loc(1, 5)).is_some());
        // Past the token end.
        assert!(find_symbol_at(&store, loc(1, 9)).is_none());
        // Different file with a smaller key.
        assert!(find_symbol_at(&store, loc(3, 0)).is_none());
    }

    #[test]
    fn test_follow_from_call_site_reaches_definition() {
        let (_dir, store, interner) = fixture();
        let result = follow_location(&store, &interner, loc(2, 52)).unwrap();
        assert_eq!(result, "/src/a.c,4");
    }

    #[test]
    fn test_follow_from_declaration_reaches_definition() {
        let (_dir, store, interner) = fixture();
        let result = follow_location(&store, &interner, loc(2, 11)).unwrap();
        assert_eq!(result, "/src/a.c,4");
    }

    #[test]
    fn test_references_on_definition_sees_cross_file_call() {
        let (_dir, store, interner) = fixture();
        let (ctx, rx, _aborted) = JobContext::channel();
        references_location(&store, &interner, &ctx, loc(1, 4));
        drop(ctx);
        let lines: Vec<String> = rx.into_iter().collect();
        assert_eq!(lines, vec!["/src/b.c,52".to_string()]);
    }

    #[test]
    fn test_aborted_context_stops_output() {
        let (_dir, store, interner) = fixture();
        let (ctx, rx, aborted) = JobContext::channel();
        aborted.store(true, Ordering::Relaxed);
        references_location(&store, &interner, &ctx, loc(1, 4));
        drop(ctx);
        assert_eq!(rx.into_iter().count(), 0);
    }

    #[test]
    fn test_dropped_client_stops_job_immediately() {
        let (ctx, rx, _aborted) = JobContext::channel();
        drop(rx);
        let start = std::time::Instant::now();
        assert!(!ctx.write("chunk"));
        assert!(start.elapsed() < std::time::Duration::from_millis(100));
    }

    #[test]
    fn test_parse_location() {
        let interner = LocationInterner::new();
        let id = interner.insert_file(Path::new("/src/a.c"));
        let parsed = parse_location("/src/a.c,42", &interner).unwrap();
        assert_eq!(parsed, Location::new(id, 42));
        assert!(parse_location("/unknown.c,1", &interner).is_none());
        assert!(parse_location("garbage", &interner).is_none());
    }

    #[test]
    fn test_list_and_find_symbols() {
        let (_dir, store, interner) = fixture();
        let (ctx, rx, _a) = JobContext::channel();
        list_symbols(&store, &ctx, "fo");
        drop(ctx);
        assert_eq!(rx.into_iter().collect::<Vec<_>>(), vec!["foo".to_string()]);

        let (ctx, rx, _a) = JobContext::channel();
        find_symbols(&store, &interner, &ctx, "foo");
        drop(ctx);
        let lines: Vec<String> = rx.into_iter().collect();
        assert_eq!(lines, vec!["/src/a.c,4".to_string(), "/src/b.c,11".to_string()]);
    }
}
