//! The values stored in the symbol and file-information tables.

use crate::types::{CursorKind, Location};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Everything the index knows about one symbol location.
///
/// `references` is a sorted set so the serialized form is canonical:
/// indexing the same translation unit twice produces byte-identical
/// records.
///
/// Invariant maintained by the syncer: for any reference location `r`
/// of a symbol at `d`, either `d`'s record contains `r` in `references`
/// and `r`'s record has `target == d`, or both sides are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorInfo {
    pub kind: CursorKind,
    /// True when this location is a definition rather than a declaration
    /// or reference.
    pub definition: bool,
    /// Qualified symbol name, e.g. `Foo::bar`.
    pub symbol_name: String,
    /// Stable unique-symbol identifier from the front-end.
    pub usr: String,
    /// Byte length of the symbol token at this location.
    pub symbol_length: u32,
    /// Definition or canonical declaration this location points at.
    pub target: Option<Location>,
    pub references: BTreeSet<Location>,
}

impl CursorInfo {
    /// A record that carries no information; reads of absent keys
    /// produce this.
    pub fn is_empty(&self) -> bool {
        self.kind == CursorKind::Invalid
            && self.symbol_name.is_empty()
            && self.target.is_none()
            && self.references.is_empty()
    }

    /// Merge another record for the same location into this one.
    /// Returns true when anything changed.
    ///
    /// References are unioned. A null target is filled from the other
    /// side but an existing target is never overwritten. The richer
    /// cursor kind wins, and the name/usr/length travel with it.
    pub fn unite(&mut self, other: &CursorInfo) -> bool {
        let mut changed = false;

        let before = self.references.len();
        self.references.extend(other.references.iter().copied());
        changed |= self.references.len() != before;

        if self.target.is_none() && other.target.is_some() {
            self.target = other.target;
            changed = true;
        }

        if other.kind.rank() > self.kind.rank() {
            self.kind = other.kind;
            changed = true;
        }
        if other.definition && !self.definition {
            self.definition = true;
            changed = true;
        }
        if self.symbol_name.is_empty() && !other.symbol_name.is_empty() {
            self.symbol_name = other.symbol_name.clone();
            changed = true;
        }
        if self.usr.is_empty() && !other.usr.is_empty() {
            self.usr = other.usr.clone();
            changed = true;
        }
        if self.symbol_length == 0 && other.symbol_length != 0 {
            self.symbol_length = other.symbol_length;
            changed = true;
        }

        changed
    }

    /// Whether `offset` falls inside the symbol token at this record's
    /// location (used to match a query position to a symbol start).
    pub fn contains_offset(&self, start: u32, offset: u32) -> bool {
        offset >= start && offset < start + self.symbol_length.max(1)
    }
}

/// Per-source-file compile record: the arguments last used and when the
/// file was last indexed. Used to decide whether a translation unit is
/// dirty without re-parsing it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInformation {
    pub compile_args: Vec<String>,
    pub last_touched: i64,
}

impl FileInformation {
    pub fn new(compile_args: Vec<String>, last_touched: i64) -> Self {
        Self {
            compile_args,
            last_touched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileId;

    fn loc(file: u32, offset: u32) -> Location {
        Location::new(FileId::new(file).unwrap(), offset)
    }

    fn definition(name: &str) -> CursorInfo {
        CursorInfo {
            kind: CursorKind::Function,
            definition: true,
            symbol_name: name.to_string(),
            usr: format!("c:@F@{name}"),
            symbol_length: name.len() as u32,
            target: None,
            references: BTreeSet::new(),
        }
    }

    #[test]
    fn test_unite_unions_references() {
        let mut a = definition("foo");
        a.references.insert(loc(2, 10));

        let mut b = definition("foo");
        b.references.insert(loc(2, 10));
        b.references.insert(loc(3, 44));

        assert!(a.unite(&b));
        assert_eq!(a.references.len(), 2);
        // A second unite with the same record is a no-op.
        assert!(!a.unite(&b));
    }

    #[test]
    fn test_unite_first_non_null_target_wins() {
        let mut a = CursorInfo::default();
        let mut b = CursorInfo::default();
        b.target = Some(loc(1, 0));

        assert!(a.unite(&b));
        assert_eq!(a.target, Some(loc(1, 0)));

        let mut c = CursorInfo::default();
        c.target = Some(loc(9, 9));
        assert!(!a.unite(&c));
        assert_eq!(a.target, Some(loc(1, 0)));
    }

    #[test]
    fn test_unite_prefers_richer_kind() {
        let mut reference = CursorInfo {
            kind: CursorKind::Reference,
            ..CursorInfo::default()
        };
        let def = definition("foo");

        assert!(reference.unite(&def));
        assert_eq!(reference.kind, CursorKind::Function);
        assert!(reference.definition);
        assert_eq!(reference.symbol_name, "foo");
    }

    #[test]
    fn test_unite_is_commutative_on_state() {
        let mut a1 = definition("foo");
        a1.references.insert(loc(2, 1));
        let mut b1 = CursorInfo {
            kind: CursorKind::Reference,
            references: [loc(3, 7)].into_iter().collect(),
            ..CursorInfo::default()
        };

        let mut left = a1.clone();
        left.unite(&b1);
        b1.unite(&a1);

        assert_eq!(left.references, b1.references);
        assert_eq!(left.kind, b1.kind);
        assert_eq!(left.target, b1.target);
    }

    #[test]
    fn test_default_is_empty() {
        assert!(CursorInfo::default().is_empty());
        assert!(!definition("x").is_empty());
    }
}
