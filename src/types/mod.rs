use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::path::PathBuf;

/// Dense file identifier handed out by the [`LocationInterner`](crate::LocationInterner).
///
/// Ids start at 1 and are never reused; 0 is the invalid sentinel, which
/// is why the representation is `NonZeroU32` behind an `Option` at the
/// API edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(NonZeroU32);

impl FileId {
    pub fn new(value: u32) -> Option<Self> {
        NonZeroU32::new(value).map(Self)
    }

    pub fn value(&self) -> u32 {
        self.0.get()
    }
}

/// A position in the indexed tree: file id in the upper 32 bits, byte
/// offset within that file in the lower 32.
///
/// Two encodings exist. The compact in-memory form is the packed `u64`
/// itself; the store-key form is the same value as fixed-width
/// big-endian bytes, so lexicographic key order equals numeric order
/// and all locations of one file are contiguous in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location(u64);

impl Location {
    pub fn new(file: FileId, offset: u32) -> Self {
        Self((u64::from(file.value()) << 32) | u64::from(offset))
    }

    pub fn file_id(&self) -> FileId {
        // A Location can only be built from a valid FileId, so the upper
        // word is non-zero by construction.
        FileId::new((self.0 >> 32) as u32).unwrap()
    }

    pub fn offset(&self) -> u32 {
        self.0 as u32
    }

    pub fn packed(&self) -> u64 {
        self.0
    }

    /// Rebuild from the compact form. Returns `None` when the file word
    /// is the invalid sentinel.
    pub fn from_packed(raw: u64) -> Option<Self> {
        if raw >> 32 == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Sort-friendly fixed-width store key.
    pub fn padded_key(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_padded_key(key: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = key.try_into().ok()?;
        Self::from_packed(u64::from_be_bytes(bytes))
    }
}

/// What kind of entity a cursor denotes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum CursorKind {
    #[default]
    Invalid,
    Reference,
    Parameter,
    Field,
    EnumConstant,
    Variable,
    Typedef,
    Macro,
    Enum,
    Union,
    Struct,
    Class,
    Namespace,
    Method,
    Function,
}

impl CursorKind {
    /// Merge preference: when two records disagree about a location's
    /// kind, the higher-ranked one wins.
    pub fn rank(&self) -> u8 {
        *self as u8
    }

    pub fn display(&self) -> &'static str {
        match self {
            CursorKind::Invalid => "invalid",
            CursorKind::Reference => "reference",
            CursorKind::Parameter => "parameter",
            CursorKind::Field => "field",
            CursorKind::EnumConstant => "enum-constant",
            CursorKind::Variable => "variable",
            CursorKind::Typedef => "typedef",
            CursorKind::Macro => "macro",
            CursorKind::Enum => "enum",
            CursorKind::Union => "union",
            CursorKind::Struct => "struct",
            CursorKind::Class => "class",
            CursorKind::Namespace => "namespace",
            CursorKind::Method => "method",
            CursorKind::Function => "function",
        }
    }
}

/// How a reference edge relates the two locations it connects.
///
/// `Linked` marks declaration/definition (or override) pairs; the syncer
/// symmetrizes those so both sides carry the union of references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefKind {
    Normal,
    Linked,
}

/// Why a translation unit was submitted for indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    /// Fresh submission from a project build.
    Makefile,
    /// Re-index triggered by a change to the file or a dependency.
    Dirty,
    /// Diagnostic dump of the cursor stream; output goes to the client,
    /// nothing is persisted.
    Dump,
}

/// One compile invocation: the source file plus the compiler arguments
/// it was (or will be) parsed with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInformation {
    pub source_file: PathBuf,
    pub args: Vec<String>,
}

impl SourceInformation {
    pub fn new(source_file: PathBuf, args: Vec<String>) -> Self {
        Self { source_file, args }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_creation() {
        assert!(FileId::new(0).is_none());

        let id = FileId::new(42).unwrap();
        assert_eq!(id.value(), 42);
    }

    #[test]
    fn test_location_pack_unpack() {
        let file = FileId::new(7).unwrap();
        let loc = Location::new(file, 1234);

        assert_eq!(loc.file_id(), file);
        assert_eq!(loc.offset(), 1234);
        assert_eq!(Location::from_packed(loc.packed()), Some(loc));
    }

    #[test]
    fn test_location_zero_file_is_invalid() {
        assert_eq!(Location::from_packed(99), None);
        assert_eq!(Location::from_padded_key(&99u64.to_be_bytes()), None);
    }

    #[test]
    fn test_padded_key_round_trip() {
        let loc = Location::new(FileId::new(0xABCD).unwrap(), 0xDEAD_BEEF);
        let key = loc.padded_key();
        assert_eq!(key.len(), 8);
        assert_eq!(Location::from_padded_key(&key), Some(loc));
    }

    #[test]
    fn test_padded_key_preserves_order() {
        let a = Location::new(FileId::new(1).unwrap(), 500);
        let b = Location::new(FileId::new(1).unwrap(), 501);
        let c = Location::new(FileId::new(2).unwrap(), 0);

        assert!(a < b && b < c);
        assert!(a.padded_key() < b.padded_key());
        assert!(b.padded_key() < c.padded_key());
    }

    #[test]
    fn test_kind_rank_prefers_definitions() {
        assert!(CursorKind::Function.rank() > CursorKind::Reference.rank());
        assert!(CursorKind::Struct.rank() > CursorKind::Variable.rank());
        assert_eq!(CursorKind::default(), CursorKind::Invalid);
    }
}
