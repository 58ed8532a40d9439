//! The C/C++ front-end boundary.
//!
//! The indexer drives a front-end over each translation unit and
//! consumes a flat stream of cursor events: declarations and
//! definitions with synthesized USRs, and references already resolved
//! to their referent's position within the unit. The built-in
//! implementation is [`CParser`], backed by the tree-sitter C and C++
//! grammars.

mod c;

pub use c::CParser;

use crate::error::IndexResult;
use crate::types::{CursorKind, RefKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

/// A position inside a concrete file of the unit, before path interning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CursorPosition {
    pub file: PathBuf,
    pub offset: u32,
}

/// One cursor visited while walking a parsed unit.
#[derive(Debug, Clone)]
pub enum CursorEvent {
    /// A declaration, definition, or macro definition.
    Symbol {
        position: CursorPosition,
        kind: CursorKind,
        definition: bool,
        /// Unqualified name, e.g. `bar`.
        name: String,
        /// Qualified name, e.g. `Foo::bar`.
        qualified: String,
        /// Parameter list for callables, normalized, e.g. `(int,char*)`.
        signature: Option<String>,
        usr: String,
        length: u32,
    },
    /// A use of a symbol, resolved to its referent within the unit.
    /// `Linked` marks declaration/definition pairs the syncer
    /// symmetrizes.
    Reference {
        position: CursorPosition,
        length: u32,
        target: CursorPosition,
        kind: RefKind,
    },
}

/// A parse problem the front-end recovered from.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub file: PathBuf,
    pub offset: u32,
    pub message: String,
}

/// The front-end's view of one translation unit.
#[derive(Debug, Default)]
pub struct ParsedUnit {
    /// Every file pulled in by the unit, the main source excluded.
    pub includes: Vec<PathBuf>,
    pub cursors: Vec<CursorEvent>,
    pub diagnostics: Vec<Diagnostic>,
}

/// A front-end that can turn `(source_file, compiler_args)` into a
/// traversable unit. `aborted` is polled periodically; a cancelled
/// parse returns [`IndexError::Cancelled`](crate::IndexError::Cancelled).
pub trait Frontend: Send + Sync {
    fn parse(
        &self,
        source_file: &Path,
        args: &[String],
        aborted: &AtomicBool,
    ) -> IndexResult<ParsedUnit>;
}
