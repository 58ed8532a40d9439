//! Tree-sitter based C/C++ front-end.
//!
//! Parses the main source file, resolves its `#include` directives
//! against the `-I` directories from the compile arguments, and parses
//! the local headers it can find, so declarations in headers get
//! locations in their own files. References are resolved by name to the
//! declarations collected across the unit; declaration/definition pairs
//! of the same USR are emitted as linked references.

use super::{CursorEvent, CursorPosition, Diagnostic, Frontend, ParsedUnit};
use crate::error::{IndexError, IndexResult};
use crate::types::{CursorKind, RefKind};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tree_sitter::{Node, Parser};

/// How many nodes to walk between cancellation checks.
const ABORT_CHECK_INTERVAL: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    C,
    Cpp,
}

impl Dialect {
    fn from_path(path: &Path, args: &[String]) -> Self {
        if args.iter().any(|a| a == "c++" || a == "-xc++") {
            return Dialect::Cpp;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("cc") | Some("cpp") | Some("cxx") | Some("C") | Some("hpp") | Some("hh")
            | Some("hxx") => Dialect::Cpp,
            _ => Dialect::C,
        }
    }

    fn language(self) -> tree_sitter::Language {
        match self {
            Dialect::C => tree_sitter_c::LANGUAGE.into(),
            Dialect::Cpp => tree_sitter_cpp::LANGUAGE.into(),
        }
    }
}

/// A declaration or definition collected during the walk.
#[derive(Debug, Clone)]
struct DeclRecord {
    position: CursorPosition,
    kind: CursorKind,
    definition: bool,
    name: String,
    qualified: String,
    signature: Option<String>,
    usr: String,
    length: u32,
}

/// An identifier use waiting for name resolution.
#[derive(Debug)]
struct PendingRef {
    position: CursorPosition,
    name: String,
    length: u32,
}

/// Front-end over the tree-sitter C and C++ grammars.
#[derive(Debug, Default)]
pub struct CParser;

impl CParser {
    pub fn new() -> Self {
        Self
    }
}

impl Frontend for CParser {
    fn parse(
        &self,
        source_file: &Path,
        args: &[String],
        aborted: &AtomicBool,
    ) -> IndexResult<ParsedUnit> {
        let mut builder = UnitBuilder::new(source_file, args, aborted);
        builder.run()?;
        Ok(builder.finish())
    }
}

struct UnitBuilder<'a> {
    source_file: PathBuf,
    args: &'a [String],
    include_dirs: Vec<PathBuf>,
    aborted: &'a AtomicBool,
    visited: HashSet<PathBuf>,
    includes: Vec<PathBuf>,
    decls: Vec<DeclRecord>,
    /// USR -> indexes into `decls`, for def/decl linking.
    by_usr: HashMap<String, Vec<usize>>,
    /// Plain and qualified name -> USR, for reference resolution.
    by_name: HashMap<String, String>,
    /// Byte ranges of declaration name tokens, so a name is not also
    /// counted as a reference to itself.
    decl_positions: HashSet<(PathBuf, u32)>,
    refs: Vec<PendingRef>,
    diagnostics: Vec<Diagnostic>,
    nodes_walked: u32,
}

impl<'a> UnitBuilder<'a> {
    fn new(source_file: &Path, args: &'a [String], aborted: &'a AtomicBool) -> Self {
        let mut include_dirs = Vec::new();
        if let Some(parent) = source_file.parent() {
            include_dirs.push(parent.to_path_buf());
        }
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if let Some(dir) = arg.strip_prefix("-I") {
                if dir.is_empty() {
                    if let Some(dir) = iter.next() {
                        include_dirs.push(PathBuf::from(dir));
                    }
                } else {
                    include_dirs.push(PathBuf::from(dir));
                }
            }
        }
        Self {
            source_file: source_file.to_path_buf(),
            args,
            include_dirs,
            aborted,
            visited: HashSet::new(),
            includes: Vec::new(),
            decls: Vec::new(),
            by_usr: HashMap::new(),
            by_name: HashMap::new(),
            decl_positions: HashSet::new(),
            refs: Vec::new(),
            diagnostics: Vec::new(),
            nodes_walked: 0,
        }
    }

    fn run(&mut self) -> IndexResult<()> {
        let mut queue = vec![self.source_file.clone()];
        while let Some(file) = queue.pop() {
            if !self.visited.insert(file.clone()) {
                continue;
            }
            self.check_aborted()?;

            let code = std::fs::read_to_string(&file).map_err(|e| IndexError::FileRead {
                path: file.clone(),
                source: e,
            })?;

            let dialect = Dialect::from_path(&file, self.args);
            let mut parser = Parser::new();
            parser
                .set_language(&dialect.language())
                .map_err(|e| IndexError::Parse {
                    path: file.clone(),
                    message: format!("cannot load grammar: {e}"),
                })?;
            let tree = parser.parse(&code, None).ok_or_else(|| IndexError::Parse {
                path: file.clone(),
                message: "front-end produced no tree".into(),
            })?;

            let root = tree.root_node();
            for resolved in self.collect_includes(root, &code, &file) {
                if !self.visited.contains(&resolved) {
                    queue.push(resolved.clone());
                }
                if resolved != self.source_file && !self.includes.contains(&resolved) {
                    self.includes.push(resolved);
                }
            }
            self.walk(root, &code, &file, &[])?;
        }
        Ok(())
    }

    fn check_aborted(&mut self) -> IndexResult<()> {
        if self.aborted.load(Ordering::Relaxed) {
            return Err(IndexError::Cancelled);
        }
        Ok(())
    }

    fn tick(&mut self) -> IndexResult<()> {
        self.nodes_walked += 1;
        if self.nodes_walked % ABORT_CHECK_INTERVAL == 0 {
            self.check_aborted()?;
        }
        Ok(())
    }

    /// Resolve `#include` paths: quoted ones relative to the including
    /// file first, then the `-I` directories; angled ones only against
    /// the `-I` directories. Unresolvable (system) headers are skipped.
    fn collect_includes(&self, root: Node, code: &str, from: &Path) -> Vec<PathBuf> {
        let mut resolved = Vec::new();
        let mut cursor = root.walk();
        for child in root.children(&mut cursor) {
            if child.kind() != "preproc_include" {
                continue;
            }
            let Some(path_node) = child.child_by_field_name("path") else {
                continue;
            };
            let raw = &code[path_node.byte_range()];
            let (name, quoted) = if raw.starts_with('"') {
                (raw.trim_matches('"'), true)
            } else {
                (raw.trim_start_matches('<').trim_end_matches('>'), false)
            };

            let mut candidates = Vec::new();
            if quoted {
                if let Some(parent) = from.parent() {
                    candidates.push(parent.join(name));
                }
            }
            for dir in &self.include_dirs {
                candidates.push(dir.join(name));
            }
            if let Some(hit) = candidates.into_iter().find(|c| c.is_file()) {
                let hit = hit.canonicalize().unwrap_or(hit);
                resolved.push(hit);
            }
        }
        resolved
    }

    fn walk(&mut self, node: Node, code: &str, file: &Path, scope: &[String]) -> IndexResult<()> {
        self.tick()?;

        if node.is_error() || node.is_missing() {
            if self.diagnostics.len() < 64 {
                self.diagnostics.push(Diagnostic {
                    file: file.to_path_buf(),
                    offset: node.start_byte() as u32,
                    message: format!("syntax error near byte {}", node.start_byte()),
                });
            }
            return Ok(());
        }

        let mut inner_scope: Option<Vec<String>> = None;
        match node.kind() {
            "function_definition" => {
                self.handle_callable(node, code, file, scope, true);
            }
            "declaration" => {
                if find_descendant(node, "function_declarator").is_some() {
                    self.handle_callable(node, code, file, scope, false);
                } else {
                    self.handle_variable(node, code, file, scope);
                }
            }
            "struct_specifier" | "class_specifier" | "union_specifier" | "enum_specifier" => {
                if node.child_by_field_name("body").is_some() {
                    if let Some(name_node) = node.child_by_field_name("name") {
                        let name = code[name_node.byte_range()].to_string();
                        let kind = match node.kind() {
                            "struct_specifier" => CursorKind::Struct,
                            "class_specifier" => CursorKind::Class,
                            "union_specifier" => CursorKind::Union,
                            _ => CursorKind::Enum,
                        };
                        self.record_decl(name_node, code, file, scope, kind, true, None);
                        let mut scoped = scope.to_vec();
                        scoped.push(name);
                        inner_scope = Some(scoped);
                    }
                }
            }
            "namespace_definition" => {
                if let Some(name_node) = node.child_by_field_name("name") {
                    let name = code[name_node.byte_range()].to_string();
                    self.record_decl(name_node, code, file, scope, CursorKind::Namespace, true, None);
                    let mut scoped = scope.to_vec();
                    scoped.push(name);
                    inner_scope = Some(scoped);
                }
            }
            "type_definition" => {
                if let Some(name_node) = find_descendant_in_field(node, "declarator", "type_identifier")
                {
                    self.record_decl(name_node, code, file, scope, CursorKind::Typedef, true, None);
                }
            }
            "preproc_def" | "preproc_function_def" => {
                if let Some(name_node) = node.child_by_field_name("name") {
                    self.record_decl(name_node, code, file, scope, CursorKind::Macro, true, None);
                }
            }
            "field_declaration" => {
                if let Some(name_node) = find_descendant(node, "field_identifier") {
                    if find_descendant(node, "function_declarator").is_some() {
                        self.handle_callable(node, code, file, scope, false);
                    } else {
                        self.record_decl(name_node, code, file, scope, CursorKind::Field, true, None);
                    }
                }
            }
            "enumerator" => {
                if let Some(name_node) = node.child_by_field_name("name") {
                    self.record_decl(
                        name_node,
                        code,
                        file,
                        scope,
                        CursorKind::EnumConstant,
                        true,
                        None,
                    );
                }
            }
            "call_expression" => {
                if let Some(function) = node.child_by_field_name("function") {
                    if matches!(function.kind(), "identifier" | "qualified_identifier") {
                        self.record_ref(function, code, file);
                    }
                }
            }
            "identifier" | "type_identifier" => {
                self.record_ref(node, code, file);
            }
            _ => {}
        }

        let scope = inner_scope.as_deref().unwrap_or(scope);
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            self.walk(child, code, file, scope)?;
        }
        Ok(())
    }

    /// Function definitions, prototypes, and method declarations.
    fn handle_callable(
        &mut self,
        node: Node,
        code: &str,
        file: &Path,
        scope: &[String],
        definition: bool,
    ) {
        let Some(declarator) = find_descendant(node, "function_declarator") else {
            return;
        };
        let Some(name_node) = find_name_node(declarator) else {
            return;
        };
        let signature = declarator
            .child_by_field_name("parameters")
            .map(|p| normalize_signature(&code[p.byte_range()]));
        let kind = if !scope.is_empty() || name_node.kind() == "qualified_identifier" {
            CursorKind::Method
        } else {
            CursorKind::Function
        };
        self.record_decl(name_node, code, file, scope, kind, definition, signature);
    }

    fn handle_variable(&mut self, node: Node, code: &str, file: &Path, scope: &[String]) {
        // `extern` declarations are declarations, everything else at
        // this point defines storage.
        let mut is_extern = false;
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.kind() == "storage_class_specifier" && &code[child.byte_range()] == "extern" {
                is_extern = true;
            }
        }
        let Some(name_node) = find_variable_name(node) else {
            return;
        };
        self.record_decl(
            name_node,
            code,
            file,
            scope,
            CursorKind::Variable,
            !is_extern,
            None,
        );
    }

    fn record_decl(
        &mut self,
        name_node: Node,
        code: &str,
        file: &Path,
        scope: &[String],
        kind: CursorKind,
        definition: bool,
        signature: Option<String>,
    ) {
        let raw_name = &code[name_node.byte_range()];
        // Qualified declarator names (`Foo::bar`) carry their own scope.
        let (name, qualified) = if let Some((_, last)) = raw_name.rsplit_once("::") {
            (last.to_string(), raw_name.to_string())
        } else if scope.is_empty() {
            (raw_name.to_string(), raw_name.to_string())
        } else {
            (
                raw_name.to_string(),
                format!("{}::{}", scope.join("::"), raw_name),
            )
        };

        let usr = make_usr(kind, &qualified, signature.as_deref());
        let position = CursorPosition {
            file: file.to_path_buf(),
            offset: name_node.start_byte() as u32,
        };
        self.decl_positions
            .insert((position.file.clone(), position.offset));

        let record = DeclRecord {
            position,
            kind,
            definition,
            name: name.clone(),
            qualified: qualified.clone(),
            signature,
            usr: usr.clone(),
            length: raw_name.len() as u32,
        };
        let index = self.decls.len();
        self.decls.push(record);
        self.by_usr.entry(usr.clone()).or_default().push(index);
        self.by_name.entry(name).or_insert_with(|| usr.clone());
        self.by_name.entry(qualified).or_insert(usr);
    }

    fn record_ref(&mut self, node: Node, code: &str, file: &Path) {
        let offset = node.start_byte() as u32;
        let key = (file.to_path_buf(), offset);
        if self.decl_positions.contains(&key) {
            return;
        }
        let name = code[node.byte_range()].to_string();
        self.refs.push(PendingRef {
            position: CursorPosition {
                file: key.0,
                offset,
            },
            length: name.len() as u32,
            name,
        });
    }

    /// Turn the collected declarations and raw references into the
    /// event stream: one Symbol per declaration, one Normal reference
    /// per resolved identifier use, and one Linked reference per
    /// declaration that has a sibling definition with the same USR.
    fn finish(mut self) -> ParsedUnit {
        let mut cursors: Vec<CursorEvent> = self
            .decls
            .iter()
            .map(|decl| CursorEvent::Symbol {
                position: decl.position.clone(),
                kind: decl.kind,
                definition: decl.definition,
                name: decl.name.clone(),
                qualified: decl.qualified.clone(),
                signature: decl.signature.clone(),
                usr: decl.usr.clone(),
                length: decl.length,
            })
            .collect();

        // Canonical referent per USR: the definition when there is one,
        // the first declaration otherwise.
        let mut canonical: HashMap<&str, &DeclRecord> = HashMap::new();
        for indexes in self.by_usr.values() {
            let records: Vec<&DeclRecord> = indexes.iter().map(|i| &self.decls[*i]).collect();
            let target = records
                .iter()
                .find(|r| r.definition)
                .copied()
                .unwrap_or(records[0]);
            canonical.insert(target.usr.as_str(), target);
        }

        let mut seen_refs: HashSet<(PathBuf, u32)> = HashSet::new();
        for pending in std::mem::take(&mut self.refs) {
            let Some(usr) = self.by_name.get(&pending.name) else {
                continue;
            };
            let Some(target) = canonical.get(usr.as_str()) else {
                continue;
            };
            if !seen_refs.insert((pending.position.file.clone(), pending.position.offset)) {
                continue;
            }
            cursors.push(CursorEvent::Reference {
                position: pending.position,
                length: pending.length,
                target: target.position.clone(),
                kind: RefKind::Normal,
            });
        }

        // Declaration <-> definition links.
        for indexes in self.by_usr.values() {
            let Some(def_index) = indexes.iter().find(|i| self.decls[**i].definition) else {
                continue;
            };
            let def_position = self.decls[*def_index].position.clone();
            for index in indexes {
                let decl = &self.decls[*index];
                if decl.definition {
                    continue;
                }
                cursors.push(CursorEvent::Reference {
                    position: decl.position.clone(),
                    length: decl.length,
                    target: def_position.clone(),
                    kind: RefKind::Linked,
                });
            }
        }

        ParsedUnit {
            includes: self.includes,
            cursors,
            diagnostics: self.diagnostics,
        }
    }
}

/// First matching descendant, depth-first.
fn find_descendant<'t>(node: Node<'t>, kind: &str) -> Option<Node<'t>> {
    if node.kind() == kind {
        return Some(node);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if let Some(found) = find_descendant(child, kind) {
            return Some(found);
        }
    }
    None
}

fn find_descendant_in_field<'t>(node: Node<'t>, field: &str, kind: &str) -> Option<Node<'t>> {
    node.child_by_field_name(field)
        .and_then(|child| find_descendant(child, kind))
}

/// The name token of a function declarator: a plain identifier, a
/// field identifier (C++ method), or a qualified identifier
/// (`Foo::bar` out-of-line definition).
fn find_name_node(declarator: Node) -> Option<Node> {
    let inner = declarator.child_by_field_name("declarator")?;
    match inner.kind() {
        "identifier" | "field_identifier" | "qualified_identifier" | "destructor_name"
        | "operator_name" => Some(inner),
        _ => find_descendant(inner, "identifier"),
    }
}

fn find_variable_name(node: Node) -> Option<Node> {
    if let Some(init) = find_descendant(node, "init_declarator") {
        return find_descendant(init, "identifier");
    }
    // Plain `int x;` has the identifier directly under the declarator
    // field; look there before falling back to any identifier, so type
    // names are not mistaken for the variable.
    if let Some(declarator) = node.child_by_field_name("declarator") {
        if declarator.kind() == "identifier" {
            return Some(declarator);
        }
        return find_descendant(declarator, "identifier");
    }
    None
}

fn normalize_signature(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_space = false;
    for ch in raw.chars() {
        if ch.is_whitespace() {
            last_space = true;
            continue;
        }
        if last_space
            && out
                .chars()
                .last()
                .is_some_and(|prev| prev.is_alphanumeric() || prev == '_')
            && (ch.is_alphanumeric() || ch == '_')
        {
            out.push(' ');
        }
        last_space = false;
        out.push(ch);
    }
    out
}

fn make_usr(kind: CursorKind, qualified: &str, signature: Option<&str>) -> String {
    match kind {
        CursorKind::Function | CursorKind::Method => {
            format!("c:@F@{}{}", qualified, signature.unwrap_or("()"))
        }
        CursorKind::Struct | CursorKind::Class => format!("c:@S@{qualified}"),
        CursorKind::Union => format!("c:@U@{qualified}"),
        CursorKind::Enum => format!("c:@E@{qualified}"),
        CursorKind::EnumConstant => format!("c:@Ea@{qualified}"),
        CursorKind::Typedef => format!("c:@T@{qualified}"),
        CursorKind::Macro => format!("c:@macro@{qualified}"),
        CursorKind::Namespace => format!("c:@N@{qualified}"),
        CursorKind::Field => format!("c:@FI@{qualified}"),
        _ => format!("c:@{qualified}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn parse(dir: &TempDir, file: &str) -> ParsedUnit {
        let parser = CParser::new();
        let aborted = AtomicBool::new(false);
        parser
            .parse(&dir.path().join(file), &[], &aborted)
            .unwrap()
    }

    fn symbols(unit: &ParsedUnit) -> Vec<(&str, CursorKind, bool)> {
        unit.cursors
            .iter()
            .filter_map(|c| match c {
                CursorEvent::Symbol {
                    qualified,
                    kind,
                    definition,
                    ..
                } => Some((qualified.as_str(), *kind, *definition)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_function_definition_and_call() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("a.c"),
            "int foo(void) { return 0; }\nint main(void) { return foo(); }\n",
        )
        .unwrap();

        let unit = parse(&dir, "a.c");
        let syms = symbols(&unit);
        assert!(syms.contains(&("foo", CursorKind::Function, true)));
        assert!(syms.contains(&("main", CursorKind::Function, true)));

        let refs: Vec<_> = unit
            .cursors
            .iter()
            .filter_map(|c| match c {
                CursorEvent::Reference { target, kind, .. } => Some((target.clone(), *kind)),
                _ => None,
            })
            .collect();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].1, RefKind::Normal);
        // The call resolves to foo's definition at offset 4.
        assert_eq!(refs[0].0.offset, 4);
    }

    #[test]
    fn test_extern_declaration_is_not_definition() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.c"), "extern int counter;\nint used(void) { return counter; }\n")
            .unwrap();

        let unit = parse(&dir, "b.c");
        let syms = symbols(&unit);
        assert!(syms.contains(&("counter", CursorKind::Variable, false)));
    }

    #[test]
    fn test_prototype_links_to_definition() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("c.c"),
            "int bar(int x);\nint bar(int x) { return x; }\n",
        )
        .unwrap();

        let unit = parse(&dir, "c.c");
        let linked: Vec<_> = unit
            .cursors
            .iter()
            .filter(|c| matches!(c, CursorEvent::Reference { kind: RefKind::Linked, .. }))
            .collect();
        assert_eq!(linked.len(), 1);
    }

    #[test]
    fn test_quoted_include_is_resolved_and_parsed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("h.h"), "int helper(void);\n#define ANSWER 42\n").unwrap();
        fs::write(
            dir.path().join("main.c"),
            "#include \"h.h\"\nint main(void) { return helper(); }\n",
        )
        .unwrap();

        let unit = parse(&dir, "main.c");
        assert_eq!(unit.includes.len(), 1);
        assert!(unit.includes[0].ends_with("h.h"));

        let syms = symbols(&unit);
        assert!(syms.contains(&("helper", CursorKind::Function, false)));
        assert!(syms.contains(&("ANSWER", CursorKind::Macro, true)));
    }

    #[test]
    fn test_struct_and_members() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("s.c"),
            "struct point { int x; int y; };\nenum color { RED, GREEN };\ntypedef struct point point_t;\n",
        )
        .unwrap();

        let unit = parse(&dir, "s.c");
        let syms = symbols(&unit);
        assert!(syms.contains(&("point", CursorKind::Struct, true)));
        assert!(syms.contains(&("point::x", CursorKind::Field, true)));
        assert!(syms.contains(&("color::RED", CursorKind::EnumConstant, true)));
        assert!(syms.contains(&("point_t", CursorKind::Typedef, true)));
    }

    #[test]
    fn test_cpp_method_is_qualified() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("m.cpp"),
            "class Widget { public: int size(); };\nint Widget::size() { return 1; }\n",
        )
        .unwrap();

        let unit = parse(&dir, "m.cpp");
        let syms = symbols(&unit);
        assert!(syms
            .iter()
            .any(|(name, kind, _)| *name == "Widget" && *kind == CursorKind::Class));
        assert!(syms
            .iter()
            .any(|(name, kind, def)| *name == "Widget::size" && *kind == CursorKind::Method && *def));
    }

    #[test]
    fn test_aborted_parse_is_cancelled() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("x.c"), "int x;\n").unwrap();

        let parser = CParser::new();
        let aborted = AtomicBool::new(true);
        let err = parser
            .parse(&dir.path().join("x.c"), &[], &aborted)
            .unwrap_err();
        assert!(matches!(err, IndexError::Cancelled));
    }

    #[test]
    fn test_broken_source_yields_diagnostics() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("bad.c"), "int foo( { return 0; }\n").unwrap();

        let unit = parse(&dir, "bad.c");
        assert!(!unit.diagnostics.is_empty());
    }

    #[test]
    fn test_identical_input_gives_identical_events() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("d.c"),
            "int foo(void) { return 0; }\nint main(void) { return foo(); }\n",
        )
        .unwrap();

        let first = parse(&dir, "d.c");
        let second = parse(&dir, "d.c");
        assert_eq!(format!("{:?}", first.cursors), format!("{:?}", second.cursors));
    }
}
