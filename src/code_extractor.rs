// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

//! Static analysis over Python source strings. AST-first (tree-sitter),
//! with a regex fallback used only when the tree-sitter parse contains an
//! error node. See spec.md §4.1.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use streaming_iterator::StreamingIterator;
use tree_sitter::{Parser, Query, QueryCursor};

lazy_static::lazy_static! {
    static ref FUNCTION_QUERY: Query = Query::new(
        &tree_sitter_python::LANGUAGE.into(),
        r#"
        (function_definition
            name: (identifier) @name
            parameters: (parameters) @params
        ) @func
        "#
    ).expect("static query must compile");

    static ref CLASS_QUERY: Query = Query::new(
        &tree_sitter_python::LANGUAGE.into(),
        "(class_definition) @class"
    ).expect("static query must compile");
}

/// Python's standard library module names, used both to short-circuit the
/// availability check and to sort stdlib imports first elsewhere.
pub static STDLIB_MODULES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "__future__", "abc", "argparse", "array", "ast", "asyncio", "atexit", "base64", "bdb",
        "binascii", "bisect", "builtins", "bz2", "calendar", "cmath", "cmd", "code", "codecs",
        "codeop", "collections", "colorsys", "compileall", "concurrent", "configparser",
        "contextlib", "contextvars", "copy", "copyreg", "csv", "ctypes", "curses", "dataclasses",
        "datetime", "dbm", "decimal", "difflib", "dis", "doctest", "email", "encodings",
        "ensurepip", "enum", "errno", "faulthandler", "fcntl", "filecmp", "fileinput", "fnmatch",
        "fractions", "ftplib", "functools", "gc", "getopt", "getpass", "gettext", "glob",
        "graphlib", "grp", "gzip", "hashlib", "heapq", "hmac", "html", "http", "imaplib",
        "importlib", "inspect", "io", "ipaddress", "itertools", "json", "keyword", "linecache",
        "locale", "logging", "lzma", "mailbox", "marshal", "math", "mimetypes", "mmap",
        "modulefinder", "multiprocessing", "netrc", "numbers", "opcode", "operator", "optparse",
        "os", "pathlib", "pdb", "pickle", "pickletools", "pkgutil", "platform", "plistlib",
        "poplib", "posixpath", "pprint", "profile", "pstats", "pty", "pwd", "py_compile",
        "pyclbr", "pydoc", "queue", "quopri", "random", "re", "readline", "reprlib", "resource",
        "rlcompleter", "runpy", "sched", "secrets", "select", "selectors", "shelve", "shlex",
        "shutil", "signal", "site", "smtplib", "socket", "socketserver", "sqlite3", "ssl", "stat",
        "statistics", "string", "stringprep", "struct", "subprocess", "symtable", "sys",
        "sysconfig", "syslog", "tabnanny", "tarfile", "tempfile", "termios", "textwrap",
        "threading", "time", "timeit", "tkinter", "token", "tokenize", "tomllib", "trace",
        "traceback", "tracemalloc", "tty", "turtle", "types", "typing", "unicodedata", "unittest",
        "urllib", "uuid", "venv", "warnings", "wave", "weakref", "webbrowser", "winreg",
        "winsound", "wsgiref", "xml", "xmlrpc", "zipapp", "zipfile", "zipimport", "zlib",
        "zoneinfo",
    ]
    .into_iter()
    .collect()
});

/// Decides whether a top-level module name is importable in the interpreter
/// that will actually run the synthesized artifact. Per spec.md §9, this
/// must ask an *external* Python interpreter, not introspect this process.
pub trait PackageAvailability: Send + Sync {
    fn is_available(&self, module_name: &str) -> bool;
}

/// Conservative checker: only the standard library counts as available.
/// Useful as a default in environments with no Python interpreter on PATH
/// (e.g. CI for this crate's own test suite).
pub struct StdlibOnlyAvailability;

impl PackageAvailability for StdlibOnlyAvailability {
    fn is_available(&self, module_name: &str) -> bool {
        STDLIB_MODULES.contains(module_name)
    }
}

/// Shells out to `interpreter -c "import <module>"` the way the spec's
/// host-language-orthogonal note requires: "a non-Python host must query an
/// external Python interpreter."
pub struct PythonInterpreterAvailability {
    pub interpreter: String,
}

impl PythonInterpreterAvailability {
    pub fn new(interpreter: impl Into<String>) -> Self {
        PythonInterpreterAvailability {
            interpreter: interpreter.into(),
        }
    }
}

impl PackageAvailability for PythonInterpreterAvailability {
    fn is_available(&self, module_name: &str) -> bool {
        if STDLIB_MODULES.contains(module_name) {
            return true;
        }
        std::process::Command::new(&self.interpreter)
            .args(["-c", &format!("import {module_name}")])
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

/// Allowlist checker, handy for deterministic tests.
pub struct FixedAvailability(pub HashSet<String>);

impl PackageAvailability for FixedAvailability {
    fn is_available(&self, module_name: &str) -> bool {
        STDLIB_MODULES.contains(module_name) || self.0.contains(module_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub name: String,
    pub args: Vec<String>,
    pub lineno: usize,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardcodedPath {
    pub path: String,
    pub position: usize,
    pub context: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOpKind {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOperation {
    pub file: String,
    pub operation: String,
    pub kind: FileOpKind,
    pub position: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileOperations {
    pub read_operations: Vec<FileOperation>,
    pub write_operations: Vec<FileOperation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportSection {
    Lines { start_line: usize, end_line: usize },
    Chars { start: usize, end: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeComplexity {
    pub function_count: usize,
    pub class_count: usize,
    pub line_count: usize,
    pub is_complex: bool,
}

static READ_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r#"pd\.read_csv\(["']([^"']+)["']"#).unwrap(), "pandas.read_csv"),
        (Regex::new(r#"pd\.read_excel\(["']([^"']+)["']"#).unwrap(), "pandas.read_excel"),
        (Regex::new(r#"pd\.read_json\(["']([^"']+)["']"#).unwrap(), "pandas.read_json"),
        (Regex::new(r#"pd\.read_parquet\(["']([^"']+)["']"#).unwrap(), "pandas.read_parquet"),
        (Regex::new(r#"pd\.read_table\(["']([^"']+)["']"#).unwrap(), "pandas.read_table"),
        (Regex::new(r#"open\(["']([^"']+)["'],\s*["']r"#).unwrap(), "open_read"),
        (Regex::new(r#"np\.load\(["']([^"']+)["']"#).unwrap(), "numpy.load"),
        (Regex::new(r#"pickle\.load\(["']([^"']+)["']"#).unwrap(), "pickle.load"),
    ]
});

static WRITE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r#"\.to_csv\(["']([^"']+)["']"#).unwrap(), "pandas.to_csv"),
        (Regex::new(r#"\.to_excel\(["']([^"']+)["']"#).unwrap(), "pandas.to_excel"),
        (Regex::new(r#"\.to_json\(["']([^"']+)["']"#).unwrap(), "pandas.to_json"),
        (Regex::new(r#"\.to_parquet\(["']([^"']+)["']"#).unwrap(), "pandas.to_parquet"),
        (Regex::new(r#"open\(["']([^"']+)["'],\s*["']w"#).unwrap(), "open_write"),
        (Regex::new(r#"plt\.savefig\(["']([^"']+)["']"#).unwrap(), "matplotlib.savefig"),
        (Regex::new(r#"\.save\(["']([^"']+)["']"#).unwrap(), "generic.save"),
    ]
});

static OUTPUT_FILE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"\.to_csv\(["']([^"']+)["']"#).unwrap(),
        Regex::new(r#"\.savefig\(["']([^"']+)["']"#).unwrap(),
        Regex::new(r#"gseaplot\([^,]+ofname=["']([^"']+)["']"#).unwrap(),
        Regex::new(r#"\.to_excel\(["']([^"']+)["']"#).unwrap(),
        Regex::new(r#"\.to_json\(["']([^"']+)["']"#).unwrap(),
    ]
});

static HARDCODED_PATH_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"["']([^"']*\.(?:csv|tsv|txt|json|xlsx|xls|pkl|h5|hdf5|png|jpg|jpeg|pdf))["']"#).unwrap(),
        Regex::new(r#"["']([^"']*[/\\][^"']+)["']"#).unwrap(),
    ]
});

static IMPORT_LINE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(import\s+\S+.*|from\s+\S+\s+import\s+[^\n]+)").unwrap()
});

pub struct CodeExtractor {
    availability: Box<dyn PackageAvailability>,
}

impl Default for CodeExtractor {
    fn default() -> Self {
        CodeExtractor {
            availability: Box::new(PythonInterpreterAvailability::new("python3")),
        }
    }
}

impl CodeExtractor {
    pub fn new(availability: Box<dyn PackageAvailability>) -> Self {
        CodeExtractor { availability }
    }

    pub(crate) fn parse(code: &str) -> Option<tree_sitter::Tree> {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .expect("python grammar must load");
        parser.parse(code, None)
    }

    fn module_name_from_import(import_stmt: &str) -> String {
        let import_stmt = import_stmt.trim();
        if let Some(rest) = import_stmt.strip_prefix("import ") {
            let module = rest.split(" as ").next().unwrap_or("").trim();
            return module.split('.').next().unwrap_or("").to_string();
        }
        if let Some(rest) = import_stmt.strip_prefix("from ") {
            if let Some((module, _)) = rest.split_once(" import ") {
                return module.trim().split('.').next().unwrap_or("").to_string();
            }
        }
        String::new()
    }

    pub fn filter_available_imports(&self, imports: Vec<String>) -> Vec<String> {
        imports
            .into_iter()
            .filter(|stmt| {
                let module = Self::module_name_from_import(stmt);
                module.is_empty() || self.availability.is_available(&module)
            })
            .collect()
    }

    /// Returns sorted, deduplicated import statements. AST path first;
    /// regex fallback only if the tree-sitter parse contains an error node.
    pub fn extract_imports(&self, code: &str, filter_unavailable: bool) -> Vec<String> {
        let mut imports: HashSet<String> = HashSet::new();

        let used_ast = match Self::parse(code) {
            Some(tree) if !tree.root_node().has_error() => {
                collect_import_statements(tree.root_node(), code, &mut imports);
                true
            }
            _ => false,
        };

        if !used_ast {
            for m in IMPORT_LINE_PATTERN.find_iter(code) {
                imports.insert(m.as_str().trim_end().to_string());
            }
        }

        let mut imports_list: Vec<String> = imports.into_iter().collect();
        imports_list.sort();

        if filter_unavailable {
            imports_list = self.filter_available_imports(imports_list);
        }
        imports_list
    }

    pub fn extract_functions(&self, code: &str) -> Vec<FunctionInfo> {
        let mut functions = Vec::new();
        let Some(tree) = Self::parse(code) else {
            return functions;
        };
        if tree.root_node().has_error() {
            return functions;
        }
        let root = tree.root_node();
        let mut cursor = QueryCursor::new();
        let mut matches = cursor.matches(&FUNCTION_QUERY, root, code.as_bytes());
        while let Some(m) = matches.next() {
            let mut name = None;
            let mut params: Vec<String> = Vec::new();
            let mut func_node = None;
            for capture in m.captures {
                let capture_name = FUNCTION_QUERY.capture_names()[capture.index as usize];
                match capture_name {
                    "name" => name = capture.node.utf8_text(code.as_bytes()).ok().map(String::from),
                    "params" => {
                        let mut walker = capture.node.walk();
                        for child in capture.node.named_children(&mut walker) {
                            let arg_text = child.utf8_text(code.as_bytes()).unwrap_or("");
                            let arg_name = arg_text.split([':', '=']).next().unwrap_or("").trim();
                            if !arg_name.is_empty() {
                                params.push(arg_name.to_string());
                            }
                        }
                    }
                    "func" => func_node = Some(capture.node),
                    _ => {}
                }
            }
            if let (Some(name), Some(node)) = (name, func_node) {
                functions.push(FunctionInfo {
                    name,
                    args: params,
                    lineno: node.start_position().row + 1,
                    code: node.utf8_text(code.as_bytes()).unwrap_or("").to_string(),
                });
            }
        }
        functions
    }

    pub fn identify_hardcoded_paths(&self, code: &str) -> Vec<HardcodedPath> {
        let mut paths = Vec::new();
        for pattern in HARDCODED_PATH_PATTERNS.iter() {
            for m in pattern.captures_iter(code) {
                let group = m.get(1).unwrap();
                let path_str = group.as_str();
                if path_str.contains('/')
                    || path_str.contains('\\')
                    || Path::new(path_str).extension().is_some()
                {
                    paths.push(HardcodedPath {
                        path: path_str.to_string(),
                        position: group.start(),
                        context: Self::context_around(code, group.start(), group.end()),
                    });
                }
            }
        }
        paths
    }

    pub fn extract_file_operations(&self, code: &str) -> FileOperations {
        let mut ops = FileOperations::default();
        for (pattern, label) in READ_PATTERNS.iter() {
            for m in pattern.captures_iter(code) {
                let group = m.get(1).unwrap();
                ops.read_operations.push(FileOperation {
                    file: group.as_str().to_string(),
                    operation: label.to_string(),
                    kind: FileOpKind::Read,
                    position: m.get(0).unwrap().start(),
                });
            }
        }
        for (pattern, label) in WRITE_PATTERNS.iter() {
            for m in pattern.captures_iter(code) {
                let group = m.get(1).unwrap();
                ops.write_operations.push(FileOperation {
                    file: group.as_str().to_string(),
                    operation: label.to_string(),
                    kind: FileOpKind::Write,
                    position: m.get(0).unwrap().start(),
                });
            }
        }
        ops
    }

    pub fn extract_output_files(&self, code: &str) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        for pattern in OUTPUT_FILE_PATTERNS.iter() {
            for m in pattern.captures_iter(code) {
                let raw = m.get(1).unwrap().as_str();
                let basename = Path::new(raw)
                    .file_name()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| raw.to_string());
                files.push(basename);
            }
        }
        files.sort();
        files.dedup();
        files
    }

    pub fn find_import_section(code: &str, return_char_positions: bool) -> Option<ImportSection> {
        let lines: Vec<&str> = code.split('\n').collect();
        let mut import_start: Option<usize> = None;
        let mut import_end: Option<usize> = None;

        for (i, line) in lines.iter().enumerate() {
            let stripped = line.trim();
            if stripped.starts_with("import ") || stripped.starts_with("from ") {
                if import_start.is_none() {
                    import_start = Some(i);
                }
                import_end = Some(i + 1);
            } else if import_start.is_some() && !stripped.is_empty() && !stripped.starts_with('#') {
                break;
            }
        }

        let start_line = import_start?;
        let end_line = import_end.unwrap_or(start_line);

        if return_char_positions {
            let start_pos: usize = lines[..start_line].iter().map(|l| l.len() + 1).sum();
            let end_pos: usize = lines[..end_line].iter().map(|l| l.len() + 1).sum();
            Some(ImportSection::Chars {
                start: start_pos,
                end: end_pos,
            })
        } else {
            Some(ImportSection::Lines {
                start_line,
                end_line,
            })
        }
    }

    pub fn merge_imports(import_lists: &[Vec<String>]) -> Vec<String> {
        let mut all: HashSet<String> = HashSet::new();
        for list in import_lists {
            all.extend(list.iter().cloned());
        }
        let mut merged: Vec<String> = all.into_iter().collect();
        merged.sort();
        merged
    }

    pub fn get_code_complexity(code: &str) -> CodeComplexity {
        let line_count = code.split('\n').count();
        let Some(tree) = Self::parse(code) else {
            return CodeComplexity {
                line_count,
                ..Default::default()
            };
        };
        if tree.root_node().has_error() {
            return CodeComplexity {
                line_count,
                ..Default::default()
            };
        }
        let root = tree.root_node();
        let function_count = Self::count_matches(&FUNCTION_QUERY, root, code);
        let class_count = Self::count_matches(&CLASS_QUERY, root, code);
        CodeComplexity {
            function_count,
            class_count,
            line_count,
            is_complex: function_count > 5 || class_count > 2,
        }
    }

    fn count_matches(query: &Query, root: tree_sitter::Node, code: &str) -> usize {
        let mut cursor = QueryCursor::new();
        let mut matches = cursor.matches(query, root, code.as_bytes());
        let mut count = 0;
        while matches.next().is_some() {
            count += 1;
        }
        count
    }

    fn context_around(code: &str, start: usize, end: usize) -> String {
        let lines: Vec<&str> = code.split('\n').collect();
        let start_line = code[..start].matches('\n').count();
        let end_line = code[..end].matches('\n').count();
        let context_start = start_line.saturating_sub(2);
        let context_end = (end_line + 3).min(lines.len());
        lines[context_start..context_end].join("\n")
    }
}

/// Walks the whole tree (not just top-level) so imports inside `try`/`if`
/// blocks and function bodies are still picked up, and re-renders each
/// `import`/`from ... import` statement from its `name` fields so a
/// comma-joined `import os, sys` becomes two statements, matching the
/// per-alias emission the original Python AST walk does.
fn collect_import_statements(node: tree_sitter::Node, code: &str, imports: &mut HashSet<String>) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "import_statement" => {
                let mut name_cursor = child.walk();
                for name_node in child.children_by_field_name("name", &mut name_cursor) {
                    if let Some(rendered) = render_import_name(name_node, code) {
                        imports.insert(format!("import {rendered}"));
                    }
                }
            }
            "import_from_statement" => {
                if let Some(module_node) = child.child_by_field_name("module_name") {
                    let module = module_node.utf8_text(code.as_bytes()).unwrap_or("").trim();
                    let mut name_cursor = child.walk();
                    let names: Vec<String> = child
                        .children_by_field_name("name", &mut name_cursor)
                        .filter_map(|n| render_import_name(n, code))
                        .collect();
                    let mut has_wildcard = false;
                    let mut wildcard_cursor = child.walk();
                    for c in child.children(&mut wildcard_cursor) {
                        if c.kind() == "wildcard_import" {
                            has_wildcard = true;
                        }
                    }
                    if !names.is_empty() {
                        imports.insert(format!("from {} import {}", module, names.join(", ")));
                    } else if has_wildcard {
                        imports.insert(format!("from {module} import *"));
                    }
                }
            }
            _ => {}
        }
        collect_import_statements(child, code, imports);
    }
}

fn render_import_name(node: tree_sitter::Node, code: &str) -> Option<String> {
    match node.kind() {
        "dotted_name" => node.utf8_text(code.as_bytes()).ok().map(|s| s.trim().to_string()),
        "aliased_import" => {
            let name = node
                .child_by_field_name("name")?
                .utf8_text(code.as_bytes())
                .ok()?
                .trim();
            let alias = node
                .child_by_field_name("alias")?
                .utf8_text(code.as_bytes())
                .ok()?
                .trim();
            Some(format!("{name} as {alias}"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet as Set;

    fn extractor() -> CodeExtractor {
        let mut available = Set::new();
        available.insert("pandas".to_string());
        available.insert("numpy".to_string());
        CodeExtractor::new(Box::new(FixedAvailability(available)))
    }

    #[test]
    fn extracts_and_sorts_imports() {
        let code = "import os\nimport pandas as pd\nfrom scipy import stats\n";
        let imports = extractor().extract_imports(code, false);
        assert_eq!(
            imports,
            vec!["from scipy import stats", "import os", "import pandas as pd"]
        );
    }

    #[test]
    fn filters_unavailable_packages() {
        let code = "import pandas as pd\nimport some_unavailable_package\n";
        let imports = extractor().extract_imports(code, true);
        assert_eq!(imports, vec!["import pandas as pd"]);
    }

    #[test]
    fn malformed_code_does_not_panic_and_falls_back_to_regex() {
        let code = "import pandas as pd\ndef broken(:\n    pass\n";
        let imports = extractor().extract_imports(code, false);
        assert!(imports.contains(&"import pandas as pd".to_string()));
    }

    #[test]
    fn extracts_functions_with_args_and_lineno() {
        let code = "def foo(a, b):\n    return a + b\n";
        let funcs = extractor().extract_functions(code);
        assert_eq!(funcs.len(), 1);
        assert_eq!(funcs[0].name, "foo");
        assert_eq!(funcs[0].args, vec!["a", "b"]);
        assert_eq!(funcs[0].lineno, 1);
    }

    #[test]
    fn identifies_hardcoded_paths() {
        let code = r#"df = pd.read_csv("data/input.csv")"#;
        let paths = extractor().identify_hardcoded_paths(code);
        assert!(paths.iter().any(|p| p.path == "data/input.csv"));
    }

    #[test]
    fn extracts_output_files_as_basenames() {
        let code = r#"df.to_csv("results/out.csv", index=False)"#;
        let files = extractor().extract_output_files(code);
        assert_eq!(files, vec!["out.csv".to_string()]);
    }

    #[test]
    fn finds_import_section_line_span() {
        let code = "import os\nimport sys\n\nx = 1\n";
        let section = CodeExtractor::find_import_section(code, false).unwrap();
        assert_eq!(section, ImportSection::Lines { start_line: 0, end_line: 2 });
    }

    #[test]
    fn complexity_counts_functions_and_classes() {
        let code = "class A:\n    pass\n\ndef f():\n    pass\n\ndef g():\n    pass\n";
        let complexity = CodeExtractor::get_code_complexity(code);
        assert_eq!(complexity.function_count, 2);
        assert_eq!(complexity.class_count, 1);
        assert!(!complexity.is_complex);
    }

    #[test]
    fn tolerates_malformed_code_in_every_operation() {
        let code = "def ???(:::\n   this is not python at all $$$ {{{";
        let _ = extractor().extract_imports(code, true);
        let _ = extractor().extract_functions(code);
        let _ = extractor().identify_hardcoded_paths(code);
        let _ = extractor().extract_file_operations(code);
        let _ = extractor().extract_output_files(code);
        let _ = CodeExtractor::get_code_complexity(code);
    }
}
