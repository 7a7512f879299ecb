// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

//! AST-driven alias/import reconciliation. See spec.md §4.8.
//!
//! Walks the parsed tree once, collecting both the import table and every
//! place an alias, bare module name, or bare class name is used, then
//! reconciles the two against fixed mapping tables. Three usage shapes are
//! covered: `pd.read_csv` (alias attribute access), `os.makedirs` (direct
//! module attribute access), and `StandardScaler()` (class instantiation).

use crate::code_extractor::CodeExtractor;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use tree_sitter::Node;

/// `(correct_import, line_to_replace)`. `line_to_replace` of `None` means
/// the import is missing entirely and should be inserted.
pub type AliasFix = (String, Option<usize>);

struct ImportRecord {
    module: String,
    line: Option<usize>,
    stmt: String,
}

static ALIAS_MAPPINGS: Lazy<HashMap<&'static str, (&'static str, &'static str)>> = Lazy::new(|| {
    HashMap::from([
        ("pd", ("pandas", "import pandas as pd")),
        ("np", ("numpy", "import numpy as np")),
        ("plt", ("matplotlib.pyplot", "import matplotlib.pyplot as plt")),
        ("sns", ("seaborn", "import seaborn as sns")),
        ("stats", ("scipy.stats", "from scipy import stats")),
        ("gp", ("gseapy", "import gseapy as gp")),
    ])
});

static MODULE_MAPPINGS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("argparse", "import argparse"),
        ("glob", "import glob"),
        ("os", "import os"),
        ("sys", "import sys"),
        ("json", "import json"),
        ("csv", "import csv"),
        ("re", "import re"),
        ("datetime", "import datetime"),
        ("pathlib", "from pathlib import Path"),
    ])
});

static CLASS_MAPPINGS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("StandardScaler", "from sklearn.preprocessing import StandardScaler"),
        ("PCA", "from sklearn.decomposition import PCA"),
        ("multipletests", "from statsmodels.stats.multitest import multipletests"),
        ("ttest_ind", "from scipy.stats import ttest_ind"),
        ("ttest_rel", "from scipy.stats import ttest_rel"),
        ("ttest_1samp", "from scipy.stats import ttest_1samp"),
        ("Path", "from pathlib import Path"),
    ])
});

pub struct Reconciler;

impl Reconciler {
    /// Detects alias/import mismatches via one AST walk. Returns an empty
    /// list (never an error) if the code doesn't parse, so callers fall
    /// back to leaving the code untouched rather than failing the save.
    pub fn detect_alias_mismatches(code: &str) -> Vec<AliasFix> {
        let Some(tree) = CodeExtractor::parse(code) else {
            return Vec::new();
        };
        if tree.root_node().has_error() {
            return Vec::new();
        }

        let mut imports_by_alias: HashMap<String, ImportRecord> = HashMap::new();
        let mut imports_by_module: HashMap<String, (String, Option<usize>, String)> = HashMap::new();
        let mut used_names_as_attribute_object: Vec<String> = Vec::new();
        let mut used_names_as_call_function: Vec<String> = Vec::new();

        walk(tree.root_node(), code, &mut |node| {
            match node.kind() {
                "import_statement" => {
                    let mut name_cursor = node.walk();
                    for name_node in node.children_by_field_name("name", &mut name_cursor) {
                        if let Some((module, alias)) = import_name_parts(name_node, code) {
                            let stmt = if alias == module.rsplit('.').next().unwrap_or(&module) {
                                format!("import {module}")
                            } else {
                                format!("import {module} as {alias}")
                            };
                            let line = Some(node.start_position().row);
                            imports_by_module.insert(module.clone(), (alias.clone(), line, stmt.clone()));
                            imports_by_alias.insert(alias, ImportRecord { module, line, stmt });
                        }
                    }
                }
                "import_from_statement" => {
                    let module = node
                        .child_by_field_name("module_name")
                        .map(|n| n.utf8_text(code.as_bytes()).unwrap_or("").to_string())
                        .unwrap_or_default();
                    let mut name_cursor = node.walk();
                    for name_node in node.children_by_field_name("name", &mut name_cursor) {
                        if let Some((item, alias)) = import_name_parts(name_node, code) {
                            let full_module = if module.is_empty() {
                                item.clone()
                            } else {
                                format!("{module}.{item}")
                            };
                            let stmt = if alias == item {
                                format!("from {module} import {item}")
                            } else {
                                format!("from {module} import {item} as {alias}")
                            };
                            let line = Some(node.start_position().row);
                            imports_by_module.insert(full_module.clone(), (alias.clone(), line, stmt.clone()));
                            imports_by_alias
                                .insert(alias, ImportRecord { module: full_module, line, stmt });
                        }
                    }
                }
                "attribute" => {
                    if let Some(object) = node.child_by_field_name("object") {
                        if object.kind() == "identifier" {
                            used_names_as_attribute_object
                                .push(object.utf8_text(code.as_bytes()).unwrap_or("").to_string());
                        }
                    }
                }
                "call" => {
                    if let Some(func) = node.child_by_field_name("function") {
                        if func.kind() == "identifier" {
                            used_names_as_call_function
                                .push(func.utf8_text(code.as_bytes()).unwrap_or("").to_string());
                        }
                    }
                }
                _ => {}
            }
        });

        let mut fixes = Vec::new();

        for used_module in used_names_as_attribute_object.iter().collect::<std::collections::HashSet<_>>() {
            if let Some(correct_import) = MODULE_MAPPINGS.get(used_module.as_str()) {
                match imports_by_alias.get(used_module.as_str()) {
                    None => fixes.push((correct_import.to_string(), None)),
                    Some(record) if record.module != *used_module => {
                        if let Some(line) = record.line {
                            fixes.push((correct_import.to_string(), Some(line)));
                        }
                    }
                    _ => {}
                }
            }
        }

        for used_alias in used_names_as_attribute_object.iter().collect::<std::collections::HashSet<_>>() {
            if let Some(&(expected_module, correct_import)) = ALIAS_MAPPINGS.get(used_alias.as_str()) {
                match imports_by_alias.get(used_alias.as_str()) {
                    Some(record) => {
                        if !record.module.contains(expected_module) && !expected_module.contains(&record.module) {
                            if let Some(line) = record.line {
                                fixes.push((correct_import.to_string(), Some(line)));
                            }
                        }
                    }
                    None => match imports_by_module.get(expected_module) {
                        Some((module_alias, line, _)) if module_alias != used_alias => {
                            if let Some(line) = line {
                                fixes.push((correct_import.to_string(), Some(*line)));
                            } else {
                                fixes.push((correct_import.to_string(), None));
                            }
                        }
                        Some(_) => {}
                        None => fixes.push((correct_import.to_string(), None)),
                    },
                }
            }
        }

        for used_class in used_names_as_call_function.iter().collect::<std::collections::HashSet<_>>() {
            if let Some(correct_import) = CLASS_MAPPINGS.get(used_class.as_str()) {
                if !imports_by_alias.contains_key(used_class.as_str()) {
                    fixes.push((correct_import.to_string(), None));
                }
            }
        }

        fixes
    }

    /// Applies the fixes `detect_alias_mismatches` returned: replaces
    /// flagged import lines in place, and inserts missing ones right after
    /// the last existing import line (or at the top if there is none).
    pub fn apply_rule_based_fixes(code: &str) -> String {
        let fixes = Self::detect_alias_mismatches(code);
        if fixes.is_empty() {
            return code.to_string();
        }

        let mut lines: Vec<String> = code.lines().map(String::from).collect();
        let mut import_section_end = None;
        for (i, line) in lines.iter().enumerate() {
            let stripped = line.trim();
            if stripped.starts_with("import ") || stripped.starts_with("from ") {
                if import_section_end.is_none() {
                    import_section_end = Some(i);
                }
            } else if import_section_end.is_some() && !stripped.is_empty() && !stripped.starts_with('#') {
                break;
            }
        }
        let mut insert_pos = import_section_end.unwrap_or(lines.len());

        for (correct_import, wrong_line) in fixes {
            match wrong_line {
                Some(idx) if idx < lines.len() => {
                    lines[idx] = correct_import;
                }
                _ => {
                    let mut pos = insert_pos;
                    for i in (0..insert_pos).rev() {
                        let stripped = lines[i].trim();
                        if stripped.starts_with("import ") || stripped.starts_with("from ") {
                            pos = i + 1;
                            break;
                        }
                    }
                    lines.insert(pos, correct_import);
                    insert_pos += 1;
                }
            }
        }

        lines.join("\n")
    }
}

fn walk<'a>(node: Node<'a>, code: &str, visit: &mut impl FnMut(Node<'a>)) {
    visit(node);
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk(child, code, visit);
    }
}

fn import_name_parts(name_node: Node, code: &str) -> Option<(String, String)> {
    match name_node.kind() {
        "dotted_name" | "identifier" => {
            let text = name_node.utf8_text(code.as_bytes()).ok()?.to_string();
            let alias = text.rsplit('.').next().unwrap_or(&text).to_string();
            Some((text, alias))
        }
        "aliased_import" => {
            let name = name_node.child_by_field_name("name")?.utf8_text(code.as_bytes()).ok()?.to_string();
            let alias = name_node.child_by_field_name("alias")?.utf8_text(code.as_bytes()).ok()?.to_string();
            Some((name, alias))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_missing_direct_module_import() {
        let fixes = Reconciler::detect_alias_mismatches("p = argparse.ArgumentParser()\n");
        assert!(fixes.iter().any(|(imp, line)| imp == "import argparse" && line.is_none()));
    }

    #[test]
    fn detects_alias_mismatch_for_wrong_module() {
        let code = "import json as pd\nx = pd.read_csv('a.csv')\n";
        let fixes = Reconciler::detect_alias_mismatches(code);
        assert!(fixes.iter().any(|(imp, line)| imp == "import pandas as pd" && *line == Some(0)));
    }

    #[test]
    fn detects_missing_class_import() {
        let fixes = Reconciler::detect_alias_mismatches("scaler = StandardScaler()\n");
        assert!(fixes
            .iter()
            .any(|(imp, _)| imp == "from sklearn.preprocessing import StandardScaler"));
    }

    #[test]
    fn no_fixes_needed_when_already_correct() {
        let code = "import pandas as pd\ndf = pd.read_csv('a.csv')\n";
        let fixes = Reconciler::detect_alias_mismatches(code);
        assert!(fixes.is_empty());
    }

    #[test]
    fn apply_rule_based_fixes_inserts_missing_import() {
        let code = "import pandas as pd\ndf = pd.read_csv('a.csv')\nos.makedirs('out')\n";
        let fixed = Reconciler::apply_rule_based_fixes(code);
        assert!(fixed.contains("import os"));
    }

    #[test]
    fn malformed_code_yields_no_fixes_rather_than_panicking() {
        let fixes = Reconciler::detect_alias_mismatches("def f(:\n");
        assert!(fixes.is_empty());
    }
}
