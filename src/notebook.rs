// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

//! nbformat v4 notebook types, and the builder that turns an execution
//! history into one cell per block. See spec.md §4.7.

use crate::code_extractor::CodeExtractor;
use crate::entry::ExecutionEntry;
use crate::saver::{build_path_parameterization, rewrite_file_paths, PathParameterization};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotebookCell {
    pub cell_type: String,
    pub execution_count: Option<u64>,
    pub metadata: Value,
    pub outputs: Vec<Value>,
    pub source: Vec<String>,
}

impl NotebookCell {
    pub fn code(source: &str, metadata: Value) -> Self {
        NotebookCell {
            cell_type: "code".to_string(),
            execution_count: None,
            metadata,
            outputs: Vec::new(),
            source: split_keepends(source),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notebook {
    pub cells: Vec<NotebookCell>,
    pub metadata: Value,
    pub nbformat: u32,
    pub nbformat_minor: u32,
}

/// Splits text into lines the way `str.splitlines(keepends=True)` does, so
/// the on-disk JSON matches what a real Jupyter export would contain.
fn split_keepends(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch == '\n' {
            lines.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Builds a notebook with one cell per execution (success or failure,
/// ordered by timestamp — failed blocks may still hold imports later cells
/// depend on), a prepended import cell, and — when any block reads or
/// writes a file — a dual-mode argparse shim cell ahead of the body, with
/// its reader/writer paths rewritten to the shim's variables.
pub struct NotebookBuilder;

impl NotebookBuilder {
    pub fn build(executions: &[ExecutionEntry], workflow_name: &str) -> Notebook {
        let mut ordered: Vec<&ExecutionEntry> =
            executions.iter().filter(|e| !e.code.trim().is_empty()).collect();
        ordered.sort_by_key(|e| e.timestamp);

        let extractor = CodeExtractor::default();
        let params = build_path_parameterization(ordered.iter().copied(), &extractor);

        let mut cells = Vec::new();
        let mut all_imports: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();

        for entry in &ordered {
            let rewritten = rewrite_file_paths(&entry.code, &extractor, &params);
            let imports = extract_imports_simple(&rewritten);
            all_imports.extend(imports);

            let metadata = json!({
                "original_timestamp": entry.timestamp.to_rfc3339(),
                "success": entry.success,
                "execution_index": entry.execution_index,
            });
            cells.push(NotebookCell::code(&rewritten, metadata));
        }

        if !all_imports.is_empty() {
            let joined = all_imports.into_iter().collect::<Vec<_>>().join("\n") + "\n";
            cells.insert(0, NotebookCell::code(&joined, json!({})));
        }

        if params.needs_cli_args() {
            let insert_idx = if cells.is_empty() { 0 } else { 1.min(cells.len()) };
            let shim = build_argparse_shim(&params);
            cells.insert(insert_idx, NotebookCell::code(&shim, json!({})));
        }

        let metadata = json!({
            "kernelspec": {
                "display_name": "Python 3",
                "language": "python",
                "name": "python3",
            },
            "language_info": {
                "name": "python",
                "version": "3",
            },
            "workflow_info": {
                "workflow_name": workflow_name,
                "description": format!("Workflow extracted from {} execution(s) (notebook mode)", ordered.len()),
                "num_cells": cells.len(),
            },
        });

        Notebook { cells, metadata, nbformat: 4, nbformat_minor: 4 }
    }
}

/// Builds the dual-mode shim cell: under Jupyter every detected input
/// variable defaults to `None` and `output_dir` to `.`; under a plain
/// `python script.py ...` invocation the same variables come from
/// `argparse`. One `--input-<stem>` flag per category in `params`.
fn build_argparse_shim(params: &PathParameterization) -> String {
    let mut shim = String::from(
        "# Parse command-line arguments\n\
         # This cell works both in Jupyter notebook and command-line execution\n\
         import argparse\nimport sys\nimport os\n\n\
         is_jupyter = 'ipykernel' in sys.modules or 'IPython' in sys.modules\n\n\
         if is_jupyter:\n",
    );
    for (_, var) in &params.header_args {
        shim.push_str(&format!("    {var} = None\n"));
    }
    shim.push_str(
        "    output_dir = '.'\n    print(\"Running in Jupyter notebook - using default file paths\")\nelse:\n    parser = argparse.ArgumentParser(description='Workflow script')\n",
    );
    for (flag, _) in &params.header_args {
        shim.push_str(&format!("    parser.add_argument('{flag}', type=str, default=None)\n"));
    }
    shim.push_str("    parser.add_argument('--output-dir', type=str, default='.')\n    args = parser.parse_args()\n\n");
    for (_, var) in &params.header_args {
        shim.push_str(&format!("    {var} = args.{var}\n"));
    }
    shim.push_str("    output_dir = args.output_dir\n\nos.makedirs(output_dir, exist_ok=True)\n");
    shim
}

/// Single-pass regex scan, deliberately simpler than `CodeExtractor`'s
/// AST-first extraction: the notebook path favors speed over precision
/// since each cell keeps its own namespace anyway.
fn extract_imports_simple(code: &str) -> HashSet<String> {
    static PATTERN: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"(?m)^(import\s+\S+.*|from\s+\S+\s+import\s+[^\n]+)").unwrap()
    });
    PATTERN.find_iter(code).map(|m| m.as_str().trim().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(idx: usize, code: &str, success: bool) -> ExecutionEntry {
        ExecutionEntry::new(idx, code.to_string(), "ok".to_string(), success, vec![], vec![], None)
    }

    #[test]
    fn builds_one_cell_per_execution_plus_import_cell() {
        let executions = vec![entry(0, "import os\nprint(os.getcwd())", true)];
        let notebook = NotebookBuilder::build(&executions, "demo");
        assert_eq!(notebook.cells.len(), 2);
        assert!(notebook.cells[0].source.join("").contains("import os"));
    }

    #[test]
    fn includes_failed_blocks_for_their_imports() {
        let executions = vec![
            entry(0, "import pandas as pd", false),
            entry(1, "df = pd.DataFrame()", true),
        ];
        let notebook = NotebookBuilder::build(&executions, "demo");
        assert_eq!(notebook.cells.len(), 3);
    }

    #[test]
    fn adds_argparse_shim_when_file_operations_detected() {
        let executions =
            vec![entry(0, "df = pd.read_csv('clinical.csv')\ndf.to_csv('result.csv')", true)];
        let notebook = NotebookBuilder::build(&executions, "demo");
        assert!(notebook.cells.iter().any(|c| c.source.concat().contains("argparse")));
        assert!(notebook.cells.iter().any(|c| c.source.concat().contains("input_clinical")));
    }

    #[test]
    fn skips_argparse_shim_without_file_operations() {
        let executions = vec![entry(0, "x = 1 + 1", true)];
        let notebook = NotebookBuilder::build(&executions, "demo");
        assert!(!notebook.cells.iter().any(|c| c.source.concat().contains("argparse")));
    }

    #[test]
    fn skips_blank_executions() {
        let executions = vec![entry(0, "   ", true)];
        let notebook = NotebookBuilder::build(&executions, "demo");
        assert!(notebook.cells.is_empty());
    }
}
