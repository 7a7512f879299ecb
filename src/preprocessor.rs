// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

//! Rule-based pass over an execution history before any LLM touches it.
//! See spec.md §4.4.

use crate::code_extractor::{
    CodeComplexity, CodeExtractor, FileOperations, FunctionInfo, HardcodedPath,
};
use crate::entry::ExecutionEntry;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Usage pattern -> (module, alias). Checked against each block's code so a
/// module imported without a canonical alias still gets one inferred from
/// how the rest of the session actually calls it.
static IMPORT_ALIAS_PATTERNS: Lazy<Vec<(Regex, &'static str, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"\bpd\.").unwrap(), "pandas", "pd"),
        (Regex::new(r"\bnp\.").unwrap(), "numpy", "np"),
        (Regex::new(r"\bplt\.").unwrap(), "matplotlib.pyplot", "plt"),
        (Regex::new(r"\bsns\.").unwrap(), "seaborn", "sns"),
        (Regex::new(r"\bstats\.").unwrap(), "scipy.stats", "stats"),
        (Regex::new(r"\bgp\.").unwrap(), "gseapy", "gp"),
    ]
});

static TRY_EXCEPT_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\btry\s*:|except\s+").unwrap());

#[derive(Debug, Clone, Default)]
pub struct CodeStructure {
    pub total_functions: usize,
    pub total_classes: usize,
    pub total_lines: usize,
    pub num_executions: usize,
    pub has_try_except: bool,
    pub has_error_handling: bool,
    pub avg_lines_per_execution: f64,
}

#[derive(Debug, Clone)]
pub struct PreprocessedExecution {
    pub execution_index: usize,
    pub output_file_names: Vec<String>,
    pub imports: Vec<String>,
    pub functions: Vec<FunctionInfo>,
    pub complexity: CodeComplexity,
}

#[derive(Debug, Clone, Default)]
pub struct PreprocessedData {
    pub imports: Vec<String>,
    pub import_aliases: HashMap<String, String>,
    pub output_file_mapping: HashMap<String, Vec<usize>>,
    pub hardcoded_paths: Vec<HardcodedPathEntry>,
    pub functions: Vec<FunctionEntry>,
    pub file_operations: FileOperationsEntry,
    pub code_structure: CodeStructure,
    pub preprocessed_executions: Vec<PreprocessedExecution>,
}

#[derive(Debug, Clone)]
pub struct HardcodedPathEntry {
    pub path: HardcodedPath,
    pub execution_index: usize,
}

#[derive(Debug, Clone)]
pub struct FunctionEntry {
    pub function: FunctionInfo,
    pub execution_index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FileOperationsEntry {
    pub read_operations: Vec<crate::code_extractor::FileOperation>,
    pub write_operations: Vec<crate::code_extractor::FileOperation>,
}

pub struct WorkflowPreprocessor {
    code_extractor: CodeExtractor,
}

impl Default for WorkflowPreprocessor {
    fn default() -> Self {
        WorkflowPreprocessor { code_extractor: CodeExtractor::default() }
    }
}

impl WorkflowPreprocessor {
    pub fn new(code_extractor: CodeExtractor) -> Self {
        WorkflowPreprocessor { code_extractor }
    }

    pub fn preprocess(&self, executions: &[ExecutionEntry]) -> PreprocessedData {
        if executions.is_empty() {
            return PreprocessedData::default();
        }

        let (imports, import_aliases) = self.extract_and_clean_imports(executions);
        let output_file_mapping = self.map_output_files(executions);
        let hardcoded_paths = self.identify_hardcoded_paths(executions);
        let functions = self.extract_functions(executions);
        let file_operations = self.extract_file_operations(executions);
        let code_structure = self.analyze_code_structure(executions);
        let preprocessed_executions =
            self.add_metadata_to_executions(executions, &output_file_mapping);

        PreprocessedData {
            imports,
            import_aliases,
            output_file_mapping,
            hardcoded_paths,
            functions,
            file_operations,
            code_structure,
            preprocessed_executions,
        }
    }

    fn extract_and_clean_imports(
        &self,
        executions: &[ExecutionEntry],
    ) -> (Vec<String>, HashMap<String, String>) {
        let mut all_imports = Vec::new();
        let mut import_aliases = HashMap::new();

        for execution in executions {
            if execution.code.trim().is_empty() {
                continue;
            }
            all_imports.extend(self.code_extractor.extract_imports(&execution.code, false));
            for (module, alias) in Self::analyze_import_aliases(&execution.code) {
                import_aliases.insert(module, alias);
            }
        }

        let cleaned = Self::clean_imports(&all_imports, &import_aliases);
        (cleaned, import_aliases)
    }

    fn analyze_import_aliases(code: &str) -> Vec<(String, String)> {
        if code.trim().is_empty() {
            return Vec::new();
        }
        IMPORT_ALIAS_PATTERNS
            .iter()
            .filter(|(pattern, _, _)| pattern.is_match(code))
            .map(|(_, module, alias)| (module.to_string(), alias.to_string()))
            .collect()
    }

    /// Applies known aliases to bare `import module` statements, then sorts
    /// stdlib imports ahead of third-party ones (matching the ordering a
    /// human would write by hand at the top of a script).
    fn clean_imports(imports: &[String], aliases: &HashMap<String, String>) -> Vec<String> {
        let mut cleaned: HashSet<String> = HashSet::new();

        for imp in imports {
            let imp = imp.trim();
            if imp.is_empty() {
                continue;
            }
            let mut imp = imp.to_string();
            for (module, alias) in aliases {
                if imp == format!("import {module}") {
                    imp = format!("import {module} as {alias}");
                }
            }
            cleaned.insert(imp);
        }

        let mut sorted: Vec<String> = cleaned.into_iter().collect();
        sorted.sort();

        let mut stdlib_imports = Vec::new();
        let mut third_party_imports = Vec::new();

        for imp in sorted.drain(..) {
            let parts: Vec<&str> = imp.split_whitespace().collect();
            if parts.len() < 2 {
                third_party_imports.push(imp);
                continue;
            }
            let module_name = match parts[0] {
                "import" | "from" => parts[1].split('.').next().unwrap_or(parts[1]),
                _ => {
                    third_party_imports.push(imp.clone());
                    continue;
                }
            };
            if crate::code_extractor::STDLIB_MODULES.contains(module_name) {
                stdlib_imports.push(imp);
            } else {
                third_party_imports.push(imp);
            }
        }

        stdlib_imports.into_iter().chain(third_party_imports).collect()
    }

    fn map_output_files(&self, executions: &[ExecutionEntry]) -> HashMap<String, Vec<usize>> {
        let mut mapping: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, execution) in executions.iter().enumerate() {
            for output_file in &execution.output_files {
                let file_name = Path::new(output_file)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| output_file.clone());
                mapping.entry(file_name).or_default().push(idx);
            }
        }
        mapping
    }

    fn identify_hardcoded_paths(&self, executions: &[ExecutionEntry]) -> Vec<HardcodedPathEntry> {
        let mut out = Vec::new();
        for (idx, execution) in executions.iter().enumerate() {
            if execution.code.trim().is_empty() {
                continue;
            }
            for path in self.code_extractor.identify_hardcoded_paths(&execution.code) {
                out.push(HardcodedPathEntry { path, execution_index: idx });
            }
        }
        out
    }

    fn extract_functions(&self, executions: &[ExecutionEntry]) -> Vec<FunctionEntry> {
        let mut out = Vec::new();
        for (idx, execution) in executions.iter().enumerate() {
            if execution.code.trim().is_empty() {
                continue;
            }
            for function in self.code_extractor.extract_functions(&execution.code) {
                out.push(FunctionEntry { function, execution_index: idx });
            }
        }
        out
    }

    fn extract_file_operations(&self, executions: &[ExecutionEntry]) -> FileOperationsEntry {
        let mut read_operations = Vec::new();
        let mut write_operations = Vec::new();
        for execution in executions {
            if execution.code.trim().is_empty() {
                continue;
            }
            let FileOperations { read_operations: reads, write_operations: writes } =
                self.code_extractor.extract_file_operations(&execution.code);
            read_operations.extend(reads);
            write_operations.extend(writes);
        }
        FileOperationsEntry { read_operations, write_operations }
    }

    fn analyze_code_structure(&self, executions: &[ExecutionEntry]) -> CodeStructure {
        let mut total_functions = 0;
        let mut total_classes = 0;
        let mut total_lines = 0;
        let mut has_try_except = false;

        for execution in executions {
            if execution.code.trim().is_empty() {
                continue;
            }
            let complexity = CodeExtractor::get_code_complexity(&execution.code);
            total_functions += complexity.function_count;
            total_classes += complexity.class_count;
            total_lines += complexity.line_count;

            let code_without_comments: String = execution
                .code
                .lines()
                .filter(|line| {
                    let trimmed = line.trim();
                    !trimmed.is_empty() && !trimmed.starts_with('#')
                })
                .collect::<Vec<_>>()
                .join("\n");

            if TRY_EXCEPT_PATTERN.is_match(&code_without_comments) {
                has_try_except = true;
            }
        }

        let num_executions = executions.len();
        CodeStructure {
            total_functions,
            total_classes,
            total_lines,
            num_executions,
            has_try_except,
            has_error_handling: has_try_except,
            avg_lines_per_execution: if num_executions > 0 {
                total_lines as f64 / num_executions as f64
            } else {
                0.0
            },
        }
    }

    fn add_metadata_to_executions(
        &self,
        executions: &[ExecutionEntry],
        _output_file_mapping: &HashMap<String, Vec<usize>>,
    ) -> Vec<PreprocessedExecution> {
        executions
            .iter()
            .enumerate()
            .map(|(idx, execution)| {
                let output_file_names = execution
                    .output_files
                    .iter()
                    .map(|f| {
                        Path::new(f)
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_else(|| f.clone())
                    })
                    .collect();

                let (imports, functions, complexity) = if execution.code.trim().is_empty() {
                    (Vec::new(), Vec::new(), CodeComplexity::default())
                } else {
                    (
                        self.code_extractor.extract_imports(&execution.code, false),
                        self.code_extractor.extract_functions(&execution.code),
                        CodeExtractor::get_code_complexity(&execution.code),
                    )
                };

                PreprocessedExecution {
                    execution_index: idx,
                    output_file_names,
                    imports,
                    functions,
                    complexity,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(code: &str, output_files: Vec<&str>) -> ExecutionEntry {
        ExecutionEntry::new(
            0,
            code.to_string(),
            "ok".to_string(),
            true,
            vec![],
            output_files.into_iter().map(String::from).collect(),
            None,
        )
    }

    #[test]
    fn empty_executions_produce_empty_data() {
        let preprocessor = WorkflowPreprocessor::default();
        let data = preprocessor.preprocess(&[]);
        assert!(data.imports.is_empty());
        assert_eq!(data.code_structure.num_executions, 0);
    }

    #[test]
    fn infers_alias_from_usage() {
        let preprocessor = WorkflowPreprocessor::default();
        let executions = vec![entry("import pandas\ndf = pd.read_csv('x.csv')", vec![])];
        let data = preprocessor.preprocess(&executions);
        assert_eq!(data.import_aliases.get("pandas").map(String::as_str), Some("pd"));
        assert!(data.imports.iter().any(|i| i == "import pandas as pd"));
    }

    #[test]
    fn maps_output_files_to_execution_indices() {
        let preprocessor = WorkflowPreprocessor::default();
        let executions = vec![
            entry("df.to_csv('a.csv')", vec!["/tmp/work/a.csv"]),
            entry("df2.to_csv('b.csv')", vec!["/tmp/work/a.csv"]),
        ];
        let data = preprocessor.preprocess(&executions);
        assert_eq!(data.output_file_mapping.get("a.csv").unwrap(), &vec![0, 1]);
    }

    #[test]
    fn detects_try_except_outside_comments() {
        let preprocessor = WorkflowPreprocessor::default();
        let executions = vec![entry("# try: not real\ntry:\n    pass\nexcept Exception:\n    pass", vec![])];
        let data = preprocessor.preprocess(&executions);
        assert!(data.code_structure.has_try_except);
    }

    #[test]
    fn stdlib_imports_sort_before_third_party() {
        let preprocessor = WorkflowPreprocessor::default();
        let executions = vec![entry("import pandas\nimport os", vec![])];
        let data = preprocessor.preprocess(&executions);
        assert_eq!(data.imports[0], "import os");
    }
}
