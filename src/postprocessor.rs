// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

//! Validates and auto-fixes LLM-generated workflow code. See spec.md §4.5.

use crate::code_extractor::{CodeExtractor, ImportSection};
use crate::preprocessor::PreprocessedData;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub import_issues: Vec<String>,
    pub output_file_issues: Vec<String>,
    pub syntax_errors: Vec<String>,
    pub fixes_applied: Vec<String>,
}

struct AliasFix {
    bare_import: Regex,
    replacement: &'static str,
    usage_key: &'static str,
}

static USAGE_PATTERNS: Lazy<HashMap<&'static str, Regex>> = Lazy::new(|| {
    [
        ("argparse", r"\bargparse\."),
        ("os", r"\bos\."),
        ("sys", r"\bsys\."),
        ("pd", r"\bpd\."),
        ("np", r"\bnp\."),
        ("plt", r"\bplt\."),
        ("sns", r"\bsns\."),
        ("stats", r"\bstats\."),
    ]
    .into_iter()
    .map(|(k, p)| (k, Regex::new(p).unwrap()))
    .collect()
});

static IMPORT_CHECK_PATTERNS: Lazy<HashMap<&'static str, Regex>> = Lazy::new(|| {
    [
        ("argparse", r"(?m)^import\s+argparse\b"),
        ("os", r"(?m)^import\s+os\b"),
        ("sys", r"(?m)^import\s+sys\b"),
        ("pandas as pd", r"(?m)^import\s+pandas\s+as\s+pd\b"),
        ("numpy as np", r"(?m)^import\s+numpy\s+as\s+np\b"),
        ("matplotlib.pyplot as plt", r"(?m)^import\s+matplotlib\.pyplot\s+as\s+plt\b"),
        ("seaborn as sns", r"(?m)^import\s+seaborn\s+as\s+sns\b"),
        ("scipy import stats", r"(?m)^from\s+scipy\s+import\s+stats\b"),
    ]
    .into_iter()
    .map(|(k, p)| (k, Regex::new(p).unwrap()))
    .collect()
});

static ALIAS_FIX_PATTERNS: Lazy<Vec<AliasFix>> = Lazy::new(|| {
    vec![
        AliasFix {
            bare_import: Regex::new(r"(?m)^import\s+pandas\s*$").unwrap(),
            replacement: "import pandas as pd",
            usage_key: "pd",
        },
        AliasFix {
            bare_import: Regex::new(r"(?m)^import\s+numpy\s*$").unwrap(),
            replacement: "import numpy as np",
            usage_key: "np",
        },
        AliasFix {
            bare_import: Regex::new(r"(?m)^import\s+matplotlib\.pyplot\s*$").unwrap(),
            replacement: "import matplotlib.pyplot as plt",
            usage_key: "plt",
        },
        AliasFix {
            bare_import: Regex::new(r"(?m)^import\s+seaborn\s*$").unwrap(),
            replacement: "import seaborn as sns",
            usage_key: "sns",
        },
    ]
});

static AUTO_IMPORT_FIXES: &[(&str, &str, &str)] = &[
    ("pd", "import pandas as pd", "pandas as pd"),
    ("np", "import numpy as np", "numpy as np"),
    ("plt", "import matplotlib.pyplot as plt", "matplotlib.pyplot as plt"),
    ("sns", "import seaborn as sns", "seaborn as sns"),
    ("stats", "from scipy import stats", "scipy import stats"),
];

pub struct WorkflowPostprocessor {
    code_extractor: CodeExtractor,
}

impl Default for WorkflowPostprocessor {
    fn default() -> Self {
        WorkflowPostprocessor { code_extractor: CodeExtractor::default() }
    }
}

impl WorkflowPostprocessor {
    pub fn new(code_extractor: CodeExtractor) -> Self {
        WorkflowPostprocessor { code_extractor }
    }

    pub fn postprocess(
        &self,
        workflow_code: &str,
        preprocessed_data: &PreprocessedData,
    ) -> (String, ValidationReport) {
        if workflow_code.trim().is_empty() {
            return (
                workflow_code.to_string(),
                ValidationReport {
                    import_issues: vec!["Empty workflow code".to_string()],
                    ..Default::default()
                },
            );
        }

        let mut report = ValidationReport::default();

        let (mut code, import_issues) =
            self.fix_imports(workflow_code, &preprocessed_data.imports, &preprocessed_data.import_aliases);
        report.import_issues = import_issues;

        report.output_file_issues =
            self.validate_output_files(&code, &preprocessed_data.output_file_mapping);

        report.syntax_errors = self.check_syntax(&code);

        let (fixed_code, fixes_applied) = self.apply_auto_fixes(&code);
        code = fixed_code;
        report.fixes_applied = fixes_applied;

        (code, report)
    }

    fn fix_imports(
        &self,
        workflow_code: &str,
        expected_imports: &[String],
        import_aliases: &HashMap<String, String>,
    ) -> (String, Vec<String>) {
        if workflow_code.trim().is_empty() {
            return (workflow_code.to_string(), Vec::new());
        }

        let mut issues = Vec::new();
        let mut fixed_code = workflow_code.to_string();

        let current_imports = self.code_extractor.extract_imports(workflow_code, false);

        let missing_imports: Vec<&String> = expected_imports
            .iter()
            .filter(|expected| !Self::import_exists(expected, &current_imports))
            .collect();

        let incorrect_aliases: Vec<(&String, &String)> = import_aliases
            .iter()
            .filter(|(module, alias)| !Self::check_alias(&fixed_code, module, alias))
            .collect();

        if !missing_imports.is_empty() {
            let new_imports: String =
                missing_imports.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("\n");
            match CodeExtractor::find_import_section(&fixed_code, true) {
                Some(ImportSection::Chars { end, .. }) => {
                    fixed_code = format!(
                        "{}\n{}\n{}",
                        &fixed_code[..end],
                        new_imports,
                        &fixed_code[end..]
                    );
                    issues.push(format!("Added {} missing imports", missing_imports.len()));
                }
                _ => {
                    fixed_code = format!("{new_imports}\n\n{fixed_code}");
                    issues.push(format!(
                        "Added {} missing imports at the beginning",
                        missing_imports.len()
                    ));
                }
            }
        }

        for (module, expected_alias) in incorrect_aliases {
            let pattern = Regex::new(&format!(r"(?m)^import\s+{}\s*$", regex::escape(module))).unwrap();
            if pattern.is_match(&fixed_code) {
                fixed_code = pattern
                    .replace(&fixed_code, format!("import {module} as {expected_alias}").as_str())
                    .into_owned();
                issues.push(format!("Fixed alias for {module} -> {expected_alias}"));
            }
        }

        (fixed_code, issues)
    }

    fn validate_output_files(
        &self,
        workflow_code: &str,
        expected_output_files: &HashMap<String, Vec<usize>>,
    ) -> Vec<String> {
        if workflow_code.trim().is_empty() {
            return Vec::new();
        }
        let generated: std::collections::HashSet<String> =
            self.code_extractor.extract_output_files(workflow_code).into_iter().collect();

        expected_output_files
            .keys()
            .filter(|expected| !generated.contains(expected.as_str()))
            .map(|expected| format!("Missing output file: {expected}"))
            .collect()
    }

    /// Uses the embedded parser's error node rather than a Python
    /// `SyntaxError`, since there is no Python runtime to call into here.
    fn check_syntax(&self, workflow_code: &str) -> Vec<String> {
        if workflow_code.trim().is_empty() {
            return Vec::new();
        }
        match CodeExtractor::parse(workflow_code) {
            Some(tree) if tree.root_node().has_error() => {
                vec!["syntax error: generated code failed to parse".to_string()]
            }
            Some(_) => Vec::new(),
            None => vec!["syntax error: parser unavailable".to_string()],
        }
    }

    fn apply_auto_fixes(&self, workflow_code: &str) -> (String, Vec<String>) {
        if workflow_code.trim().is_empty() {
            return (workflow_code.to_string(), Vec::new());
        }

        let mut fixes_applied = Vec::new();
        let mut fixed_code = workflow_code.to_string();

        let import_insert_pos = match CodeExtractor::find_import_section(&fixed_code, true) {
            Some(ImportSection::Chars { end, .. }) => end,
            _ => 0,
        };

        let mut missing_imports = Vec::new();

        if Self::is_module_used(&fixed_code, "argparse") && !Self::has_import(&self.code_extractor, &fixed_code, "argparse") {
            missing_imports.push("import argparse".to_string());
            fixes_applied.push("Added missing argparse import".to_string());
        }
        if Self::is_module_used(&fixed_code, "os") && !Self::has_import(&self.code_extractor, &fixed_code, "os") {
            missing_imports.push("import os".to_string());
            fixes_applied.push("Added missing os import".to_string());
        }
        if Self::is_module_used(&fixed_code, "sys") && !Self::has_import(&self.code_extractor, &fixed_code, "sys") {
            missing_imports.push("import sys".to_string());
            fixes_applied.push("Added missing sys import".to_string());
        }

        for (alias, required_import, import_check_key) in AUTO_IMPORT_FIXES {
            if Self::is_module_used(&fixed_code, alias)
                && !Self::has_import(&self.code_extractor, &fixed_code, import_check_key)
            {
                missing_imports.push(required_import.to_string());
                fixes_applied.push(format!("Added missing import: {required_import}"));
            }
        }

        if !missing_imports.is_empty() {
            let new_imports = missing_imports.join("\n");
            if import_insert_pos > 0 {
                fixed_code = format!(
                    "{}\n{}\n{}",
                    &fixed_code[..import_insert_pos],
                    new_imports,
                    &fixed_code[import_insert_pos..]
                );
            } else {
                fixed_code = format!("{new_imports}\n\n{fixed_code}");
            }
        }

        for fix in ALIAS_FIX_PATTERNS.iter() {
            let usage_pattern = USAGE_PATTERNS.get(fix.usage_key);
            if let Some(usage_pattern) = usage_pattern {
                if usage_pattern.is_match(&fixed_code) && fix.bare_import.is_match(&fixed_code) {
                    fixed_code = fix.bare_import.replace(&fixed_code, fix.replacement).into_owned();
                    fixes_applied.push(format!("Fixed import alias: {}", fix.replacement));
                }
            }
        }

        (fixed_code, fixes_applied)
    }

    fn is_module_used(code: &str, module_name: &str) -> bool {
        if let Some(pattern) = USAGE_PATTERNS.get(module_name) {
            return pattern.is_match(code);
        }
        let pattern = Regex::new(&format!(r"\b{}\.", regex::escape(module_name))).unwrap();
        pattern.is_match(code)
    }

    fn has_import(code_extractor: &CodeExtractor, code: &str, import_key: &str) -> bool {
        if let Some(pattern) = IMPORT_CHECK_PATTERNS.get(import_key) {
            return pattern.is_match(code);
        }
        let imports = code_extractor.extract_imports(code, false);
        imports.iter().any(|imp| imp.contains(import_key))
    }

    /// Exact base-module matching so `"pandas"` doesn't also satisfy an
    /// expected `"pandas_utils"` import.
    fn import_exists(expected_import: &str, current_imports: &[String]) -> bool {
        let Some(module) = Self::module_of(expected_import) else {
            return false;
        };
        current_imports.iter().any(|imp| Self::module_of(imp).as_deref() == Some(module.as_str()))
    }

    fn module_of(import_stmt: &str) -> Option<String> {
        if let Some(rest) = import_stmt.strip_prefix("import ") {
            Some(rest.split(" as ").next().unwrap_or(rest).trim().to_string())
        } else if let Some(rest) = import_stmt.strip_prefix("from ") {
            Some(rest.split(" import ").next().unwrap_or(rest).trim().to_string())
        } else {
            None
        }
    }

    fn check_alias(code: &str, module: &str, expected_alias: &str) -> bool {
        let alias_pattern = Regex::new(&format!(r"\b{}\.", regex::escape(expected_alias))).unwrap();
        if !alias_pattern.is_match(code) {
            return true;
        }
        let import_pattern = Regex::new(&format!(
            r"import\s+{}\s+as\s+{}\b",
            regex::escape(module),
            regex::escape(expected_alias)
        ))
        .unwrap();
        import_pattern.is_match(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_with(imports: Vec<&str>, aliases: Vec<(&str, &str)>) -> PreprocessedData {
        PreprocessedData {
            imports: imports.into_iter().map(String::from).collect(),
            import_aliases: aliases
                .into_iter()
                .map(|(m, a)| (m.to_string(), a.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_code_reports_issue_without_panicking() {
        let postprocessor = WorkflowPostprocessor::default();
        let (code, report) = postprocessor.postprocess("", &PreprocessedData::default());
        assert_eq!(code, "");
        assert_eq!(report.import_issues, vec!["Empty workflow code".to_string()]);
    }

    #[test]
    fn adds_missing_import() {
        let postprocessor = WorkflowPostprocessor::default();
        let data = data_with(vec!["import os"], vec![]);
        let (code, report) = postprocessor.postprocess("x = 1\n", &data);
        assert!(code.contains("import os"));
        assert!(!report.import_issues.is_empty());
    }

    #[test]
    fn fixes_bare_import_missing_alias() {
        let postprocessor = WorkflowPostprocessor::default();
        let data = data_with(vec![], vec![("pandas", "pd")]);
        let code = "import pandas\ndf = pd.read_csv('x.csv')\n";
        let (fixed, _report) = postprocessor.postprocess(code, &data);
        assert!(fixed.contains("import pandas as pd"));
    }

    #[test]
    fn flags_missing_output_file() {
        let postprocessor = WorkflowPostprocessor::default();
        let mut data = PreprocessedData::default();
        data.output_file_mapping.insert("out.csv".to_string(), vec![0]);
        let (_code, report) = postprocessor.postprocess("df = 1\n", &data);
        assert!(report.output_file_issues.iter().any(|i| i.contains("out.csv")));
    }

    #[test]
    fn detects_syntax_error() {
        let postprocessor = WorkflowPostprocessor::default();
        let (_code, report) = postprocessor.postprocess("def f(:\n    pass\n", &PreprocessedData::default());
        assert!(!report.syntax_errors.is_empty());
    }

    #[test]
    fn auto_fixes_run_only_when_module_is_used() {
        let postprocessor = WorkflowPostprocessor::default();
        let (code, report) = postprocessor.postprocess("print('hi')\n", &PreprocessedData::default());
        assert_eq!(code, "print('hi')\n");
        assert!(report.fixes_applied.is_empty());
    }
}
