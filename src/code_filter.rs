// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

//! Rule-based classification of a code block as "data processing" vs.
//! "exploration/debug". See spec.md §4.2.

use crate::entry::ExecutionEntry;
use once_cell::sync::Lazy;
use regex::Regex;

/// Compound keywords first so substring matching catches them before the
/// generic single-word rules get a chance to mis-fire.
pub static DATA_PROCESSING_KEYWORDS: &[&str] = &[
    "read_csv", "read_excel", "read_json", "read_parquet", "read_table",
    "to_csv", "to_excel", "to_json", "to_parquet",
    "gsea", "prerank", "enrichment", "pathway", "gseaplot", "enrichr", "fgsea",
    "ttest", "anova", "correlation", "regression", "differential",
    "load", "read", "process", "transform", "clean",
    "filter", "merge", "join", "aggregate", "groupby", "apply",
    "map", "reduce", "compute", "calculate", "analyze", "statistics",
    "save", "write", "export",
    "fit", "train", "predict", "evaluate", "score",
];

pub static EXPLORATION_KEYWORDS: &[&str] = &[
    "head", "tail", "describe", "info", "dtypes", "shape",
    "columns", "index", "explore", "inspect", "check", "verify",
    "print", "display", "show", "view", "look", "see",
    "debug",
];

pub static VISUALIZATION_KEYWORDS: &[&str] = &[
    "plot", "plt.", "matplotlib", "seaborn", "sns.", "show()",
    "hist", "bar", "scatter", "line", "box", "violin", "heatmap",
];

/// Keywords containing punctuation (`.`, `(`, `)`) can only ever appear as
/// a substring match; keywords that are a single identifier use a
/// word-boundary match so e.g. `"map"` doesn't fire on `"heatmap"`.
fn is_compound(keyword: &str) -> bool {
    keyword.contains(['_', '.', '(', ')'])
}

static FILE_READ_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"\.read_csv\(").unwrap(),
        Regex::new(r"\.read_excel\(").unwrap(),
        Regex::new(r"\.read_json\(").unwrap(),
        Regex::new(r"\.read_parquet\(").unwrap(),
        Regex::new(r"\.read_table\(").unwrap(),
        Regex::new(r#"open\([^,]+,\s*["']r"#).unwrap(),
        Regex::new(r"np\.load\(").unwrap(),
        Regex::new(r"pickle\.load\(").unwrap(),
    ]
});

static FILE_WRITE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"\.to_csv\(").unwrap(),
        Regex::new(r"\.to_excel\(").unwrap(),
        Regex::new(r"\.to_json\(").unwrap(),
        Regex::new(r"\.to_parquet\(").unwrap(),
        Regex::new(r"\.savefig\(").unwrap(),
        Regex::new(r"\.save\(").unwrap(),
        Regex::new(r#"open\([^,]+,\s*["']w"#).unwrap(),
        Regex::new(r#"open\([^,]+,\s*["']wb"#).unwrap(),
        Regex::new(r#"open\([^,]+,\s*["']wt"#).unwrap(),
        Regex::new(r"np\.save\(").unwrap(),
        Regex::new(r"pickle\.dump\(").unwrap(),
    ]
});

fn keyword_present(code: &str, keyword: &str) -> bool {
    if is_compound(keyword) {
        code.contains(keyword)
    } else {
        let pattern = format!(r"\b{}\b", regex::escape(keyword));
        Regex::new(&pattern).map(|re| re.is_match(code)).unwrap_or(false)
    }
}

fn any_keyword_present(code: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| keyword_present(code, k))
}

#[derive(Default)]
pub struct CodeFilter;

impl CodeFilter {
    pub fn new() -> Self {
        CodeFilter
    }

    pub fn is_file_operation(&self, code: &str) -> bool {
        FILE_READ_PATTERNS.iter().any(|p| p.is_match(code))
            || FILE_WRITE_PATTERNS.iter().any(|p| p.is_match(code))
    }

    pub fn has_output_operation(&self, code: &str) -> bool {
        FILE_WRITE_PATTERNS.iter().any(|p| p.is_match(code))
    }

    /// Priority rules, applied in order:
    /// 1. any `output_files` -> keep regardless of keywords
    /// 2/3. data-processing keyword present (optionally alongside an
    ///    exploration keyword) -> keep
    /// 4. exploration-only or visualization-only -> drop
    /// 5. no keyword list matches at all -> drop
    pub fn is_data_processing_code(&self, code: &str, has_output_files: bool) -> bool {
        if has_output_files {
            return true;
        }

        let has_data = any_keyword_present(code, DATA_PROCESSING_KEYWORDS);
        if has_data {
            return true;
        }

        let has_exploration = any_keyword_present(code, EXPLORATION_KEYWORDS);
        let has_visualization = any_keyword_present(code, VISUALIZATION_KEYWORDS);
        if has_exploration || has_visualization {
            return false;
        }

        false
    }

    pub fn filter_executions<'a>(&self, executions: &'a [ExecutionEntry]) -> Vec<&'a ExecutionEntry> {
        executions
            .iter()
            .filter(|e| e.success && self.is_data_processing_code(&e.code, !e.output_files.is_empty()))
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
    fn keeps_block_with_output_files_regardless_of_keywords() {
        let filter = CodeFilter::new();
        let e = entry("print(df.head())", vec!["out.csv"]);
        assert!(filter.is_data_processing_code(&e.code, !e.output_files.is_empty()));
    }

    #[test]
    fn drops_exploration_only_block() {
        let filter = CodeFilter::new();
        assert!(!filter.is_data_processing_code("df.head()", false));
    }

    #[test]
    fn drops_visualization_only_block() {
        let filter = CodeFilter::new();
        assert!(!filter.is_data_processing_code("plt.scatter(x, y)\nplt.show()", false));
    }

    #[test]
    fn keeps_block_with_both_data_and_exploration_keywords() {
        let filter = CodeFilter::new();
        assert!(filter.is_data_processing_code("df = pd.read_csv('x.csv')\nprint(df.head())", false));
    }

    #[test]
    fn drops_code_matching_no_keyword_list() {
        let filter = CodeFilter::new();
        assert!(!filter.is_data_processing_code("x = 1 + 1", false));
    }

    #[test]
    fn filter_executions_drops_failed_blocks_without_output_files() {
        let filter = CodeFilter::new();
        let executions = vec![ExecutionEntry::new(
            0,
            "df = pd.read_csv('x.csv')".to_string(),
            "traceback".to_string(),
            false,
            vec![],
            vec![],
            None,
        )];
        assert!(filter.filter_executions(&executions).is_empty());
    }

    #[test]
    fn single_word_keyword_respects_word_boundary() {
        let filter = CodeFilter::new();
        // "map" should not fire inside "heatmap"
        assert!(!keyword_present("sns.heatmap(corr)", "map"));
    }

    #[test]
    fn compound_keyword_matches_as_substring() {
        assert!(keyword_present("df.to_csv('x.csv')", "to_csv"));
    }
}
