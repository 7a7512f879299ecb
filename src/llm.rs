// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

//! LLM-backed code generation: prompt construction, response cleaning, and
//! the `LlmClient` seam that lets callers plug in a real model. See
//! spec.md §4.6.

use crate::code_extractor::CodeExtractor;
use crate::entry::ExecutionEntry;
use crate::error::{Result, WorkflowError};
use crate::preprocessor::PreprocessedData;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};

const WORKFLOW_CODE_PREVIEW_LENGTH: usize = 3000;

/// Abstraction over "send a prompt, get text back" so the engine doesn't
/// depend on any particular model provider.
pub trait LlmClient: Send + Sync {
    fn invoke(&self, prompt: &str) -> Result<String>;
}

/// No-op client for environments with no model configured: extraction and
/// fixing are simply skipped, leaving the rule-based output untouched.
pub struct NullLlmClient;

impl LlmClient for NullLlmClient {
    fn invoke(&self, _prompt: &str) -> Result<String> {
        Err(WorkflowError::LlmInvocation("no LLM client configured".to_string()))
    }
}

/// Calls an OpenAI-compatible chat completion endpoint over HTTP.
pub struct HttpLlmClient {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::blocking::Client,
}

impl HttpLlmClient {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        HttpLlmClient {
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl LlmClient for HttpLlmClient {
    fn invoke(&self, prompt: &str) -> Result<String> {
        let mut request = self.client.post(&self.endpoint).json(&serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .map_err(|e| WorkflowError::LlmInvocation(e.to_string()))?
            .error_for_status()
            .map_err(|e| WorkflowError::LlmInvocation(e.to_string()))?;

        let body: serde_json::Value =
            response.json().map_err(|e| WorkflowError::LlmInvocation(e.to_string()))?;

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| WorkflowError::LlmInvocation("malformed response: no content".to_string()))
    }
}

static ALIAS_USAGE_PATTERNS: Lazy<BTreeMap<&'static str, (Regex, &'static str)>> = Lazy::new(|| {
    [
        ("pd", (r"\bpd\.", "pandas")),
        ("np", (r"\bnp\.", "numpy")),
        ("plt", (r"\bplt\.", "matplotlib.pyplot")),
        ("sns", (r"\bsns\.", "seaborn")),
        ("stats", (r"\bstats\.", "scipy.stats")),
        ("sm", (r"\bsm\.", "statsmodels")),
        ("sklearn", (r"\bsklearn\.", "sklearn")),
    ]
    .into_iter()
    .map(|(alias, (pattern, module))| (alias, (Regex::new(pattern).unwrap(), module)))
    .collect()
});

static CODE_BLOCK_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:python)?\n(.*?)```").unwrap());

static NUMBERED_LINE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.").unwrap());

#[derive(Debug, Clone, Default)]
pub struct WorkflowEnvironment {
    pub python_version: String,
    pub required_packages: Vec<String>,
    pub os: String,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowMetadata {
    pub generated_date: String,
    pub input_formats: Vec<String>,
    pub output_formats: Vec<String>,
    pub tools_used: Vec<String>,
    pub libraries: Vec<String>,
    pub environment: WorkflowEnvironment,
    pub description: String,
}

pub struct WorkflowLlmProcessor {
    llm: Box<dyn LlmClient>,
    code_extractor: CodeExtractor,
}

impl WorkflowLlmProcessor {
    pub fn new(llm: Box<dyn LlmClient>) -> Self {
        WorkflowLlmProcessor { llm, code_extractor: CodeExtractor::default() }
    }

    /// Filters to successful executions, builds a detailed extraction
    /// prompt, and returns the cleaned code the model produced. Empty
    /// string (not an error) if there is nothing successful to extract.
    pub fn extract_workflow_code(
        &self,
        execution_history: &[ExecutionEntry],
        preprocessed_data: Option<&PreprocessedData>,
        missing_outputs: &[String],
        retry_attempt: usize,
        previous_attempt_code: Option<&str>,
    ) -> Result<String> {
        let successful: Vec<&ExecutionEntry> =
            execution_history.iter().filter(|e| e.success).collect();
        if successful.is_empty() {
            return Ok(String::new());
        }

        let prompt = self.create_detailed_extraction_prompt(
            &successful,
            preprocessed_data,
            missing_outputs,
            retry_attempt,
            previous_attempt_code,
        );

        let response = self.llm.invoke(&prompt)?;
        Ok(Self::clean_llm_response(response.trim()))
    }

    fn create_detailed_extraction_prompt(
        &self,
        successful: &[&ExecutionEntry],
        preprocessed_data: Option<&PreprocessedData>,
        missing_outputs: &[String],
        retry_attempt: usize,
        previous_attempt_code: Option<&str>,
    ) -> String {
        let mut summary = String::new();
        for (i, entry) in successful.iter().enumerate() {
            summary.push_str(&format!("--- Block {i} ---\n{}\n", entry.code));
        }

        let mut prompt = String::new();
        prompt.push_str("You are a workflow synthesis assistant. Given the following successful code blocks from an interactive session, produce a single standalone Python script that reproduces the same outputs deterministically.\n\n");
        prompt.push_str("EXECUTION HISTORY:\n");
        prompt.push_str(&summary);

        if let Some(data) = preprocessed_data {
            if !data.imports.is_empty() {
                prompt.push_str("\nKNOWN IMPORTS:\n");
                prompt.push_str(&data.imports.join("\n"));
                prompt.push('\n');
            }
        }

        if !missing_outputs.is_empty() {
            prompt.push_str("\nThe following previously expected output files were missing and must be produced:\n");
            for f in missing_outputs {
                prompt.push_str(&format!("- {f}\n"));
            }
        }

        if let Some(previous) = previous_attempt_code {
            let preview: String = previous.chars().take(2000).collect();
            prompt.push_str(&format!(
                "\nThis is retry attempt {retry_attempt}. The previous attempt was:\n```python\n{preview}\n```\n"
            ));
        }

        prompt.push_str("\nOUTPUT FORMAT: Output ONLY the complete Python code, wrapped in a single ```python code block. Do not include any explanatory text.\n");
        prompt
    }

    pub fn generate_standalone_script(
        &self,
        code_blocks: &[String],
        metadata: &WorkflowMetadata,
        workflow_name: Option<&str>,
    ) -> String {
        let import_lists: Vec<Vec<String>> = code_blocks
            .iter()
            .filter(|c| !c.trim().is_empty())
            .map(|c| self.code_extractor.extract_imports(c, false))
            .collect();
        let all_imports = CodeExtractor::merge_imports(&import_lists);

        let header = Self::generate_header(metadata, workflow_name);
        let main_code = code_blocks.join("\n\n");
        let main_block = Self::generate_main_block();

        format!(
            "{header}\n\n{}\n\n{main_code}\n\n{main_block}\n",
            Self::format_imports(&all_imports)
        )
    }

    pub fn extract_metadata(&self, execution_history: &[ExecutionEntry]) -> WorkflowMetadata {
        let mut all_imports: HashSet<String> = HashSet::new();
        let mut input_files: HashSet<String> = HashSet::new();
        let mut output_files: HashSet<String> = HashSet::new();

        for entry in execution_history {
            if !entry.code.trim().is_empty() {
                all_imports.extend(self.code_extractor.extract_imports(&entry.code, false));
            }
            input_files.extend(entry.input_files.iter().cloned());
            output_files.extend(entry.output_files.iter().cloned());
        }

        let input_formats = Self::detect_file_formats(&input_files.into_iter().collect::<Vec<_>>());
        let output_formats = Self::detect_file_formats(&output_files.into_iter().collect::<Vec<_>>());
        let all_imports: Vec<String> = {
            let mut v: Vec<String> = all_imports.into_iter().collect();
            v.sort();
            v
        };
        let tools_used = Self::extract_tools_from_imports(&all_imports);

        WorkflowMetadata {
            generated_date: Utc::now().to_rfc3339(),
            input_formats,
            output_formats,
            tools_used,
            libraries: all_imports.clone(),
            environment: WorkflowEnvironment {
                python_version: "3.x".to_string(),
                required_packages: all_imports,
                os: std::env::consts::OS.to_string(),
            },
            description: format!("Workflow extracted from {} execution(s)", execution_history.len()),
        }
    }

    fn detect_file_formats(file_paths: &[String]) -> Vec<String> {
        let format_map: BTreeMap<&str, &str> = BTreeMap::from([
            ("CSV", "CSV"),
            ("TSV", "TSV"),
            ("TXT", "TXT"),
            ("XLSX", "Excel"),
            ("XLS", "Excel"),
            ("JSON", "JSON"),
            ("PKL", "Pickle"),
            ("PNG", "PNG"),
            ("JPG", "JPEG"),
            ("JPEG", "JPEG"),
            ("PDF", "PDF"),
        ]);

        let mut formats: HashSet<&str> = HashSet::new();
        for path in file_paths {
            if let Some(ext) = path.rsplit('.').next() {
                if ext != *path {
                    if let Some(name) = format_map.get(ext.to_uppercase().as_str()) {
                        formats.insert(name);
                    }
                }
            }
        }
        let mut out: Vec<String> = formats.into_iter().map(String::from).collect();
        out.sort();
        out
    }

    fn extract_tools_from_imports(imports: &[String]) -> Vec<String> {
        let mut tools: HashSet<String> = HashSet::new();
        for imp in imports {
            if let Some(rest) = imp.strip_prefix("import ") {
                if let Some(module) = rest.split_whitespace().next() {
                    tools.insert(module.to_string());
                }
            } else if let Some(rest) = imp.strip_prefix("from ") {
                if let Some(module) = rest.split_whitespace().next() {
                    tools.insert(module.to_string());
                }
            }
        }
        let mut out: Vec<String> = tools.into_iter().collect();
        out.sort();
        out
    }

    fn format_imports(imports: &[String]) -> String {
        imports.join("\n")
    }

    fn generate_header(metadata: &WorkflowMetadata, workflow_name: Option<&str>) -> String {
        let name = workflow_name.unwrap_or("Workflow");
        let input_formats = metadata.input_formats.join(", ");
        let output_formats = metadata.output_formats.join(", ");
        let tools = metadata.tools_used.join(", ");
        format!(
            "\"\"\"\nWorkflow: {name}\nGenerated: {}\nDescription: {}\n\nMetadata:\n- Input formats: {}\n- Output formats: {}\n- Tools/Libraries: {}\n- Environment: Python {}, {}\n\"\"\"",
            metadata.generated_date,
            metadata.description,
            if input_formats.is_empty() { "N/A".to_string() } else { input_formats },
            if output_formats.is_empty() { "N/A".to_string() } else { output_formats },
            if tools.is_empty() { "N/A".to_string() } else { tools },
            metadata.environment.python_version,
            metadata.environment.os,
        )
    }

    fn generate_main_block() -> String {
        r#"if __name__ == "__main__":
    import sys

    if len(sys.argv) < 2:
        print("Usage: python workflow.py <input_file1> [input_file2] ... [output_file]")
        sys.exit(1)

    input_files = sys.argv[1:-1] if len(sys.argv) > 2 else [sys.argv[1]]
    output_file = sys.argv[-1] if len(sys.argv) > 2 and sys.argv[-1].endswith(('.csv', '.xlsx', '.json', '.txt')) else None

    try:
        process_data(input_files, output_file)
        print("Workflow completed successfully.")
    except Exception as e:
        print(f"Error executing workflow: {e}")
        sys.exit(1)"#
            .to_string()
    }

    pub fn fix_workflow_code(&self, workflow_code: &str, error_message: &str, attempt_number: usize) -> String {
        let prompt = self.create_fix_prompt(workflow_code, error_message, attempt_number);
        match self.llm.invoke(&prompt) {
            Ok(response) => Self::clean_llm_response(response.trim()),
            Err(_) => workflow_code.to_string(),
        }
    }

    fn create_fix_prompt(&self, workflow_code: &str, error_message: &str, attempt_number: usize) -> String {
        let import_patterns = Self::analyze_import_usage_from_code(workflow_code);
        let mut import_guidance = String::new();
        if !import_patterns.is_empty() {
            import_guidance.push_str("\nDETECTED IMPORT USAGE IN CODE:\n");
            for (module, alias) in &import_patterns {
                import_guidance.push_str(&format!(
                    "- Code uses '{alias}.' -> MUST have `import {module} as {alias}`\n"
                ));
            }
            import_guidance.push('\n');
        }

        format!(
            "You are a Python code debugging assistant. A workflow script has failed with an error.\n\n\
CURRENT WORKFLOW CODE:\n```python\n{workflow_code}\n```\n\n\
ERROR MESSAGE:\n{error_message}\n{import_guidance}\n\
TASK:\nFix the code to resolve the error. Check import aliases, missing imports, and syntax errors.\n\n\
OUTPUT FORMAT:\nOutput ONLY the complete fixed Python code wrapped in a ```python code block.\n\n\
This is attempt {attempt_number} of 2."
        )
    }

    fn analyze_import_usage_from_code(code: &str) -> BTreeMap<String, String> {
        if code.trim().is_empty() {
            return BTreeMap::new();
        }
        ALIAS_USAGE_PATTERNS
            .iter()
            .filter(|(_, (pattern, _))| pattern.is_match(code))
            .map(|(alias, (_, module))| (module.to_string(), alias.to_string()))
            .collect()
    }

    pub fn generate_workflow_description(
        &self,
        workflow_code: &str,
        execution_count: usize,
    ) -> Option<String> {
        let analysis_summary = Self::prepare_analysis_summary(workflow_code);
        let prompt = Self::create_description_prompt(workflow_code, &analysis_summary, execution_count);
        let response = self.llm.invoke(&prompt).ok()?;
        Some(Self::clean_description_response(response.trim()))
    }

    fn prepare_analysis_summary(workflow_code: &str) -> String {
        let function_pattern = Regex::new(r"def\s+(\w+)\(").unwrap();
        let functions: Vec<&str> =
            function_pattern.captures_iter(workflow_code).filter_map(|c| c.get(1).map(|m| m.as_str())).collect();

        let lower = workflow_code.to_lowercase();
        let mut analysis_types = Vec::new();
        if lower.contains("pca") {
            analysis_types.push("PCA (Principal Component Analysis)");
        }
        if lower.contains("ttest") || lower.contains("differential") {
            analysis_types.push("Differential Expression Analysis (DEG)");
        }
        if lower.contains("gsea") || lower.contains("prerank") {
            analysis_types.push("GSEA (Gene Set Enrichment Analysis)");
        }
        if lower.contains("volcano") {
            analysis_types.push("Volcano Plot");
        }
        if lower.contains("heatmap") || lower.contains("clustermap") {
            analysis_types.push("Heatmap Visualization");
        }

        let mut parts = vec![format!("Functions identified: {}", functions.join(", "))];
        if !analysis_types.is_empty() {
            parts.push(format!("Analysis types: {}", analysis_types.join(", ")));
        }
        parts.join("\n")
    }

    fn create_description_prompt(workflow_code: &str, analysis_summary: &str, execution_count: usize) -> String {
        let code_preview: String = workflow_code.chars().take(WORKFLOW_CODE_PREVIEW_LENGTH).collect();
        let code_preview = if workflow_code.chars().count() > WORKFLOW_CODE_PREVIEW_LENGTH {
            format!("{code_preview}\n... (code continues)")
        } else {
            code_preview
        };

        format!(
            "You are a documentation assistant. Create a structured, numbered description of this workflow, \
derived from {execution_count} recorded execution(s).\n\n\
WORKFLOW CODE:\n```python\n{code_preview}\n```\n\n\
ANALYSIS SUMMARY:\n{analysis_summary}\n\n\
OUTPUT FORMAT: a numbered list (1., 2., 3., ...) describing preprocessing, analysis steps, and visualization. \
Output ONLY the description text, starting with \"1.\"."
        )
    }

    fn clean_description_response(response: &str) -> String {
        let without_code_fences = response.replace("```python", "").replace("```", "");
        let mut cleaned_lines = Vec::new();
        let mut skip_until_number = true;

        for line in without_code_fences.lines() {
            let stripped = line.trim();
            if stripped.is_empty() && cleaned_lines.is_empty() {
                continue;
            }
            if skip_until_number {
                if NUMBERED_LINE_PATTERN.is_match(stripped) {
                    skip_until_number = false;
                    cleaned_lines.push(line);
                }
                continue;
            }
            cleaned_lines.push(line);
        }

        cleaned_lines.join("\n").trim().to_string()
    }

    /// Extracts code from the longest fenced block, falling back to a
    /// line-heuristic scan (leading `import`/`def`/`class`/comment lines)
    /// and finally a best-effort strip of obvious prose lines.
    fn clean_llm_response(response: &str) -> String {
        let matches: Vec<&str> = CODE_BLOCK_PATTERN
            .captures_iter(response)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        if let Some(longest) = matches.into_iter().max_by_key(|m| m.len()) {
            return longest.trim().to_string();
        }

        let lines: Vec<&str> = response.lines().collect();
        let mut code_start: Option<usize> = None;
        let mut code_end: Option<usize> = None;

        for (i, line) in lines.iter().enumerate() {
            let stripped = line.trim();
            let looks_like_code_start = stripped.starts_with("import ")
                || stripped.starts_with("from ")
                || stripped.starts_with("def ")
                || stripped.starts_with("class ")
                || stripped.starts_with('#')
                || stripped.starts_with("\"\"\"")
                || stripped.starts_with("'''");
            if looks_like_code_start {
                if code_start.is_none() {
                    code_start = Some(i);
                }
                code_end = Some(i + 1);
            } else if code_start.is_some() {
                if !stripped.is_empty() || line.starts_with(' ') || line.starts_with('\t') {
                    code_end = Some(i + 1);
                } else {
                    break;
                }
            }
        }

        if let (Some(start), Some(end)) = (code_start, code_end) {
            return lines[start..end].join("\n").trim().to_string();
        }

        let explanation_prefixes = ["here is", "this is", "the following", "below is", "above is"];
        response
            .lines()
            .filter(|line| {
                let stripped = line.trim();
                if stripped.is_empty() {
                    return false;
                }
                let lower = stripped.to_lowercase();
                if explanation_prefixes.iter().any(|p| lower.starts_with(p)) {
                    return false;
                }
                if stripped.len() > 200
                    && !["import", "def", "class", "=", "(", ")", "[", "]"]
                        .iter()
                        .any(|kw| lower.contains(kw))
                {
                    return false;
                }
                true
            })
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoClient;
    impl LlmClient for EchoClient {
        fn invoke(&self, prompt: &str) -> Result<String> {
            Ok(format!("```python\nx = 1\n```\n\n(prompt was {} chars)", prompt.len()))
        }
    }

    #[test]
    fn extracts_code_from_markdown_fence() {
        let cleaned = WorkflowLlmProcessor::clean_llm_response("```python\nimport os\nprint(os.getcwd())\n```");
        assert_eq!(cleaned, "import os\nprint(os.getcwd())");
    }

    #[test]
    fn falls_back_to_heuristic_scan_without_fences() {
        let cleaned = WorkflowLlmProcessor::clean_llm_response("Here is the code:\nimport os\nprint(1)\n\nThanks!");
        assert!(cleaned.contains("import os"));
    }

    #[test]
    fn extract_workflow_code_short_circuits_on_no_successful_entries() {
        let processor = WorkflowLlmProcessor::new(Box::new(NullLlmClient));
        let entries = vec![ExecutionEntry::new(0, "x".into(), "err".into(), false, vec![], vec![], None)];
        let result = processor.extract_workflow_code(&entries, None, &[], 0, None).unwrap();
        assert_eq!(result, "");
    }

    #[test]
    fn extract_workflow_code_invokes_client_for_successful_entries() {
        let processor = WorkflowLlmProcessor::new(Box::new(EchoClient));
        let entries = vec![ExecutionEntry::new(0, "x = 1".into(), "ok".into(), true, vec![], vec![], None)];
        let result = processor.extract_workflow_code(&entries, None, &[], 0, None).unwrap();
        assert_eq!(result, "x = 1");
    }

    #[test]
    fn null_client_fix_returns_original_code_on_failure() {
        let processor = WorkflowLlmProcessor::new(Box::new(NullLlmClient));
        let fixed = processor.fix_workflow_code("x = 1", "NameError", 1);
        assert_eq!(fixed, "x = 1");
    }

    #[test]
    fn description_response_is_trimmed_to_numbered_list() {
        let cleaned =
            WorkflowLlmProcessor::clean_description_response("Sure, here you go:\n\n1. Data Preprocessing\n   - loaded csv\n2. Analysis\n   - ran pca");
        assert!(cleaned.starts_with("1. Data Preprocessing"));
    }
}
