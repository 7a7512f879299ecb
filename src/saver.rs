// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

//! Orchestrates turning a session into a saved artifact: notebook, simple
//! concatenation, or LLM-assisted generation. See spec.md §4.7.

use crate::code_extractor::CodeExtractor;
use crate::code_filter::CodeFilter;
use crate::config::SaveMode;
use crate::entry::ExecutionEntry;
use crate::error::{Result, WorkflowError};
use crate::llm::WorkflowLlmProcessor;
use crate::notebook::NotebookBuilder;
use crate::postprocessor::WorkflowPostprocessor;
use crate::preprocessor::WorkflowPreprocessor;
use crate::reconciler::Reconciler;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use streaming_iterator::StreamingIterator;
use tree_sitter::{Query, QueryCursor};

const MAX_FILENAME_LENGTH: usize = 50;

lazy_static::lazy_static! {
    static ref ASSIGN_TARGET_QUERY: Query = Query::new(
        &tree_sitter_python::LANGUAGE.into(),
        r#"
        (assignment left: (identifier) @target)
        (assignment left: (pattern_list (identifier) @target))
        (assignment left: (tuple_pattern (identifier) @target))
        (for_statement left: (identifier) @target)
        (for_statement left: (pattern_list (identifier) @target))
        (with_item alias: (identifier) @target)
        (function_definition name: (identifier) @target)
        (class_definition name: (identifier) @target)
        "#
    ).expect("static query must compile");

    static ref IDENTIFIER_QUERY: Query = Query::new(
        &tree_sitter_python::LANGUAGE.into(),
        "(identifier) @ident"
    ).expect("static query must compile");
}

static NAME_FUNC_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"def\s+(\w+)").unwrap());
static NAME_COMMENT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)#\s*workflow[:\s]+(\w+)").unwrap());
static SANITIZE_STRIP_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s-]").unwrap());
static SANITIZE_COLLAPSE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-\s]+").unwrap());

pub struct WorkflowSaver {
    pub workflows_dir: PathBuf,
    code_extractor: CodeExtractor,
    code_filter: CodeFilter,
    preprocessor: WorkflowPreprocessor,
    postprocessor: WorkflowPostprocessor,
    llm: Option<WorkflowLlmProcessor>,
    max_retries: usize,
}

impl WorkflowSaver {
    pub fn new(workflows_dir: PathBuf, llm: Option<WorkflowLlmProcessor>) -> Result<Self> {
        std::fs::create_dir_all(&workflows_dir)?;
        Ok(WorkflowSaver {
            workflows_dir,
            code_extractor: CodeExtractor::default(),
            code_filter: CodeFilter::new(),
            preprocessor: WorkflowPreprocessor::default(),
            postprocessor: WorkflowPostprocessor::default(),
            llm,
            max_retries: 5,
        })
    }

    /// Overrides the default retry budget for `llm` mode's missing-output
    /// loop (see `save_workflow_llm`); callers wire this from
    /// `EngineConfig::max_retries`.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn save_workflow(
        &self,
        executions: &[ExecutionEntry],
        mode: SaveMode,
        workflow_name: Option<&str>,
    ) -> Result<PathBuf> {
        self.save_workflow_with_audit(executions, mode, workflow_name, None)
    }

    fn save_workflow_with_audit(
        &self,
        executions: &[ExecutionEntry],
        mode: SaveMode,
        workflow_name: Option<&str>,
        audit: Option<&crate::logging::AuditLogger>,
    ) -> Result<PathBuf> {
        match mode {
            SaveMode::Notebook => self.save_workflow_notebook(executions, workflow_name),
            SaveMode::Simple => self.save_workflow_simple(executions, workflow_name),
            SaveMode::Llm => self.save_workflow_llm(executions, workflow_name, audit),
        }
    }

    /// Scans each block's code for a non-generic function name or a
    /// `# workflow: name` comment before falling back to a timestamped
    /// default — same priority order as the rest of the pack's naming
    /// heuristics.
    pub fn get_workflow_name(&self, executions: &[ExecutionEntry]) -> String {
        for entry in executions {
            if let Some(caps) = NAME_FUNC_PATTERN.captures(&entry.code) {
                let func_name = &caps[1];
                if !["main", "process", "run"].contains(&func_name) {
                    return title_case(&func_name.replace('_', " "));
                }
            }
            if let Some(caps) = NAME_COMMENT_PATTERN.captures(&entry.code) {
                return title_case(&caps[1].replace('_', " "));
            }
        }
        format!("workflow_{}", Utc::now().format("%Y%m%d_%H%M%S"))
    }

    fn sanitize_filename(&self, name: &str) -> String {
        let stripped = SANITIZE_STRIP_PATTERN.replace_all(name, "");
        let collapsed = SANITIZE_COLLAPSE_PATTERN.replace_all(&stripped, "_");
        let trimmed = collapsed.trim_matches('_');
        let truncated: String = trimmed.chars().take(MAX_FILENAME_LENGTH).collect();
        if truncated.is_empty() { "unnamed".to_string() } else { truncated }
    }

    // ---- notebook mode ----

    fn save_workflow_notebook(
        &self,
        executions: &[ExecutionEntry],
        workflow_name: Option<&str>,
    ) -> Result<PathBuf> {
        let candidates: Vec<&ExecutionEntry> =
            executions.iter().filter(|e| !e.code.trim().is_empty()).collect();
        if candidates.is_empty() {
            return Err(WorkflowError::EmptySession);
        }

        let owned: Vec<ExecutionEntry> = candidates.into_iter().cloned().collect();
        let name = workflow_name
            .map(String::from)
            .unwrap_or_else(|| self.get_workflow_name(&owned));

        let notebook = NotebookBuilder::build(&owned, &name);
        let json = serde_json::to_string_pretty(&notebook)
            .map_err(|e| WorkflowError::Other(format!("failed to serialize notebook: {e}")))?;

        let safe_name = self.sanitize_filename(&name);
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = self.workflows_dir.join(format!("workflow_{safe_name}_{timestamp}.ipynb"));
        std::fs::write(&path, json)?;
        Ok(path)
    }

    // ---- simple (concatenation) mode ----

    fn save_workflow_simple(
        &self,
        executions: &[ExecutionEntry],
        workflow_name: Option<&str>,
    ) -> Result<PathBuf> {
        let mut successful: Vec<&ExecutionEntry> = executions.iter().filter(|e| e.success).collect();

        let required_failed = self.required_failed_executions(executions, &successful);
        successful.extend(required_failed.iter().copied());
        successful.sort_by_key(|e| e.timestamp);

        if successful.is_empty() {
            return Err(WorkflowError::EmptySession);
        }

        let name = workflow_name
            .map(String::from)
            .unwrap_or_else(|| self.get_workflow_name(&successful.iter().map(|e| (*e).clone()).collect::<Vec<_>>()));

        let completed = self.complete_with_variable_dependencies(executions, &successful);

        let params = build_path_parameterization(completed.iter(), &self.code_extractor);
        let body: String = completed
            .iter()
            .map(|e| rewrite_file_paths(&e.code, &self.code_extractor, &params))
            .collect::<Vec<_>>()
            .join("\n\n");

        let preprocessed = self.preprocessor.preprocess(&completed);
        let argparse_block = build_argparse_block(&params);
        let script = if argparse_block.is_empty() {
            format!("{}\n\n{}\n", self.preprocessor_header(&name, &preprocessed), body)
        } else {
            format!(
                "{}\n\n{}\n\n{}\n",
                self.preprocessor_header(&name, &preprocessed),
                argparse_block,
                body
            )
        };

        let safe_name = self.sanitize_filename(&name);
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = self.workflows_dir.join(format!("workflow_{safe_name}_{timestamp}.tmp.py"));
        std::fs::write(&path, script)?;
        Ok(path)
    }

    fn preprocessor_header(&self, name: &str, data: &crate::preprocessor::PreprocessedData) -> String {
        format!(
            "\"\"\"\nWorkflow: {name}\nGenerated: {}\nImports: {}\n\"\"\"",
            Utc::now().to_rfc3339(),
            data.imports.join(", ")
        )
    }

    /// Identifies failed blocks that produced a file a successful block
    /// later reads, via cheap filename-in-quotes regex matching rather
    /// than a full read-call parse, same tradeoff the original makes.
    fn required_failed_executions<'a>(
        &self,
        all: &'a [ExecutionEntry],
        successful: &[&'a ExecutionEntry],
    ) -> Vec<&'a ExecutionEntry> {
        let failed_with_outputs: Vec<&ExecutionEntry> =
            all.iter().filter(|e| !e.success && !e.output_files.is_empty()).collect();
        if failed_with_outputs.is_empty() {
            return Vec::new();
        }

        let mut filename_to_executions: HashMap<String, Vec<&ExecutionEntry>> = HashMap::new();
        for failed in &failed_with_outputs {
            for output in &failed.output_files {
                let filename = Path::new(output).file_name().map(|n| n.to_string_lossy().to_string());
                if let Some(filename) = filename {
                    filename_to_executions.entry(filename).or_default().push(failed);
                }
            }
        }

        let quote_pattern = Regex::new(r#"["']([^"']+)["']"#).unwrap();
        let mut required: Vec<&ExecutionEntry> = Vec::new();
        let mut seen: HashSet<*const ExecutionEntry> = HashSet::new();

        for entry in successful {
            for caps in quote_pattern.captures_iter(&entry.code) {
                let literal = &caps[1];
                let filename = Path::new(literal).file_name().map(|n| n.to_string_lossy().to_string());
                if let Some(filename) = filename {
                    if let Some(producers) = filename_to_executions.get(&filename) {
                        for producer in producers {
                            let ptr = *producer as *const ExecutionEntry;
                            if seen.insert(ptr) {
                                required.push(producer);
                            }
                        }
                    }
                }
            }
        }
        required
    }

    /// Back-fills one level of missing variable definitions from failed
    /// executions: if a successful block reads a name no successful block
    /// defines, the failed block that assigns it is pulled in too.
    fn complete_with_variable_dependencies(
        &self,
        all: &[ExecutionEntry],
        successful: &[&ExecutionEntry],
    ) -> Vec<ExecutionEntry> {
        let mut used_variables: HashSet<String> = HashSet::new();
        let mut defined_variables: HashSet<String> = HashSet::new();
        for entry in successful {
            used_variables.extend(extract_variable_usage(&entry.code));
            defined_variables.extend(extract_variable_definitions(&entry.code));
        }

        let missing: HashSet<String> = used_variables.difference(&defined_variables).cloned().collect();
        if missing.is_empty() {
            return successful.iter().map(|e| (*e).clone()).collect();
        }

        let mut extra: Vec<&ExecutionEntry> = Vec::new();
        for entry in all.iter().filter(|e| !e.success) {
            let defines = extract_variable_definitions(&entry.code);
            if defines.intersection(&missing).next().is_some() {
                extra.push(entry);
            }
        }

        let mut combined: Vec<&ExecutionEntry> = successful.to_vec();
        combined.extend(extra);
        combined.sort_by_key(|e| e.timestamp);
        combined.into_iter().map(|e| e.clone()).collect()
    }

    // ---- LLM-assisted mode ----

    fn save_workflow_llm(
        &self,
        executions: &[ExecutionEntry],
        workflow_name: Option<&str>,
        audit: Option<&crate::logging::AuditLogger>,
    ) -> Result<PathBuf> {
        let Some(llm) = &self.llm else {
            return Err(WorkflowError::LlmInvocation("no LLM client configured for llm save mode".to_string()));
        };

        // Drop exploration/debug blocks before they reach the LLM prompt;
        // anything with its own output files survives regardless.
        let filtered: Vec<ExecutionEntry> =
            self.code_filter.filter_executions(executions).into_iter().cloned().collect();
        let filtered = if filtered.is_empty() { executions.to_vec() } else { filtered };

        let preprocessed = self.preprocessor.preprocess(&filtered);
        let expected_outputs: Vec<String> = preprocessed.output_file_mapping.keys().cloned().collect();

        // Loop up to `max_retries`: each attempt sees the cumulative union
        // of every prior attempt's missing outputs, not just its own, so
        // the prompt's retry context only ever grows.
        let max_retries = self.max_retries.max(1);
        let mut cumulative_missing: Vec<String> = Vec::new();
        let mut current_missing: Vec<String> = expected_outputs.clone();
        let mut reconciled = String::new();
        let mut previous_code: Option<String> = None;

        for attempt in 0..max_retries {
            let generated = llm.extract_workflow_code(
                &filtered,
                Some(&preprocessed),
                &cumulative_missing,
                attempt,
                previous_code.as_deref(),
            )?;
            if generated.trim().is_empty() {
                return Err(WorkflowError::EmptyGeneration);
            }

            let (postprocessed, _report) = self.postprocessor.postprocess(&generated, &preprocessed);
            reconciled = Reconciler::apply_rule_based_fixes(&postprocessed);
            previous_code = Some(reconciled.clone());

            let produced = self.code_extractor.extract_output_files(&reconciled);
            let produced: HashSet<&str> = produced.iter().map(|s| s.as_str()).collect();
            current_missing =
                expected_outputs.iter().filter(|o| !produced.contains(o.as_str())).cloned().collect();

            if current_missing.is_empty() {
                break;
            }

            for missing in &current_missing {
                if !cumulative_missing.contains(missing) {
                    cumulative_missing.push(missing.clone());
                }
            }

            if attempt + 1 < max_retries {
                if let Some(audit) = audit {
                    audit.log_missing_outputs(&current_missing, attempt + 1);
                }
            }
        }

        if !current_missing.is_empty() {
            reconciled = self.apply_forced_inclusion(&reconciled, &filtered, &preprocessed, &current_missing);
            if let Some(audit) = audit {
                audit.log_forced_inclusion(current_missing.len());
            }
        }

        let name = workflow_name.map(String::from).unwrap_or_else(|| {
            self.get_workflow_name(&filtered)
        });

        let safe_name = self.sanitize_filename(&name);
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = self.workflows_dir.join(format!("workflow_{safe_name}_{timestamp}.tmp.py"));
        std::fs::write(&path, reconciled)?;
        Ok(path)
    }

    /// Last resort once the retry loop in `save_workflow_llm` exhausts
    /// `max_retries` still missing outputs: locates the original block that
    /// produced each one (via `output_file_mapping`) and splices it
    /// verbatim into the generated script, parameterizing its absolute
    /// paths the same way `Simple` mode's forced blocks are parameterized.
    fn apply_forced_inclusion(
        &self,
        code: &str,
        filtered: &[ExecutionEntry],
        preprocessed: &crate::preprocessor::PreprocessedData,
        missing: &[String],
    ) -> String {
        let mut blocks: Vec<String> = Vec::new();
        let mut spliced_indices: HashSet<usize> = HashSet::new();

        for output in missing {
            let Some(indices) = preprocessed.output_file_mapping.get(output) else {
                continue;
            };
            for &idx in indices {
                if !spliced_indices.insert(idx) {
                    continue;
                }
                let Some(producer) = filtered.get(idx) else {
                    continue;
                };
                let stripped = strip_specific_comments(&producer.code);
                blocks.push(parameterize_file_paths(&stripped));
            }
        }

        if blocks.is_empty() {
            return code.to_string();
        }

        let splice_text = blocks.join("\n\n");
        let spliced = splice_before_main_or_append(code, &splice_text);

        let referenced_imports = self.code_extractor.extract_imports(&splice_text, false);
        let with_imports = insert_missing_imports(&spliced, &referenced_imports);

        Reconciler::apply_rule_based_fixes(&with_imports)
    }

    /// Drops the `.tmp` suffix a `Simple`/`Llm` save staged its artifact
    /// under, marking it as validated. Notebook artifacts never carry the
    /// suffix and never pass through here.
    fn finalize_workflow_file(&self, tmp_path: &Path) -> Result<PathBuf> {
        let final_path = if tmp_path.to_string_lossy().ends_with(".tmp.py") {
            let trimmed = tmp_path.to_string_lossy();
            PathBuf::from(trimmed.trim_end_matches(".tmp.py")).with_extension("py")
        } else {
            tmp_path.to_path_buf()
        };
        if final_path != tmp_path {
            std::fs::rename(tmp_path, &final_path)?;
        }
        Ok(final_path)
    }

    /// Saves a workflow and, for `Simple`/`Llm` modes with known expected
    /// outputs, re-executes it in isolation to confirm it reproduces them
    /// before finalizing. Mirrors the original's repair ladder: one
    /// rule-based fix attempt always, then (LLM mode only) up to
    /// `max_fix_attempts` further LLM-fix-then-revalidate rounds. A script
    /// that never validates is left on disk as `.tmp.py` rather than
    /// finalized, per spec.md's error handling design.
    #[allow(clippy::too_many_arguments)]
    pub fn save_and_validate_workflow(
        &self,
        executions: &[ExecutionEntry],
        mode: SaveMode,
        workflow_name: Option<&str>,
        input_files: &[String],
        expected_output_files: &HashMap<String, Vec<u8>>,
        validator: Option<&crate::validator::WorkflowValidator>,
        audit: Option<&crate::logging::AuditLogger>,
        max_fix_attempts: usize,
    ) -> Result<PathBuf> {
        if let Some(audit) = audit {
            let name = workflow_name.map(String::from).unwrap_or_else(|| self.get_workflow_name(executions));
            audit.log_workflow_start(&name, executions.len());
        }

        let path = self.save_workflow_with_audit(executions, mode, workflow_name, audit)?;

        let (Some(validator), false) = (validator, mode == SaveMode::Notebook) else {
            // No validator configured (or nothing to validate for notebook
            // mode): there is no way for this artifact to fail validation,
            // so it finalizes unconditionally per P6.
            let finalized = self.finalize_workflow_file(&path)?;
            if let Some(audit) = audit {
                audit.log_workflow_complete(&finalized);
            }
            return Ok(finalized);
        };

        if expected_output_files.is_empty() {
            let finalized = self.finalize_workflow_file(&path)?;
            if let Some(audit) = audit {
                audit.log_workflow_complete(&finalized);
            }
            return Ok(finalized);
        }

        let mut report = validator.validate_workflow(&path, input_files, expected_output_files);
        if report.valid {
            if let Some(audit) = audit {
                audit.log_validation_result(true, "all output files match");
            }
            let finalized = self.finalize_workflow_file(&path)?;
            if let Some(audit) = audit {
                audit.log_workflow_complete(&finalized);
            }
            return Ok(finalized);
        }

        if let Some(audit) = audit {
            audit.log_validation_result(false, &validation_summary(&report));
        }

        let current_code = std::fs::read_to_string(&path)?;
        let rule_fixed = Reconciler::apply_rule_based_fixes(&current_code);
        std::fs::write(&path, &rule_fixed)?;
        report = validator.validate_workflow(&path, input_files, expected_output_files);
        if report.valid {
            if let Some(audit) = audit {
                audit.log_validation_result(true, "all output files match after rule-based fix");
            }
            let finalized = self.finalize_workflow_file(&path)?;
            if let Some(audit) = audit {
                audit.log_workflow_complete(&finalized);
            }
            return Ok(finalized);
        }

        let Some(llm) = (if mode == SaveMode::Llm { self.llm.as_ref() } else { None }) else {
            if let Some(audit) = audit {
                audit.log_error(&format!(
                    "workflow left unfinalized at {}: {}",
                    path.display(),
                    validation_summary(&report)
                ));
            }
            return Err(WorkflowError::ValidationFailed(validation_summary(&report)));
        };

        let mut code = rule_fixed;
        for attempt in 1..=max_fix_attempts {
            let error_message = validation_summary(&report);
            let fixed = llm.fix_workflow_code(&code, &error_message, attempt);
            code = Reconciler::apply_rule_based_fixes(&fixed);
            std::fs::write(&path, &code)?;
            report = validator.validate_workflow(&path, input_files, expected_output_files);
            if report.valid {
                if let Some(audit) = audit {
                    audit.log_validation_result(true, &format!("all output files match after LLM fix attempt {attempt}"));
                }
                let finalized = self.finalize_workflow_file(&path)?;
                if let Some(audit) = audit {
                    audit.log_workflow_complete(&finalized);
                }
                return Ok(finalized);
            }
            if let Some(audit) = audit {
                audit.log_validation_result(false, &format!("LLM fix attempt {attempt} still failing: {}", validation_summary(&report)));
            }
        }

        if let Some(audit) = audit {
            audit.log_error(&format!(
                "workflow left unfinalized at {} after {max_fix_attempts} LLM fix attempt(s): {}",
                path.display(),
                validation_summary(&report)
            ));
        }
        Err(WorkflowError::ValidationFailed(validation_summary(&report)))
    }

    pub fn code_extractor(&self) -> &CodeExtractor {
        &self.code_extractor
    }
}

/// Caps the rendered difference list at 10 entries so a run with hundreds
/// of mismatched files doesn't blow up the audit log or error message.
fn validation_summary(report: &crate::validator::ValidationReport) -> String {
    if let Some(err) = &report.error {
        return err.clone();
    }
    let Some(comparison) = &report.comparison else {
        return "validation failed with no further detail".to_string();
    };
    let preview: Vec<&String> = comparison.differences.iter().take(10).collect();
    let mut text = preview.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("; ");
    if comparison.differences.len() > 10 {
        text.push_str(&format!(" ... and {} more", comparison.differences.len() - 10));
    }
    text
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// One `--input-<stem>` flag per distinct input file category detected
/// across a session, plus the basenames every write call should be
/// rewritten to land under `output_dir`. Shared with `notebook.rs`, whose
/// argparse shim cell needs the same category detection as `Simple` mode.
pub(crate) struct PathParameterization {
    pub(crate) header_args: Vec<(String, String)>,
    read_map: HashMap<String, String>,
    write_map: HashMap<String, String>,
}

impl PathParameterization {
    pub(crate) fn needs_cli_args(&self) -> bool {
        !self.header_args.is_empty() || !self.write_map.is_empty()
    }
}

/// Lowercases and collapses a file stem to a valid Python identifier
/// fragment, e.g. `"Clinical-Data"` -> `"clinical_data"`.
fn sanitize_category_stem(stem: &str) -> String {
    let mut out = String::new();
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() { "input".to_string() } else { trimmed.to_string() }
}

/// Scans every execution's read/write file operations and assigns each
/// distinct input stem an `--input-<stem>` flag and `input_<stem>`
/// variable, and maps each write literal to its bare basename (callers
/// join it onto `output_dir`).
pub(crate) fn build_path_parameterization<'a>(
    entries: impl IntoIterator<Item = &'a ExecutionEntry>,
    extractor: &CodeExtractor,
) -> PathParameterization {
    let mut header_args = Vec::new();
    let mut read_map: HashMap<String, String> = HashMap::new();
    let mut write_map: HashMap<String, String> = HashMap::new();
    let mut seen_vars: HashSet<String> = HashSet::new();

    for entry in entries {
        let ops = extractor.extract_file_operations(&entry.code);
        for op in &ops.read_operations {
            if read_map.contains_key(&op.file) {
                continue;
            }
            let stem = Path::new(&op.file)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "input".to_string());
            let base = sanitize_category_stem(&stem);
            let mut var_name = format!("input_{base}");
            let mut suffix = 2;
            while seen_vars.contains(&var_name) {
                var_name = format!("input_{base}_{suffix}");
                suffix += 1;
            }
            seen_vars.insert(var_name.clone());
            header_args.push((format!("--input-{}", base.replace('_', "-")), var_name.clone()));
            read_map.insert(op.file.clone(), var_name);
        }
        for op in &ops.write_operations {
            if write_map.contains_key(&op.file) {
                continue;
            }
            let basename = Path::new(&op.file)
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| op.file.clone());
            write_map.insert(op.file.clone(), basename);
        }
    }

    PathParameterization { header_args, read_map, write_map }
}

/// Rewrites one block's quoted file-path literals to the variables/
/// `output_dir` joins `build_path_parameterization` assigned. Whether a
/// given literal is a read or a write is decided per-block (via this
/// block's own `extract_file_operations` call) so the same basename used
/// as both an input in one block and an output in another rewrites
/// correctly in each.
pub(crate) fn rewrite_file_paths(code: &str, extractor: &CodeExtractor, params: &PathParameterization) -> String {
    static QUOTED_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"["']([^"']+)["']"#).unwrap());

    let ops = extractor.extract_file_operations(code);
    let read_literals: HashSet<&str> = ops.read_operations.iter().map(|o| o.file.as_str()).collect();
    let write_literals: HashSet<&str> = ops.write_operations.iter().map(|o| o.file.as_str()).collect();

    QUOTED_LITERAL
        .replace_all(code, |caps: &regex::Captures| {
            let literal = &caps[1];
            if read_literals.contains(literal) {
                if let Some(var) = params.read_map.get(literal) {
                    return var.clone();
                }
            }
            if write_literals.contains(literal) {
                if let Some(basename) = params.write_map.get(literal) {
                    return format!("os.path.join(output_dir, \"{basename}\")");
                }
            }
            caps[0].to_string()
        })
        .into_owned()
}

/// Builds the `argparse`-based header block for `Simple` mode: one
/// `--input-<stem>` flag per detected input category plus `--output-dir`,
/// variable bindings, and `output_dir` creation. Empty when the session
/// has no file operations to parameterize at all.
fn build_argparse_block(params: &PathParameterization) -> String {
    if !params.needs_cli_args() {
        return String::new();
    }

    let mut block = String::from("import argparse\nimport os\n\nparser = argparse.ArgumentParser(description=\"Workflow script\")\n");
    for (flag, var) in &params.header_args {
        block.push_str(&format!("parser.add_argument(\"{flag}\", type=str, required=True, dest=\"{var}\")\n"));
    }
    block.push_str("parser.add_argument(\"--output-dir\", type=str, default=\".\", dest=\"output_dir\")\n");
    block.push_str("args = parser.parse_args()\n\n");
    for (_, var) in &params.header_args {
        block.push_str(&format!("{var} = args.{var}\n"));
    }
    block.push_str("output_dir = args.output_dir\nos.makedirs(output_dir, exist_ok=True)\n");
    block
}

/// Drops whole-line comments from a raw session block before it is
/// spliced into generated code by forced inclusion; leaves inline
/// trailing comments alone since those sit on lines with real code.
fn strip_specific_comments(code: &str) -> String {
    code.lines().filter(|line| !line.trim_start().starts_with('#')).collect::<Vec<_>>().join("\n")
}

static MAIN_GUARD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?m)^if\s+__name__\s*==\s*["']__main__["']\s*:"#).unwrap());

/// Inserts a forced-inclusion block right before `if __name__ ==
/// "__main__":` when present, so it still runs as part of the script's
/// normal top-level flow; appends to the end otherwise.
fn splice_before_main_or_append(code: &str, block: &str) -> String {
    if let Some(m) = MAIN_GUARD_PATTERN.find(code) {
        let before = code[..m.start()].trim_end();
        let after = &code[m.start()..];
        format!("{before}\n\n{block}\n\n\n{after}")
    } else {
        format!("{}\n\n{block}\n", code.trim_end())
    }
}

/// Adds each of `imports` not already present verbatim in `code`, after
/// the last existing top-of-file import line (or at the top if there is
/// no import section), same placement rule as `Reconciler::apply_rule_based_fixes`.
fn insert_missing_imports(code: &str, imports: &[String]) -> String {
    let missing: Vec<&String> = imports.iter().filter(|imp| !code.contains(imp.as_str())).collect();
    if missing.is_empty() {
        return code.to_string();
    }

    let mut lines: Vec<String> = code.lines().map(String::from).collect();
    let mut import_section_end = None;
    for (i, line) in lines.iter().enumerate() {
        let stripped = line.trim();
        if stripped.starts_with("import ") || stripped.starts_with("from ") {
            import_section_end = Some(i + 1);
        } else if import_section_end.is_some() && !stripped.is_empty() && !stripped.starts_with('#') {
            break;
        }
    }
    let insert_pos = import_section_end.unwrap_or(0);
    for (offset, imp) in missing.into_iter().enumerate() {
        lines.insert(insert_pos + offset, imp.clone());
    }
    lines.join("\n")
}

/// Replaces hardcoded path literals with their bare filename so a raw
/// session block can be spliced into already-parameterized generated code
/// without dragging along an absolute, session-specific path. Only
/// touches string literals that look like a file path.
fn parameterize_file_paths(code: &str) -> String {
    static PATH_LITERAL: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#"["']([^"'\s]*[/\\][^"']*\.\w+)["']"#).unwrap());
    PATH_LITERAL
        .replace_all(code, |caps: &regex::Captures| {
            let path = &caps[1];
            let filename = Path::new(path).file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| path.to_string());
            format!("\"{filename}\"")
        })
        .into_owned()
}

fn extract_variable_definitions(code: &str) -> HashSet<String> {
    let Some(tree) = CodeExtractor::parse(code) else {
        return HashSet::new();
    };
    if tree.root_node().has_error() {
        return HashSet::new();
    }
    let mut cursor = QueryCursor::new();
    let mut names = HashSet::new();
    let mut matches = cursor.matches(&ASSIGN_TARGET_QUERY, tree.root_node(), code.as_bytes());
    while let Some(m) = matches.next() {
        for capture in m.captures {
            if let Ok(text) = capture.node.utf8_text(code.as_bytes()) {
                names.insert(text.to_string());
            }
        }
    }
    names
}

/// Approximates "read but not a definition target" by collecting every
/// identifier and letting the caller diff against `extract_variable_definitions`;
/// definition-site names end up in both sets, which only makes the
/// dependency back-fill slightly more conservative, never wrong in the
/// direction of silently dropping a real dependency.
fn extract_variable_usage(code: &str) -> HashSet<String> {
    let Some(tree) = CodeExtractor::parse(code) else {
        return HashSet::new();
    };
    if tree.root_node().has_error() {
        return HashSet::new();
    }
    let mut cursor = QueryCursor::new();
    let mut names = HashSet::new();
    let mut matches = cursor.matches(&IDENTIFIER_QUERY, tree.root_node(), code.as_bytes());
    while let Some(m) = matches.next() {
        for capture in m.captures {
            if let Ok(text) = capture.node.utf8_text(code.as_bytes()) {
                names.insert(text.to_string());
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(idx: usize, code: &str, success: bool, outputs: Vec<&str>) -> ExecutionEntry {
        ExecutionEntry::new(
            idx,
            code.to_string(),
            "ok".to_string(),
            success,
            vec![],
            outputs.into_iter().map(String::from).collect(),
            None,
        )
    }

    #[test]
    fn workflow_name_prefers_named_function() {
        let dir = tempfile::tempdir().unwrap();
        let saver = WorkflowSaver::new(dir.path().join("workflows"), None).unwrap();
        let executions = vec![entry(0, "def analyze_tumor_samples():\n    pass\n", true, vec![])];
        assert_eq!(saver.get_workflow_name(&executions), "Analyze Tumor Samples");
    }

    #[test]
    fn workflow_name_skips_generic_main() {
        let dir = tempfile::tempdir().unwrap();
        let saver = WorkflowSaver::new(dir.path().join("workflows"), None).unwrap();
        let executions = vec![entry(0, "def main():\n    pass\n", true, vec![])];
        assert!(saver.get_workflow_name(&executions).starts_with("workflow_"));
    }

    #[test]
    fn sanitize_filename_strips_punctuation() {
        let dir = tempfile::tempdir().unwrap();
        let saver = WorkflowSaver::new(dir.path().join("workflows"), None).unwrap();
        assert_eq!(saver.sanitize_filename("My Workflow!"), "My_Workflow");
    }

    #[test]
    fn save_workflow_simple_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let saver = WorkflowSaver::new(dir.path().join("workflows"), None).unwrap();
        let executions = vec![entry(0, "import pandas as pd\ndf = pd.DataFrame()\n", true, vec![])];
        let path = saver.save_workflow(&executions, SaveMode::Simple, Some("demo")).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn save_workflow_simple_pulls_in_failed_producer() {
        let dir = tempfile::tempdir().unwrap();
        let saver = WorkflowSaver::new(dir.path().join("workflows"), None).unwrap();
        let executions = vec![
            entry(0, "df.to_csv('intermediate.csv')", false, vec!["intermediate.csv"]),
            entry(1, "df2 = pd.read_csv('intermediate.csv')", true, vec![]),
        ];
        let path = saver.save_workflow(&executions, SaveMode::Simple, Some("demo")).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("intermediate.csv"));
    }

    #[test]
    fn save_workflow_notebook_rejects_empty_session() {
        let dir = tempfile::tempdir().unwrap();
        let saver = WorkflowSaver::new(dir.path().join("workflows"), None).unwrap();
        let result = saver.save_workflow(&[], SaveMode::Notebook, None);
        assert!(result.is_err());
    }

    #[test]
    fn save_and_validate_skips_validation_for_notebook_mode() {
        let dir = tempfile::tempdir().unwrap();
        let saver = WorkflowSaver::new(dir.path().join("workflows"), None).unwrap();
        let validator = crate::validator::WorkflowValidator::new(dir.path().to_path_buf());
        let executions = vec![entry(0, "x = 1\n", true, vec![])];
        let path = saver
            .save_and_validate_workflow(
                &executions,
                SaveMode::Notebook,
                Some("demo"),
                &[],
                &HashMap::new(),
                Some(&validator),
                None,
                1,
            )
            .unwrap();
        assert!(path.to_string_lossy().ends_with(".ipynb"));
    }

    #[test]
    fn save_and_validate_finalizes_immediately_without_expected_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let saver = WorkflowSaver::new(dir.path().join("workflows"), None).unwrap();
        let validator = crate::validator::WorkflowValidator::new(dir.path().to_path_buf());
        let executions = vec![entry(0, "x = 1\n", true, vec![])];
        let path = saver
            .save_and_validate_workflow(
                &executions,
                SaveMode::Simple,
                Some("demo"),
                &[],
                &HashMap::new(),
                Some(&validator),
                None,
                1,
            )
            .unwrap();
        assert!(!path.to_string_lossy().contains(".tmp"));
        assert!(path.exists());
    }

    #[test]
    fn save_and_validate_finalizes_on_successful_revalidation() {
        let dir = tempfile::tempdir().unwrap();
        let saver = WorkflowSaver::new(dir.path().join("workflows"), None).unwrap();
        let validator = crate::validator::WorkflowValidator::new(dir.path().to_path_buf());
        let executions = vec![entry(0, "with open('out.txt', 'w') as f:\n    f.write('hi')\n", true, vec![])];
        let mut expected = HashMap::new();
        expected.insert("out.txt".to_string(), b"hi".to_vec());

        let path = saver
            .save_and_validate_workflow(
                &executions,
                SaveMode::Simple,
                Some("demo"),
                &[],
                &expected,
                Some(&validator),
                None,
                1,
            )
            .unwrap();
        assert!(!path.to_string_lossy().contains(".tmp"));
    }

    #[test]
    fn save_workflow_simple_builds_input_argparse_and_rewrites_output() {
        let dir = tempfile::tempdir().unwrap();
        let saver = WorkflowSaver::new(dir.path().join("workflows"), None).unwrap();
        let executions = vec![entry(
            0,
            "import pandas as pd\ndf = pd.read_csv('input.csv')\ndf[df.value > 0].to_csv('filtered.csv', index=False)\n",
            true,
            vec!["filtered.csv"],
        )];
        let path = saver.save_workflow(&executions, SaveMode::Simple, Some("demo")).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("--input-input"));
        assert!(content.contains("input_input"));
        assert!(content.contains("os.path.join(output_dir, \"filtered.csv\")"));
    }

    /// Always returns the next response in sequence (falling back to the
    /// last once exhausted), so a test can script what each retry attempt
    /// sees without depending on prompt text.
    struct SequencedClient {
        responses: Vec<&'static str>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl crate::llm::LlmClient for SequencedClient {
        fn invoke(&self, _prompt: &str) -> Result<String> {
            let i = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let response = self.responses.get(i).copied().unwrap_or_else(|| *self.responses.last().unwrap());
            Ok(response.to_string())
        }
    }

    #[test]
    fn llm_mode_retry_loop_picks_up_missing_output_on_second_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let client = SequencedClient {
            responses: vec![
                "```python\ndf.to_csv('a.csv')\n```",
                "```python\ndf.to_csv('a.csv')\nplt.savefig('b.png')\n```",
            ],
            calls: std::sync::atomic::AtomicUsize::new(0),
        };
        let llm = crate::llm::WorkflowLlmProcessor::new(Box::new(client));
        let saver = WorkflowSaver::new(dir.path().join("workflows"), Some(llm)).unwrap();
        let executions = vec![
            entry(0, "df.to_csv('a.csv')", true, vec!["a.csv"]),
            entry(1, "import matplotlib.pyplot as plt\nplt.savefig('b.png')", true, vec!["b.png"]),
        ];
        let path = saver.save_workflow(&executions, SaveMode::Llm, Some("demo")).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("a.csv"));
        assert!(content.contains("b.png"));
    }

    #[test]
    fn llm_mode_forced_inclusion_splices_producer_after_retries_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let client = SequencedClient {
            responses: vec!["```python\ndf.to_csv('a.csv')\n```"; 5],
            calls: std::sync::atomic::AtomicUsize::new(0),
        };
        let llm = crate::llm::WorkflowLlmProcessor::new(Box::new(client));
        let saver = WorkflowSaver::new(dir.path().join("workflows"), Some(llm)).unwrap().with_max_retries(5);
        let executions = vec![
            entry(0, "df.to_csv('a.csv')", true, vec!["a.csv"]),
            entry(1, "import matplotlib.pyplot as plt\nplt.savefig('b.png')", true, vec!["b.png"]),
        ];
        let path = saver.save_workflow(&executions, SaveMode::Llm, Some("demo")).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("savefig"));
        assert!(content.contains("b.png"));
    }

    #[test]
    fn save_and_validate_leaves_tmp_file_when_unrepairable() {
        let dir = tempfile::tempdir().unwrap();
        let saver = WorkflowSaver::new(dir.path().join("workflows"), None).unwrap();
        let validator = crate::validator::WorkflowValidator::new(dir.path().to_path_buf());
        let executions = vec![entry(0, "x = 1\n", true, vec![])];
        let mut expected = HashMap::new();
        expected.insert("missing.txt".to_string(), b"hi".to_vec());

        let result = saver.save_and_validate_workflow(
            &executions,
            SaveMode::Simple,
            Some("demo"),
            &[],
            &expected,
            Some(&validator),
            None,
            1,
        );
        assert!(result.is_err());
        let tmp_files: Vec<_> = std::fs::read_dir(dir.path().join("workflows"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp.py"))
            .collect();
        assert_eq!(tmp_files.len(), 1);
    }
}
