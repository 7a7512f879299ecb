// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

//! Re-executes a saved artifact in an isolated temp workspace and compares
//! its outputs byte-for-byte (hash-for-hash above the large-file
//! threshold) against what the session actually produced. See spec.md §4.9.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

const DEFAULT_TIMEOUT_SECS: u64 = 300;
const MAX_IN_MEMORY_SIZE: u64 = 100 * 1024 * 1024;

static COMMON_OUTPUT_EXTENSIONS: &[&str] = &[
    "csv", "tsv", "xlsx", "xls", "json", "txt", "png", "jpg", "jpeg", "pdf", "svg", "pkl",
    "pickle", "h5", "hdf5", "parquet", "feather",
];

static ADD_ARGUMENT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"add_argument\(["']([^"']+)["']"#).unwrap());

/// Either the raw bytes of a small file or the SHA-256 hex digest of a
/// large one; `compare_outputs` normalizes whichever side it is handed.
#[derive(Debug, Clone)]
pub enum FileContent {
    Bytes(Vec<u8>),
    Hash(String),
}

#[derive(Debug, Clone)]
pub struct FileComparison {
    pub matches: bool,
    pub diff: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ComparisonReport {
    pub all_match: bool,
    pub file_comparisons: HashMap<String, FileComparison>,
    pub differences: Vec<String>,
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub valid: bool,
    pub comparison: Option<ComparisonReport>,
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

pub struct WorkflowValidator {
    work_dir: PathBuf,
    timeout: Duration,
}

impl WorkflowValidator {
    pub fn new(work_dir: PathBuf) -> Self {
        WorkflowValidator { work_dir, timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS) }
    }

    pub fn with_timeout(work_dir: PathBuf, timeout: Duration) -> Self {
        WorkflowValidator { work_dir, timeout }
    }

    /// Runs the artifact against copies of `original_input_files` in a
    /// fresh temp workspace and compares its outputs against
    /// `expected_output_files`. The temp directory is always removed,
    /// even on an early return, via the guard in `run_and_collect`.
    pub fn validate_workflow(
        &self,
        workflow_path: &Path,
        original_input_files: &[String],
        expected_output_files: &HashMap<String, Vec<u8>>,
    ) -> ValidationReport {
        let temp_dir = self.work_dir.join("workflow_validation_temp");
        let result = self.run_and_collect(&temp_dir, workflow_path, original_input_files, expected_output_files);
        let _ = std::fs::remove_dir_all(&temp_dir);
        result
    }

    fn run_and_collect(
        &self,
        temp_dir: &Path,
        workflow_path: &Path,
        original_input_files: &[String],
        expected_output_files: &HashMap<String, Vec<u8>>,
    ) -> ValidationReport {
        let exec_dir = temp_dir.join("execution");
        if let Err(e) = std::fs::create_dir_all(&exec_dir) {
            return ValidationReport {
                valid: false,
                comparison: None,
                error: Some(format!("could not create validation workspace: {e}")),
                stdout: String::new(),
                stderr: String::new(),
            };
        }

        let mut copied_filenames: HashSet<String> = HashSet::new();
        let mut copied_paths: Vec<PathBuf> = Vec::new();
        for input in original_input_files {
            let src = Path::new(input);
            if !src.exists() {
                continue;
            }
            if let Some(name) = src.file_name() {
                let dst = exec_dir.join(name);
                if std::fs::copy(src, &dst).is_ok() {
                    copied_filenames.insert(name.to_string_lossy().to_string());
                    copied_paths.push(dst);
                }
            }
        }

        let script_content = std::fs::read_to_string(workflow_path).unwrap_or_default();
        let args = Self::determine_script_arguments(&script_content, &copied_paths, expected_output_files);

        let mut command = Command::new("python3");
        command
            .arg(workflow_path)
            .args(&args)
            .current_dir(&exec_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ValidationReport {
                    valid: false,
                    comparison: None,
                    error: Some(format!("failed to launch python3: {e}")),
                    stdout: String::new(),
                    stderr: String::new(),
                };
            }
        };

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return ValidationReport {
                    valid: false,
                    comparison: None,
                    error: Some("Timeout".to_string()),
                    stdout: String::new(),
                    stderr: "workflow execution timed out".to_string(),
                };
            }
            Err(e) => {
                return ValidationReport {
                    valid: false,
                    comparison: None,
                    error: Some(e.to_string()),
                    stdout: String::new(),
                    stderr: String::new(),
                };
            }
        };

        let output = child.wait_with_output().unwrap_or_else(|_| std::process::Output {
            status,
            stdout: Vec::new(),
            stderr: Vec::new(),
        });
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !status.success() {
            return ValidationReport {
                valid: false,
                comparison: None,
                error: Some(stderr.clone()),
                stdout,
                stderr,
            };
        }

        let allowed_extensions = Self::allowed_extensions(expected_output_files);
        let actual = Self::collect_output_files(&exec_dir, &allowed_extensions, &copied_filenames);
        let comparison = Self::compare_outputs(&actual, expected_output_files);

        ValidationReport { valid: comparison.all_match, comparison: Some(comparison), error: None, stdout, stderr }
    }

    fn collect_output_files(
        exec_dir: &Path,
        allowed_extensions: &HashSet<String>,
        copied_filenames: &HashSet<String>,
    ) -> HashMap<String, FileContent> {
        let mut output_files = HashMap::new();
        let walker = walkdir::WalkDir::new(exec_dir).into_iter().filter_map(|e| e.ok());
        for entry in walker {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_lowercase()) else {
                continue;
            };
            if !allowed_extensions.contains(&ext) {
                continue;
            }
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if copied_filenames.contains(&name) {
                continue;
            }

            let Ok(metadata) = path.metadata() else { continue };
            let content = if metadata.len() > MAX_IN_MEMORY_SIZE {
                match Self::compute_file_hash(path) {
                    Ok(hash) => FileContent::Hash(hash),
                    Err(_) => continue,
                }
            } else {
                match std::fs::read(path) {
                    Ok(bytes) => FileContent::Bytes(bytes),
                    Err(_) => continue,
                }
            };
            output_files.insert(path.to_string_lossy().to_string(), content);
        }
        output_files
    }

    fn compute_file_hash(path: &Path) -> std::io::Result<String> {
        let bytes = std::fs::read(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn allowed_extensions(expected_output_files: &HashMap<String, Vec<u8>>) -> HashSet<String> {
        let mut extensions: HashSet<String> =
            COMMON_OUTPUT_EXTENSIONS.iter().map(|s| s.to_string()).collect();
        for path in expected_output_files.keys() {
            if let Some(ext) = Path::new(path).extension().map(|e| e.to_string_lossy().to_lowercase()) {
                extensions.insert(ext);
            }
        }
        extensions
    }

    /// Compares each expected file (located in `actual` by basename) and
    /// flags anything in `actual` with no expected counterpart without
    /// failing validation over it.
    pub fn compare_outputs(
        actual: &HashMap<String, FileContent>,
        expected: &HashMap<String, Vec<u8>>,
    ) -> ComparisonReport {
        let mut file_comparisons = HashMap::new();
        let mut differences = Vec::new();
        let mut all_match = true;

        for (expected_path, expected_content) in expected {
            let expected_filename =
                Path::new(expected_path).file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();

            let found = actual
                .iter()
                .find(|(actual_path, _)| {
                    Path::new(actual_path).file_name().map(|n| n.to_string_lossy().to_string())
                        == Some(expected_filename.clone())
                })
                .map(|(_, content)| content);

            match found {
                None => {
                    file_comparisons.insert(
                        expected_path.clone(),
                        FileComparison { matches: false, diff: Some("File not generated by workflow".to_string()) },
                    );
                    differences.push(format!("Missing file: {expected_filename}"));
                    all_match = false;
                }
                Some(actual_content) => {
                    let (matches, diff) = Self::compare_one(actual_content, expected_content);
                    if !matches {
                        differences.push(format!("File differs: {expected_filename}"));
                        all_match = false;
                    }
                    file_comparisons.insert(expected_path.clone(), FileComparison { matches, diff });
                }
            }
        }

        let expected_filenames: HashSet<String> =
            expected.keys().filter_map(|p| Path::new(p).file_name().map(|n| n.to_string_lossy().to_string())).collect();
        for actual_path in actual.keys() {
            let filename = Path::new(actual_path).file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            if !expected_filenames.contains(&filename) {
                differences.push(format!("Extra file generated: {filename}"));
            }
        }

        let summary = if all_match {
            "All files match".to_string()
        } else {
            format!("{} difference(s) found", differences.len())
        };

        ComparisonReport { all_match, file_comparisons, differences, summary }
    }

    fn compare_one(actual: &FileContent, expected: &[u8]) -> (bool, Option<String>) {
        match actual {
            FileContent::Bytes(actual_bytes) => {
                if expected.len() as u64 > MAX_IN_MEMORY_SIZE {
                    let expected_hash = Self::hash_bytes(expected);
                    let actual_hash = Self::hash_bytes(actual_bytes);
                    if expected_hash == actual_hash {
                        (true, None)
                    } else {
                        (false, Some("File hash differs (large file comparison)".to_string()))
                    }
                } else if actual_bytes.as_slice() == expected {
                    (true, None)
                } else {
                    (false, Some(Self::compute_diff(actual_bytes, expected)))
                }
            }
            FileContent::Hash(actual_hash) => {
                let expected_hash = Self::hash_bytes(expected);
                if *actual_hash == expected_hash {
                    (true, None)
                } else {
                    (false, Some("File hash differs (large file comparison)".to_string()))
                }
            }
        }
    }

    fn hash_bytes(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    fn compute_diff(actual: &[u8], expected: &[u8]) -> String {
        if actual.len() != expected.len() {
            return format!("Size difference: actual={} bytes, expected={} bytes", actual.len(), expected.len());
        }
        for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
            if a != e {
                return format!("First difference at byte {i}: actual=0x{a:02x}, expected=0x{e:02x}");
            }
        }
        "Files differ but same size".to_string()
    }

    /// Detects argparse usage via `add_argument(...)` calls and maps the
    /// discovered flag names to input/output-csv/output-plot roles by
    /// substring, falling back to `--input` per file when argparse is
    /// present but no role could be mapped. When no argparse is detected at
    /// all, inputs are passed positionally rather than as flags the script
    /// has no parser to read.
    fn determine_script_arguments(
        script_content: &str,
        input_files: &[PathBuf],
        expected_output_files: &HashMap<String, Vec<u8>>,
    ) -> Vec<String> {
        let has_argparse = script_content.contains("argparse") || script_content.contains("ArgumentParser");

        if has_argparse {
            let mut input_arg = None;
            let mut output_csv_arg = None;
            let mut output_plot_arg = None;

            for caps in ADD_ARGUMENT_PATTERN.captures_iter(script_content) {
                let arg = &caps[1];
                let lower = arg.to_lowercase();
                if lower.contains("input") && input_arg.is_none() {
                    input_arg = Some(arg.to_string());
                } else if lower.contains("output") && (lower.contains("csv") || lower.contains("result")) {
                    output_csv_arg.get_or_insert_with(|| arg.to_string());
                } else if lower.contains("output")
                    && (lower.contains("plot") || lower.contains("png") || lower.contains("figure"))
                {
                    output_plot_arg.get_or_insert_with(|| arg.to_string());
                }
            }

            let mut args = Vec::new();
            if let Some(input_arg) = &input_arg {
                for input_file in input_files {
                    args.push(input_arg.clone());
                    args.push(input_file.to_string_lossy().to_string());
                }
            }
            for output_path in expected_output_files.keys() {
                let filename = Path::new(output_path).file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
                if filename.ends_with(".csv") {
                    if let Some(arg) = &output_csv_arg {
                        args.push(arg.clone());
                        args.push(filename);
                        continue;
                    }
                }
                if filename.ends_with(".png") || filename.ends_with(".jpg") || filename.ends_with(".jpeg") {
                    if let Some(arg) = &output_plot_arg {
                        args.push(arg.clone());
                        args.push(filename);
                    }
                }
            }

            if !args.is_empty() {
                return args;
            }

            let mut fallback = Vec::new();
            for input_file in input_files {
                fallback.push("--input".to_string());
                fallback.push(input_file.to_string_lossy().to_string());
            }
            return fallback;
        }

        input_files.iter().map(|p| p.to_string_lossy().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_outputs_reports_missing_file() {
        let actual = HashMap::new();
        let mut expected = HashMap::new();
        expected.insert("a.csv".to_string(), b"x".to_vec());
        let report = WorkflowValidator::compare_outputs(&actual, &expected);
        assert!(!report.all_match);
        assert!(report.differences.iter().any(|d| d.contains("Missing file")));
    }

    #[test]
    fn compare_outputs_matches_identical_bytes() {
        let mut actual = HashMap::new();
        actual.insert("/tmp/a.csv".to_string(), FileContent::Bytes(b"x".to_vec()));
        let mut expected = HashMap::new();
        expected.insert("a.csv".to_string(), b"x".to_vec());
        let report = WorkflowValidator::compare_outputs(&actual, &expected);
        assert!(report.all_match);
    }

    #[test]
    fn compare_outputs_flags_extra_files_without_failing() {
        let mut actual = HashMap::new();
        actual.insert("/tmp/a.csv".to_string(), FileContent::Bytes(b"x".to_vec()));
        actual.insert("/tmp/b.csv".to_string(), FileContent::Bytes(b"y".to_vec()));
        let mut expected = HashMap::new();
        expected.insert("a.csv".to_string(), b"x".to_vec());
        let report = WorkflowValidator::compare_outputs(&actual, &expected);
        assert!(report.all_match);
        assert!(report.differences.iter().any(|d| d.contains("Extra file")));
    }

    #[test]
    fn determine_script_arguments_maps_input_flag() {
        let script = "import argparse\np = argparse.ArgumentParser()\np.add_argument('--input_file')\n";
        let args = WorkflowValidator::determine_script_arguments(
            script,
            &[PathBuf::from("/tmp/x.csv")],
            &HashMap::new(),
        );
        assert_eq!(args, vec!["--input_file".to_string(), "/tmp/x.csv".to_string()]);
    }

    #[test]
    fn determine_script_arguments_falls_back_to_positional_without_argparse() {
        let args = WorkflowValidator::determine_script_arguments("print('hi')", &[PathBuf::from("/tmp/x.csv")], &HashMap::new());
        assert_eq!(args, vec!["/tmp/x.csv".to_string()]);
    }

    #[test]
    fn validate_workflow_cleans_up_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("wf.py");
        std::fs::write(&script, "print('hello')\n").unwrap();
        let validator = WorkflowValidator::new(dir.path().to_path_buf());
        let _ = validator.validate_workflow(&script, &[], &HashMap::new());
        assert!(!dir.path().join("workflow_validation_temp").exists());
    }
}
