// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

//! Append-only execution journal. See spec.md §4.3.

use crate::entry::{ExecutionEntry, PersistedEntry, RESULT_TRUNCATE_LENGTH};
use crate::error::{Result, WorkflowError};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

static INPUT_FILE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"pd\.read_csv\(["']([^"']+)["']"#).unwrap(),
        Regex::new(r#"pd\.read_excel\(["']([^"']+)["']"#).unwrap(),
        Regex::new(r#"open\(["']([^"']+)["']"#).unwrap(),
        Regex::new(r#"with open\(["']([^"']+)["']"#).unwrap(),
        Regex::new(r#"np\.load\(["']([^"']+)["']"#).unwrap(),
        Regex::new(r#"pickle\.load\(open\(["']([^"']+)["']"#).unwrap(),
    ]
});

static EXCLUDED_OUTPUT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"__pycache__").unwrap(),
        Regex::new(r"\.pyc$").unwrap(),
        Regex::new(r"\.pyo$").unwrap(),
        Regex::new(r"\.pytest_cache").unwrap(),
        Regex::new(r"\.ipynb_checkpoints").unwrap(),
    ]
});

pub struct WorkflowTracker {
    pub execution_history: Vec<ExecutionEntry>,
    all_input_files: HashSet<String>,
    all_output_files: HashSet<String>,
    pub work_dir: Option<PathBuf>,
    pub execute_blocks_dir: Option<PathBuf>,
    pub session_start_time: DateTime<Utc>,
}

impl WorkflowTracker {
    pub fn new(work_dir: Option<PathBuf>) -> Result<Self> {
        let execute_blocks_dir = match &work_dir {
            Some(dir) => {
                let workflows_root = dir
                    .parent()
                    .map(|p| p.join("workflows"))
                    .unwrap_or_else(|| dir.join("workflows"));
                let blocks_dir = workflows_root.join("execute_blocks");
                std::fs::create_dir_all(&blocks_dir)?;
                Some(blocks_dir)
            }
            None => None,
        };

        Ok(WorkflowTracker {
            execution_history: Vec::new(),
            all_input_files: HashSet::new(),
            all_output_files: HashSet::new(),
            work_dir,
            execute_blocks_dir,
            session_start_time: Utc::now(),
        })
    }

    /// Appends an entry to in-memory history and, if configured, mirrors it
    /// to `<workflows_root>/execute_blocks/` as JSON + a `.py` sidecar.
    /// Returns the path of the saved JSON file.
    pub fn track_execution(
        &mut self,
        code: String,
        result: String,
        success: bool,
        input_files: Vec<String>,
        output_files: Vec<String>,
        error_type: Option<String>,
    ) -> Result<Option<PathBuf>> {
        let index = self.execution_history.len();
        let entry = ExecutionEntry::new(
            index,
            code,
            result,
            success,
            input_files,
            output_files,
            error_type,
        );

        self.all_input_files.extend(entry.input_files.iter().cloned());
        self.all_output_files.extend(entry.output_files.iter().cloned());

        let saved_path = self.save_execute_block(&entry)?;
        self.execution_history.push(entry);
        Ok(saved_path)
    }

    fn save_execute_block(&self, entry: &ExecutionEntry) -> Result<Option<PathBuf>> {
        let Some(blocks_dir) = &self.execute_blocks_dir else {
            return Ok(None);
        };

        let timestamp_str = entry.timestamp.format("%Y%m%d_%H%M%S_%f").to_string();
        let filename = format!("execute_{timestamp_str}_{:04}.json", entry.execution_index);
        let json_path = blocks_dir.join(&filename);

        let persisted = PersistedEntry::from(entry);
        let json_text = serde_json::to_string_pretty(&persisted)
            .map_err(|e| WorkflowError::JournalDecode { path: json_path.clone(), source: e })?;
        std::fs::write(&json_path, json_text)
            .map_err(|e| WorkflowError::JournalWrite { path: json_path.clone(), source: e })?;

        let code_filename = format!("execute_{timestamp_str}_{:04}.py", entry.execution_index);
        let code_path = blocks_dir.join(code_filename);
        let mut sidecar = String::new();
        sidecar.push_str(&format!("# Execute block #{}\n", entry.execution_index));
        sidecar.push_str(&format!("# Timestamp: {}\n", entry.timestamp.to_rfc3339()));
        sidecar.push_str(&format!("# Success: {}\n", entry.success));
        if let Some(err) = &entry.error_type {
            sidecar.push_str(&format!("# Error Type: {err}\n"));
        }
        sidecar.push_str(&format!(
            "# Input files: {}\n",
            if entry.input_files.is_empty() { "None".to_string() } else { entry.input_files.join(", ") }
        ));
        sidecar.push_str(&format!(
            "# Output files: {}\n",
            if entry.output_files.is_empty() { "None".to_string() } else { entry.output_files.join(", ") }
        ));
        sidecar.push('\n');
        sidecar.push_str(&"=".repeat(80));
        sidecar.push_str("\n\n");
        sidecar.push_str(&entry.code);

        std::fs::write(&code_path, sidecar)
            .map_err(|e| WorkflowError::JournalWrite { path: code_path, source: e })?;

        Ok(Some(json_path))
    }

    pub fn get_successful_executions(&self) -> Vec<&ExecutionEntry> {
        self.execution_history.iter().filter(|e| e.success).collect()
    }

    pub fn get_output_files(&self) -> Vec<String> {
        self.all_output_files.iter().cloned().collect()
    }

    pub fn get_input_files(&self) -> Vec<String> {
        self.all_input_files.iter().cloned().collect()
    }

    /// Reads the current on-disk bytes of every tracked output file, for
    /// handing to `WorkflowValidator::validate_workflow`. Files that have
    /// since been deleted or moved are silently skipped rather than
    /// erroring — a possibly empty map signals "nothing left to validate
    /// against" to the caller.
    pub fn get_expected_output_files(&self) -> std::collections::HashMap<String, Vec<u8>> {
        self.all_output_files
            .iter()
            .filter_map(|path| std::fs::read(path).ok().map(|bytes| (path.clone(), bytes)))
            .collect()
    }

    pub fn clear(&mut self) {
        self.execution_history.clear();
        self.all_input_files.clear();
        self.all_output_files.clear();
    }

    /// Statically infers read-call arguments via regex; a file is included
    /// only if it actually exists under `work_dir` at call time.
    pub fn extract_input_files_from_code(code: &str, work_dir: &Path) -> Vec<String> {
        let mut files = HashSet::new();
        for pattern in INPUT_FILE_PATTERNS.iter() {
            for m in pattern.captures_iter(code) {
                let raw = m.get(1).unwrap().as_str();
                let candidate = Path::new(raw);
                let resolved = if candidate.is_absolute() {
                    candidate.to_path_buf()
                } else {
                    work_dir.join(candidate)
                };
                if resolved.exists() {
                    if let Ok(canon) = resolved.canonicalize() {
                        files.insert(canon.to_string_lossy().to_string());
                    } else {
                        files.insert(resolved.to_string_lossy().to_string());
                    }
                }
            }
        }
        files.into_iter().collect()
    }

    /// Returns files newly present under `work_dir` after a block ran,
    /// excluding cache/temp directories.
    pub fn extract_output_files_from_result(
        files_before: &HashSet<PathBuf>,
        files_after: &HashSet<PathBuf>,
        work_dir: &Path,
    ) -> Vec<String> {
        let work_dir_canon = work_dir.canonicalize().unwrap_or_else(|_| work_dir.to_path_buf());
        let mut outputs = HashSet::new();

        for candidate in files_after.difference(files_before) {
            if !candidate.is_file() {
                continue;
            }
            let path_str = candidate.to_string_lossy();
            if EXCLUDED_OUTPUT_PATTERNS.iter().any(|p| p.is_match(&path_str)) {
                continue;
            }
            let Ok(resolved) = candidate.canonicalize() else {
                continue;
            };
            if resolved.starts_with(&work_dir_canon) {
                outputs.insert(resolved.to_string_lossy().to_string());
            }
        }
        outputs.into_iter().collect()
    }

    /// Reads all `execute_*.json` files from the journal directory,
    /// optionally restricted to this tracker's session, and returns them
    /// ordered by persisted timestamp. Per-file errors are swallowed: a
    /// corrupt entry is dropped, not fatal.
    pub fn load_execute_blocks_from_files(&self, filter_by_session: bool) -> Vec<ExecutionEntry> {
        let Some(blocks_dir) = &self.execute_blocks_dir else {
            return Vec::new();
        };
        load_execute_blocks(blocks_dir, if filter_by_session { Some(self.session_start_time) } else { None })
    }
}

/// Standalone so reconstruction can happen without a live tracker (the
/// service facade's "reconstruct from on-disk journal" entry point).
pub fn load_execute_blocks(
    blocks_dir: &Path,
    session_start_time: Option<DateTime<Utc>>,
) -> Vec<ExecutionEntry> {
    let Ok(read_dir) = std::fs::read_dir(blocks_dir) else {
        return Vec::new();
    };

    let mut json_paths: Vec<PathBuf> = read_dir
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension().map(|ext| ext == "json").unwrap_or(false)
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("execute_"))
                    .unwrap_or(false)
        })
        .collect();
    json_paths.sort();

    if let Some(session_start) = session_start_time {
        let session_prefix = session_start.format("%Y%m%d_%H%M%S").to_string();
        json_paths.retain(|p| is_file_from_session(p, &session_prefix));
    }

    let mut entries: Vec<ExecutionEntry> = Vec::new();
    for path in json_paths {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Ok(persisted) = serde_json::from_str::<PersistedEntry>(&content) else {
            continue;
        };
        entries.push(persisted.into());
    }

    entries.sort_by_key(|e| e.timestamp);
    entries
}

/// Fail-open per spec.md §4.3: if the filename can't be parsed as a
/// `execute_YYYYMMDD_HHMMSS_micros_NNNN` stem, the file is included rather
/// than dropped.
fn is_file_from_session(path: &Path, session_prefix: &str) -> bool {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return true;
    };
    let Some(rest) = stem.strip_prefix("execute_") else {
        return true;
    };
    let parts: Vec<&str> = rest.split('_').collect();
    if parts.len() < 2 {
        return true;
    }
    let file_date_time = format!("{}_{}", parts[0], parts[1]);
    file_date_time.as_str() >= session_prefix
}

#[allow(dead_code)]
pub const _RESULT_TRUNCATE_LENGTH: usize = RESULT_TRUNCATE_LENGTH;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_in_memory_without_work_dir() {
        let mut tracker = WorkflowTracker::new(None).unwrap();
        tracker
            .track_execution("x = 1".into(), "ok".into(), true, vec![], vec![], None)
            .unwrap();
        assert_eq!(tracker.execution_history.len(), 1);
        assert_eq!(tracker.execution_history[0].execution_index, 0);
    }

    #[test]
    fn persists_json_and_py_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("work");
        std::fs::create_dir_all(&work_dir).unwrap();
        let mut tracker = WorkflowTracker::new(Some(work_dir)).unwrap();
        let saved = tracker
            .track_execution(
                "df = 1".into(),
                "ok".into(),
                true,
                vec![],
                vec!["out.csv".into()],
                None,
            )
            .unwrap()
            .unwrap();
        assert!(saved.exists());
        let py_sidecar = saved.with_extension("py");
        assert!(py_sidecar.exists());
        let sidecar_text = std::fs::read_to_string(py_sidecar).unwrap();
        assert!(sidecar_text.contains("# Execute block #0"));
        assert!(sidecar_text.contains("df = 1"));
    }

    #[test]
    fn truncates_persisted_result_but_keeps_full_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("work");
        std::fs::create_dir_all(&work_dir).unwrap();
        let mut tracker = WorkflowTracker::new(Some(work_dir)).unwrap();
        let long_result = "y".repeat(RESULT_TRUNCATE_LENGTH + 200);
        tracker
            .track_execution("pass".into(), long_result.clone(), true, vec![], vec![], None)
            .unwrap();
        assert_eq!(tracker.execution_history[0].result.len(), long_result.len());

        let loaded = tracker.load_execute_blocks_from_files(false);
        assert_eq!(loaded[0].result.len(), RESULT_TRUNCATE_LENGTH);
    }

    #[test]
    fn load_execute_blocks_restores_order_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("work");
        std::fs::create_dir_all(&work_dir).unwrap();
        let mut tracker = WorkflowTracker::new(Some(work_dir)).unwrap();
        for i in 0..3 {
            tracker
                .track_execution(format!("x = {i}"), "ok".into(), true, vec![], vec![], None)
                .unwrap();
        }
        let loaded = tracker.load_execute_blocks_from_files(true);
        assert_eq!(loaded.len(), 3);
        for i in 0..3 {
            assert_eq!(loaded[i].execution_index, i);
        }
    }

    #[test]
    fn corrupt_journal_entry_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocks_dir = dir.path().join("execute_blocks");
        std::fs::create_dir_all(&blocks_dir).unwrap();
        std::fs::write(blocks_dir.join("execute_20250101_000000_000000_0000.json"), "{not json").unwrap();
        let entries = load_execute_blocks(&blocks_dir, None);
        assert!(entries.is_empty());
    }

    #[test]
    fn unparseable_filename_is_included_fail_open() {
        let dir = tempfile::tempdir().unwrap();
        let blocks_dir = dir.path().join("execute_blocks");
        std::fs::create_dir_all(&blocks_dir).unwrap();
        let persisted = PersistedEntry::from(&ExecutionEntry::new(0, "x".into(), "ok".into(), true, vec![], vec![], None));
        let json = serde_json::to_string(&persisted).unwrap();
        std::fs::write(blocks_dir.join("execute_weird.json"), json).unwrap();
        let entries = load_execute_blocks(&blocks_dir, Some(Utc::now()));
        assert_eq!(entries.len(), 1);
    }
}
