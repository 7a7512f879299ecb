// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

//! Data model: `ExecutionEntry`, `Session`. See spec.md §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const RESULT_TRUNCATE_LENGTH: usize = 10_000;

/// One recorded code block. Immutable once created; see spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionEntry {
    pub execution_index: usize,
    pub code: String,
    pub result: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub error_type: Option<String>,
    pub input_files: Vec<String>,
    pub output_files: Vec<String>,
}

impl ExecutionEntry {
    pub fn new(
        execution_index: usize,
        code: String,
        result: String,
        success: bool,
        input_files: Vec<String>,
        output_files: Vec<String>,
        error_type: Option<String>,
    ) -> Self {
        ExecutionEntry {
            execution_index,
            code,
            result,
            success,
            timestamp: Utc::now(),
            error_type,
            input_files,
            output_files,
        }
    }

    /// Result text truncated to `RESULT_TRUNCATE_LENGTH` chars, the form
    /// persisted to disk. The in-memory copy keeps the full value.
    pub fn truncated_result(&self) -> &str {
        match self.result.char_indices().nth(RESULT_TRUNCATE_LENGTH) {
            Some((byte_idx, _)) => &self.result[..byte_idx],
            None => &self.result,
        }
    }

    pub fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            code_length: self.code.len(),
            has_error: !self.success,
            num_input_files: self.input_files.len(),
            num_output_files: self.output_files.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryMetadata {
    pub code_length: usize,
    pub has_error: bool,
    pub num_input_files: usize,
    pub num_output_files: usize,
}

/// On-disk JSON schema for an execute block, per spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub execution_index: usize,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error_type: Option<String>,
    pub code: String,
    pub result: String,
    pub result_length: usize,
    pub input_files: Vec<String>,
    pub output_files: Vec<String>,
    pub metadata: EntryMetadata,
}

impl From<&ExecutionEntry> for PersistedEntry {
    fn from(entry: &ExecutionEntry) -> Self {
        let truncated = entry.truncated_result().to_string();
        PersistedEntry {
            execution_index: entry.execution_index,
            timestamp: entry.timestamp,
            success: entry.success,
            error_type: entry.error_type.clone(),
            code: entry.code.clone(),
            result_length: truncated.len(),
            result: truncated,
            input_files: entry.input_files.clone(),
            output_files: entry.output_files.clone(),
            metadata: entry.metadata(),
        }
    }
}

impl From<PersistedEntry> for ExecutionEntry {
    fn from(p: PersistedEntry) -> Self {
        ExecutionEntry {
            execution_index: p.execution_index,
            code: p.code,
            result: p.result,
            success: p.success,
            timestamp: p.timestamp,
            error_type: p.error_type,
            input_files: p.input_files,
            output_files: p.output_files,
        }
    }
}

/// A logical grouping of `ExecutionEntry`s bounded by `session_start_time`.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_start_time: DateTime<Utc>,
    pub entries: Vec<ExecutionEntry>,
}

impl Session {
    pub fn new(session_start_time: DateTime<Utc>) -> Self {
        Session {
            session_start_time,
            entries: Vec::new(),
        }
    }

    pub fn successful(&self) -> impl Iterator<Item = &ExecutionEntry> {
        self.entries.iter().filter(|e| e.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ExecutionEntry> {
        self.entries.iter().filter(|e| !e.success)
    }

    pub fn all_output_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .entries
            .iter()
            .flat_map(|e| e.output_files.iter().cloned())
            .collect();
        files.sort();
        files.dedup();
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_results_when_persisted() {
        let long_result = "x".repeat(RESULT_TRUNCATE_LENGTH + 500);
        let entry = ExecutionEntry::new(0, "pass".into(), long_result.clone(), true, vec![], vec![], None);
        assert_eq!(entry.result.len(), long_result.len());
        let persisted = PersistedEntry::from(&entry);
        assert_eq!(persisted.result.len(), RESULT_TRUNCATE_LENGTH);
        assert_eq!(persisted.result_length, RESULT_TRUNCATE_LENGTH);
    }

    #[test]
    fn short_results_are_not_truncated() {
        let entry = ExecutionEntry::new(0, "pass".into(), "ok".into(), true, vec![], vec![], None);
        let persisted = PersistedEntry::from(&entry);
        assert_eq!(persisted.result, "ok");
    }
}
