// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

//! The two entry points most callers want: synthesize straight from a live
//! `WorkflowTracker`, or reconstruct from whatever journal a prior session
//! left on disk. Both converge on `WorkflowSaver::save_and_validate_workflow`.
//! See spec.md §2.

use crate::config::{EngineConfig, SaveMode};
use crate::entry::ExecutionEntry;
use crate::error::{Result, WorkflowError};
use crate::llm::WorkflowLlmProcessor;
use crate::logging::{self, AuditLogger};
use crate::saver::WorkflowSaver;
use crate::tracker::{load_execute_blocks, WorkflowTracker};
use crate::validator::WorkflowValidator;
use std::path::{Path, PathBuf};

/// Owns the pieces a synthesis run wires together: where artifacts land,
/// how they're validated, and (optionally) how fixes get generated.
pub struct WorkflowSynthesisService {
    config: EngineConfig,
    saver: WorkflowSaver,
    validator: WorkflowValidator,
    audit: AuditLogger,
}

impl WorkflowSynthesisService {
    pub fn new(config: EngineConfig, llm: Option<WorkflowLlmProcessor>) -> Result<Self> {
        std::fs::create_dir_all(&config.workflows_root)?;
        let saver = WorkflowSaver::new(config.workflows_root.clone(), llm)?.with_max_retries(config.max_retries);
        let validator = WorkflowValidator::with_timeout(
            config.workflows_root.clone(),
            std::time::Duration::from_secs(config.validation_timeout_secs),
        );
        let audit = logging::open_audit_logger(&config.workflows_root)?;
        Ok(WorkflowSynthesisService { config, saver, validator, audit })
    }

    /// Synthesizes directly from a live tracker's in-memory history.
    pub fn synthesize_from_tracker(
        &self,
        tracker: &WorkflowTracker,
        mode: SaveMode,
        workflow_name: Option<&str>,
    ) -> Result<PathBuf> {
        if tracker.execution_history.is_empty() {
            return Err(WorkflowError::EmptySession);
        }
        self.saver.save_and_validate_workflow(
            &tracker.execution_history,
            mode,
            workflow_name,
            &tracker.get_input_files(),
            &tracker.get_expected_output_files(),
            Some(&self.validator),
            Some(&self.audit),
            self.config.max_fix_attempts,
        )
    }

    /// Reconstructs a session from `<workflows_root>/execute_blocks/*.json`
    /// and synthesizes from that instead of live tracker state, for
    /// re-running synthesis against a past session.
    pub fn reconstruct_from_journal(
        &self,
        execute_blocks_dir: &Path,
        mode: SaveMode,
        workflow_name: Option<&str>,
    ) -> Result<PathBuf> {
        let entries = load_execute_blocks(execute_blocks_dir, None);
        if entries.is_empty() {
            return Err(WorkflowError::EmptySession);
        }
        let (input_files, expected_output_files) = reconstructed_file_state(&entries);
        self.saver.save_and_validate_workflow(
            &entries,
            mode,
            workflow_name,
            &input_files,
            &expected_output_files,
            Some(&self.validator),
            Some(&self.audit),
            self.config.max_fix_attempts,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// A reconstructed session has no live tracker to ask for file contents,
/// so inputs are just every distinct path referenced and expected outputs
/// are read from disk at reconstruction time (missing files are dropped,
/// same fail-open behavior as `WorkflowTracker::get_expected_output_files`).
fn reconstructed_file_state(
    entries: &[ExecutionEntry],
) -> (Vec<String>, std::collections::HashMap<String, Vec<u8>>) {
    let mut input_files = std::collections::HashSet::new();
    let mut expected_output_files = std::collections::HashMap::new();
    for entry in entries {
        input_files.extend(entry.input_files.iter().cloned());
        for output in &entry.output_files {
            if let Ok(bytes) = std::fs::read(output) {
                expected_output_files.insert(output.clone(), bytes);
            }
        }
    }
    (input_files.into_iter().collect(), expected_output_files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesize_from_tracker_rejects_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.workflows_root = dir.path().join("workflows");
        let service = WorkflowSynthesisService::new(config, None).unwrap();
        let tracker = WorkflowTracker::new(None).unwrap();
        let result = service.synthesize_from_tracker(&tracker, SaveMode::Notebook, None);
        assert!(result.is_err());
    }

    #[test]
    fn synthesize_from_tracker_produces_notebook() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.workflows_root = dir.path().join("workflows");
        let service = WorkflowSynthesisService::new(config, None).unwrap();
        let mut tracker = WorkflowTracker::new(None).unwrap();
        tracker.track_execution("x = 1".into(), "ok".into(), true, vec![], vec![], None).unwrap();
        let path = service.synthesize_from_tracker(&tracker, SaveMode::Notebook, Some("demo")).unwrap();
        assert!(path.exists());
        assert!(path.to_string_lossy().ends_with(".ipynb"));
    }

    #[test]
    fn reconstruct_from_journal_rejects_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.workflows_root = dir.path().join("workflows");
        let service = WorkflowSynthesisService::new(config, None).unwrap();
        let empty_blocks = dir.path().join("execute_blocks");
        std::fs::create_dir_all(&empty_blocks).unwrap();
        let result = service.reconstruct_from_journal(&empty_blocks, SaveMode::Notebook, None);
        assert!(result.is_err());
    }

    #[test]
    fn reconstruct_from_journal_replays_persisted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("work");
        std::fs::create_dir_all(&work_dir).unwrap();
        let mut tracker = WorkflowTracker::new(Some(work_dir)).unwrap();
        tracker.track_execution("x = 1".into(), "ok".into(), true, vec![], vec![], None).unwrap();

        let mut config = EngineConfig::default();
        config.workflows_root = dir.path().join("workflows");
        let service = WorkflowSynthesisService::new(config, None).unwrap();
        let blocks_dir = tracker.execute_blocks_dir.clone().unwrap();
        let path = service.reconstruct_from_journal(&blocks_dir, SaveMode::Notebook, Some("demo")).unwrap();
        assert!(path.exists());
    }
}
