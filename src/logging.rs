// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

//! Two independent logging surfaces: `tracing`-based operational
//! diagnostics for `main.rs` (what an operator tailing stderr wants), and
//! `AuditLogger`, a file-backed, append-only record of the synthesis
//! process (what a human reviewing `workflows/logs/*.log` wants). See
//! spec.md §2/§7 and `biomni/workflow/saver.py`'s emoji-prefixed print
//! statements alongside its structured logger.

use crate::error::Result;
use chrono::Utc;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Initializes the process-wide `tracing` subscriber. Call once from
/// `main`; safe to call more than once in tests since errors are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[derive(Debug, Clone, Serialize)]
struct AuditRecord<'a> {
    timestamp: String,
    event: &'a str,
    #[serde(flatten)]
    fields: serde_json::Value,
}

/// Append-only audit log: one JSON-lines structured record plus one
/// human-readable emoji-prefixed summary line per event, both written to
/// `workflow_generation_<timestamp>.log` under the configured log
/// directory. Write failures are swallowed (logged to stderr) rather than
/// propagated, matching §7's "filesystem errors logged at WARNING,
/// synthesis continues" disposition.
pub struct AuditLogger {
    file: Option<Mutex<std::fs::File>>,
    path: Option<PathBuf>,
}

impl AuditLogger {
    pub fn new(log_dir: &Path) -> Self {
        match Self::open(log_dir) {
            Ok((file, path)) => AuditLogger { file: Some(Mutex::new(file)), path: Some(path) },
            Err(e) => {
                tracing::warn!("failed to open audit log in {}: {e}", log_dir.display());
                AuditLogger { file: None, path: None }
            }
        }
    }

    fn open(log_dir: &Path) -> std::io::Result<(std::fs::File, PathBuf)> {
        std::fs::create_dir_all(log_dir)?;
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = log_dir.join(format!("workflow_generation_{timestamp}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok((file, path))
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn write_line(&self, summary: &str, event: &str, fields: serde_json::Value) {
        let Some(file) = &self.file else { return };
        let record = AuditRecord { timestamp: Utc::now().to_rfc3339(), event, fields };
        let Ok(mut guard) = file.lock() else { return };
        if let Ok(json) = serde_json::to_string(&record) {
            let _ = writeln!(guard, "{json}");
        }
        let _ = writeln!(guard, "# {summary}");
    }

    pub fn log_workflow_start(&self, workflow_name: &str, num_executions: usize) {
        let separator = "=".repeat(80);
        self.write_line(
            &format!("{separator}\nWORKFLOW GENERATION STARTED: {workflow_name}\n  Total executions: {num_executions}\n{separator}"),
            "workflow_start",
            serde_json::json!({ "workflow_name": workflow_name, "num_executions": num_executions }),
        );
        tracing::info!(workflow_name, num_executions, "workflow generation started");
    }

    pub fn log_missing_outputs(&self, missing: &[String], retry_attempt: usize) {
        let preview: Vec<&String> = missing.iter().take(3).collect();
        let suffix = if missing.len() > 3 { "..." } else { "" };
        self.write_line(
            &format!("\u{26a0}\u{fe0f}  Missing {} output files (retry {retry_attempt}): {}{suffix}", missing.len(), preview.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")),
            "missing_outputs",
            serde_json::json!({ "missing": missing, "retry_attempt": retry_attempt }),
        );
    }

    pub fn log_forced_inclusion(&self, num_blocks: usize) {
        self.write_line(
            &format!("\u{1f527} Applying forced inclusion mechanism for {num_blocks} missing output file(s)..."),
            "forced_inclusion",
            serde_json::json!({ "num_blocks": num_blocks }),
        );
    }

    pub fn log_validation_result(&self, valid: bool, summary: &str) {
        if valid {
            self.write_line(
                "\u{2705} Workflow validated successfully - all output files match",
                "validation_result",
                serde_json::json!({ "valid": true, "summary": summary }),
            );
        } else {
            self.write_line(
                &format!("\u{26a0}\u{fe0f}  Workflow validation failed: {summary}"),
                "validation_result",
                serde_json::json!({ "valid": false, "summary": summary }),
            );
        }
    }

    pub fn log_workflow_complete(&self, workflow_path: &Path) {
        self.write_line(
            &format!("\u{2705} Workflow finalized: {}", workflow_path.display()),
            "workflow_complete",
            serde_json::json!({ "workflow_path": workflow_path.to_string_lossy() }),
        );
        tracing::info!(path = %workflow_path.display(), "workflow finalized");
    }

    pub fn log_error(&self, message: &str) {
        self.write_line(
            &format!("\u{274c} {message}"),
            "error",
            serde_json::json!({ "message": message }),
        );
        tracing::error!("{message}");
    }

    pub fn log_warning(&self, message: &str) {
        self.write_line(
            &format!("\u{26a0}\u{fe0f}  {message}"),
            "warning",
            serde_json::json!({ "message": message }),
        );
        tracing::warn!("{message}");
    }
}

pub fn open_audit_logger(workflows_root: &Path) -> Result<AuditLogger> {
    Ok(AuditLogger::new(&workflows_root.join("logs")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_logger_writes_json_and_summary_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path());
        logger.log_workflow_start("demo", 3);
        logger.log_workflow_complete(&dir.path().join("workflow_demo.py"));

        let path = logger.log_path().unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("\"event\":\"workflow_start\""));
        assert!(content.contains("WORKFLOW GENERATION STARTED"));
        assert!(content.contains("Workflow finalized"));
    }

    #[test]
    fn audit_logger_tolerates_unwritable_dir() {
        let logger = AuditLogger::new(Path::new("/proc/definitely_not_writable/xyz"));
        logger.log_error("should not panic");
    }
}
