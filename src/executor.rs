// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

//! The code-execution seam the synthesis core consumes but never
//! implements beyond a local reference implementation. See spec.md §6.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Interface the synthesis core consumes (does not implement beyond
/// `LocalExecutor`). A real deployment might back this with a sandboxed
/// kernel or container; the tracker only needs before/after file-system
/// state and textual output.
pub trait CodeExecutor: Send + Sync {
    fn run_python(&self, code: &str) -> String;
    fn run_bash(&self, script: &str) -> String;
    fn run_r(&self, code: &str) -> String;
    fn list_files(&self, directory: &Path) -> Vec<PathBuf>;
    fn download_file(&self, remote: &str, local: &Path) -> std::io::Result<()>;
    fn upload_file(&self, local: &Path, remote: Option<&str>) -> std::io::Result<()>;
    fn interrupt(&self) -> bool;
    fn is_interrupted(&self) -> bool;
    fn reset_interrupt(&self);
    fn get_working_directory(&self) -> PathBuf;
}

const INTERRUPTED_SENTINEL: &str = "[interrupted]";

/// Runs code blocks as local `python3`/`bash`/`Rscript` subprocesses in a
/// fixed working directory. `interrupt()` only takes effect on the next
/// call to `run_*`, not mid-subprocess, matching §5's stated limitation
/// that the synthesis core itself respects no such signal.
pub struct LocalExecutor {
    working_directory: PathBuf,
    interrupted: Arc<AtomicBool>,
}

impl LocalExecutor {
    pub fn new(working_directory: PathBuf) -> Self {
        LocalExecutor { working_directory, interrupted: Arc::new(AtomicBool::new(false)) }
    }

    fn run(&self, interpreter: &str, interpreter_args: &[&str], source: &str, extension: &str) -> String {
        if self.interrupted.load(Ordering::SeqCst) {
            return INTERRUPTED_SENTINEL.to_string();
        }

        let script_path = self.working_directory.join(format!(".executor_tmp.{extension}"));
        if let Err(e) = std::fs::write(&script_path, source) {
            return format!("error: could not write temp script: {e}");
        }

        let mut command = Command::new(interpreter);
        command.args(interpreter_args).arg(&script_path).current_dir(&self.working_directory);

        let result = match command.output() {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if output.status.success() {
                    stdout.to_string()
                } else {
                    format!("{stdout}{stderr}")
                }
            }
            Err(e) => format!("error: failed to launch {interpreter}: {e}"),
        };

        let _ = std::fs::remove_file(&script_path);
        result
    }
}

impl CodeExecutor for LocalExecutor {
    fn run_python(&self, code: &str) -> String {
        self.run("python3", &[], code, "py")
    }

    fn run_bash(&self, script: &str) -> String {
        self.run("bash", &[], script, "sh")
    }

    fn run_r(&self, code: &str) -> String {
        self.run("Rscript", &[], code, "R")
    }

    fn list_files(&self, directory: &Path) -> Vec<PathBuf> {
        walkdir::WalkDir::new(directory)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .collect()
    }

    fn download_file(&self, remote: &str, local: &Path) -> std::io::Result<()> {
        std::fs::copy(remote, local).map(|_| ())
    }

    fn upload_file(&self, local: &Path, remote: Option<&str>) -> std::io::Result<()> {
        let dest = remote.map(PathBuf::from).unwrap_or_else(|| self.working_directory.join(
            local.file_name().unwrap_or_else(|| std::ffi::OsStr::new("uploaded")),
        ));
        std::fs::copy(local, dest).map(|_| ())
    }

    fn interrupt(&self) -> bool {
        self.interrupted.store(true, Ordering::SeqCst);
        true
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    fn reset_interrupt(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }

    fn get_working_directory(&self) -> PathBuf {
        self.working_directory.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_python_returns_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new(dir.path().to_path_buf());
        let output = executor.run_python("print('hello')");
        assert!(output.contains("hello"));
    }

    #[test]
    fn interrupt_short_circuits_subsequent_runs() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new(dir.path().to_path_buf());
        executor.interrupt();
        assert!(executor.is_interrupted());
        assert_eq!(executor.run_python("print('should not run')"), INTERRUPTED_SENTINEL);
        executor.reset_interrupt();
        assert!(!executor.is_interrupted());
    }

    #[test]
    fn list_files_finds_written_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let executor = LocalExecutor::new(dir.path().to_path_buf());
        let files = executor.list_files(dir.path());
        assert!(files.iter().any(|p| p.file_name().unwrap() == "a.txt"));
    }
}
