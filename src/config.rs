// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which artifact `WorkflowSaver` should emit for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    Notebook,
    Simple,
    Llm,
}

impl Default for SaveMode {
    fn default() -> Self {
        SaveMode::Notebook
    }
}

/// Engine-wide knobs. Loaded from an optional `workflow.toml` under the
/// resolved workflows root; any field missing from the file falls back to
/// its default, and a missing file falls back to `EngineConfig::default()`
/// entirely (fail-open, matching the tracker's session-windowing
/// philosophy elsewhere in this crate).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workflows_root: PathBuf,
    pub max_retries: usize,
    pub max_fix_attempts: usize,
    pub validation_timeout_secs: u64,
    pub large_file_threshold_bytes: u64,
    pub save_mode: SaveMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            workflows_root: default_workflows_root(),
            max_retries: 5,
            max_fix_attempts: 3,
            validation_timeout_secs: 300,
            large_file_threshold_bytes: 100 * 1024 * 1024,
            save_mode: SaveMode::Notebook,
        }
    }
}

fn default_workflows_root() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("org", "LLNL", "workflow-synth") {
        return dirs.data_dir().join("workflows");
    }
    PathBuf::from("workflows")
}

impl EngineConfig {
    /// Load `workflow.toml` from `dir`, falling back to defaults for any
    /// field the file omits and to `EngineConfig::default()` if the file
    /// does not exist at all.
    pub fn load(dir: &std::path::Path) -> crate::error::Result<EngineConfig> {
        let file_path = dir.join("workflow.toml");
        if !file_path.exists() {
            return Ok(EngineConfig::default());
        }
        let content = std::fs::read_to_string(&file_path)?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| crate::error::WorkflowError::Config(format!("{}: {e}", file_path.display())))?;
        Ok(config)
    }

    pub fn save(&self, dir: &std::path::Path) -> crate::error::Result<()> {
        std::fs::create_dir_all(dir)?;
        let file_path = dir.join("workflow.toml");
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| crate::error::WorkflowError::Config(e.to_string()))?;
        std::fs::write(file_path, toml_string)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.max_fix_attempts, 3);
        assert_eq!(config.validation_timeout_secs, 300);
        assert_eq!(config.large_file_threshold_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.max_retries, EngineConfig::default().max_retries);
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.max_retries = 9;
        config.save(dir.path()).unwrap();
        let loaded = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.max_retries, 9);
    }
}
