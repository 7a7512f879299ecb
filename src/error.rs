// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

//! Crate-wide error type. Internal helpers are free to return
//! `Result<T, Box<dyn std::error::Error>>` with `format!`-built context the
//! way leaf functions elsewhere in this crate do; `WorkflowError` is the
//! typed boundary the public API surfaces.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("failed to read journal entry at {path}: {source}")]
    JournalRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write journal entry at {path}: {source}")]
    JournalWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed journal entry at {path}: {source}")]
    JournalDecode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("LLM invocation failed: {0}")]
    LlmInvocation(String),

    #[error("no code was generated for this session")]
    EmptyGeneration,

    #[error("session has no executions to synthesize")]
    EmptySession,

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("validator timed out after {0}s")]
    ValidationTimeout(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl From<String> for WorkflowError {
    fn from(s: String) -> Self {
        WorkflowError::Other(s)
    }
}

impl From<&str> for WorkflowError {
    fn from(s: &str) -> Self {
        WorkflowError::Other(s.to_string())
    }
}
