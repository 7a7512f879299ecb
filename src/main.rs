// Copyright 2024 Lawrence Livermore National Security, LLC
// See the top-level LICENSE file for details.
//
// SPDX-License-Identifier: MIT

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use workflow_synth::config::{EngineConfig, SaveMode};
use workflow_synth::llm::{HttpLlmClient, WorkflowLlmProcessor};
use workflow_synth::logging;
use workflow_synth::service::WorkflowSynthesisService;
use workflow_synth::validator::WorkflowValidator;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Notebook,
    Simple,
    Llm,
}

impl From<ModeArg> for SaveMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Notebook => SaveMode::Notebook,
            ModeArg::Simple => SaveMode::Simple,
            ModeArg::Llm => SaveMode::Llm,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "workflow-synth", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconstructs a recorded session's `execute_*.json` journal into a
    /// standalone script or notebook, validating and repairing it along
    /// the way when a validator and expected output files apply.
    Reconstruct {
        /// Directory holding `execute_<timestamp>_<index>.json` blocks.
        #[arg(long)]
        execute_blocks_dir: PathBuf,

        /// Root directory for saved workflows, logs, and `workflow.toml`.
        #[arg(long)]
        workflows_root: Option<PathBuf>,

        /// Artifact format to emit.
        #[arg(long, value_enum, default_value = "notebook")]
        mode: ModeArg,

        /// Workflow name; inferred from the session's code if omitted.
        #[arg(long)]
        name: Option<String>,

        /// Chat-completion endpoint to use for `--mode llm`.
        #[arg(long)]
        llm_endpoint: Option<String>,

        /// Model name passed to the LLM endpoint.
        #[arg(long, default_value = "gpt-4o-mini")]
        llm_model: String,

        /// API key for the LLM endpoint; falls back to `OPENAI_API_KEY`.
        #[arg(long)]
        llm_api_key: Option<String>,
    },

    /// Re-runs an already-saved script in isolation and reports whether it
    /// reproduces a given output file, without touching the journal.
    Validate {
        /// Path to the saved `.py` script to re-execute.
        workflow_path: PathBuf,

        /// Input file the script expects to read, if any (repeatable).
        #[arg(long = "input")]
        input_files: Vec<String>,

        /// Output file to compare byte-for-byte against the script's own
        /// output (repeatable: `name.ext` or a bare path on disk).
        #[arg(long = "expect")]
        expected_outputs: Vec<PathBuf>,

        /// Working directory for the isolated re-execution.
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,
    },
}

fn main() -> ExitCode {
    logging::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Reconstruct {
            execute_blocks_dir,
            workflows_root,
            mode,
            name,
            llm_endpoint,
            llm_model,
            llm_api_key,
        } => run_reconstruct(
            execute_blocks_dir,
            workflows_root,
            mode,
            name,
            llm_endpoint,
            llm_model,
            llm_api_key,
        ),
        Command::Validate { workflow_path, input_files, expected_outputs, work_dir } => {
            run_validate(workflow_path, input_files, expected_outputs, work_dir)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_reconstruct(
    execute_blocks_dir: PathBuf,
    workflows_root: Option<PathBuf>,
    mode: ModeArg,
    name: Option<String>,
    llm_endpoint: Option<String>,
    llm_model: String,
    llm_api_key: Option<String>,
) -> ExitCode {
    let mut config = match workflows_root
        .as_deref()
        .map(EngineConfig::load)
        .unwrap_or_else(|| Ok(EngineConfig::default()))
    {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(root) = &workflows_root {
        config.workflows_root = root.clone();
    }
    config.save_mode = mode.into();

    let llm = llm_endpoint.as_ref().map(|endpoint| {
        let api_key = llm_api_key.clone().or_else(|| std::env::var("OPENAI_API_KEY").ok());
        let client = HttpLlmClient::new(endpoint.clone(), llm_model.clone(), api_key);
        WorkflowLlmProcessor::new(Box::new(client))
    });

    let service = match WorkflowSynthesisService::new(config.clone(), llm) {
        Ok(service) => service,
        Err(e) => {
            tracing::error!("failed to initialize synthesis service: {e}");
            return ExitCode::FAILURE;
        }
    };

    match service.reconstruct_from_journal(&execute_blocks_dir, config.save_mode, name.as_deref()) {
        Ok(path) => {
            println!("{}", path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("workflow synthesis failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_validate(
    workflow_path: PathBuf,
    input_files: Vec<String>,
    expected_outputs: Vec<PathBuf>,
    work_dir: PathBuf,
) -> ExitCode {
    let mut expected = std::collections::HashMap::new();
    for output in &expected_outputs {
        match std::fs::read(output) {
            Ok(bytes) => {
                expected.insert(output.to_string_lossy().to_string(), bytes);
            }
            Err(e) => {
                tracing::error!("could not read expected output {}: {e}", output.display());
                return ExitCode::FAILURE;
            }
        }
    }

    let validator = WorkflowValidator::new(work_dir);
    let report = validator.validate_workflow(&workflow_path, &input_files, &expected);
    if report.valid {
        println!("valid");
        ExitCode::SUCCESS
    } else {
        let reason = report
            .error
            .or_else(|| report.comparison.map(|c| c.summary))
            .unwrap_or_else(|| "validation failed".to_string());
        eprintln!("invalid: {reason}");
        ExitCode::FAILURE
    }
}
