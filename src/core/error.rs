//! Error taxonomy for the orchestrator

use std::path::PathBuf;
use thiserror::Error;

/// Error types for pipeline orchestration
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Config not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Failed to load config {path}: {reason}")]
    ConfigLoad { path: PathBuf, reason: String },

    #[error("Invalid enabled value in STEPS[{index}]: {value:?}. Use true/false.")]
    InvalidEnabledValue { index: usize, value: String },

    #[error(
        "Invalid STEPS[{index}].id={actual:?}; expected {expected:?} \
         for type={step_type:?} occurrence={occurrence}"
    )]
    InvalidInstanceId {
        index: usize,
        actual: String,
        expected: String,
        step_type: String,
        occurrence: usize,
    },

    #[error("Invalid STEPS[{index}].config={config_ref:?}; filename stem must equal id={instance_id:?}")]
    InvalidConfigRef {
        index: usize,
        config_ref: String,
        instance_id: String,
    },

    #[error("Duplicate step instance id in STEPS: {0:?}")]
    DuplicateInstanceId(String),

    #[error("Unknown step type: {name:?}. Valid steps: {valid}")]
    UnknownStepType { name: String, valid: String },

    #[error("step config must set SCRIPT: id={instance_id} type={step_type} config={config_path}")]
    MissingScriptDirective {
        instance_id: String,
        step_type: String,
        config_path: PathBuf,
    },

    #[error("No valid lines found after merging {file_count} files into {output}{hint}")]
    EmptyMergeResult {
        file_count: usize,
        output: PathBuf,
        hint: String,
    },

    #[error(
        "Glob patterns are not supported. Got: {0}\n\
         Please specify a directory path or a single file path instead."
    )]
    GlobNotSupported(String),

    #[error(
        "{label} must be under DATAPOOL_ROOT ({datapool}) but got: {path}\n\
         set ALLOW_EXTERNAL_PATHS: \"1\" in the pipeline config to override"
    )]
    PathOutsideDataPool {
        label: String,
        datapool: PathBuf,
        path: PathBuf,
    },

    #[error("{label} not found: {path}{hint}")]
    MissingSource {
        label: String,
        path: PathBuf,
        hint: String,
    },

    #[error("step failed: id={instance_id} type={step_type} (exit={exit_code}), see log: {log_path}")]
    StepExecutionFailed {
        instance_id: String,
        step_type: String,
        exit_code: i32,
        log_path: PathBuf,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Process exit code for this error: a failing step propagates its own
    /// exit code, everything else is a configuration/validation error (2).
    pub fn exit_code(&self) -> i32 {
        match self {
            RunnerError::StepExecutionFailed { exit_code, .. } if *exit_code != 0 => *exit_code,
            RunnerError::StepExecutionFailed { .. } => 1,
            _ => 2,
        }
    }
}
