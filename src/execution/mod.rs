//! Step execution: process seam and pipeline engine

pub mod engine;
pub mod process;

pub use engine::{
    build_step_env, clear_output_directory, resolve_step_config_path, PipelineRunner, RunOptions,
    StepEnvInputs,
};
pub use process::{ProcessRunner, ProcessSpec, ShellRunner};
