//! llmrunner - experiment-pipeline orchestrator for LLM training workflows
//!
//! Sequences tokenization, pretraining, checkpoint conversion, fine-tuning
//! and evaluation steps, each dispatched to an external trainer framework as
//! a logged subprocess against a shared experiment data pool.

pub mod cli;
pub mod core;
pub mod execution;
pub mod prepare;

pub use core::{ConfigUnit, EnvSnapshot, ResolutionContext, RunnerError, StepType};
pub use execution::{PipelineRunner, ProcessRunner, ProcessSpec, RunOptions, ShellRunner};
