//! Command-line interface

pub mod output;

use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;

/// Experiment-pipeline orchestrator for LLM training workflows
#[derive(Debug, Parser, Clone)]
#[command(name = "llmrunner")]
#[command(version = "0.1.0")]
#[command(about = "Run tokenize/train/convert/eval pipelines against a data pool", long_about = None)]
pub struct Cli {
    /// Path to the pipeline configuration unit
    #[arg(short, long)]
    pub config: PathBuf,

    /// Prepare the experiment (data pool, base model, corpora) and exit
    #[arg(long)]
    pub prepare_only: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
