//! Shared test harness: a recording process runner and experiment scaffolds

#![allow(dead_code)]

use async_trait::async_trait;
use llmrunner::core::{EnvSnapshot, RunnerError};
use llmrunner::execution::{PipelineRunner, ProcessRunner, ProcessSpec, RunOptions};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// One recorded dispatch: the spec the engine built plus the log it named.
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub spec: ProcessSpec,
    pub log_path: PathBuf,
}

/// Process runner test double: never spawns, records every spec it is
/// handed, and replies with a queued exit code (0 once the queue is empty).
#[derive(Clone, Default)]
pub struct MockRunner {
    runs: Arc<Mutex<Vec<RecordedRun>>>,
    exit_codes: Arc<Mutex<VecDeque<i32>>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit_codes(codes: impl IntoIterator<Item = i32>) -> Self {
        Self {
            runs: Arc::new(Mutex::new(Vec::new())),
            exit_codes: Arc::new(Mutex::new(codes.into_iter().collect())),
        }
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.lock().unwrap().clone()
    }

    /// STEP_ID of each dispatched step, in dispatch order.
    pub fn step_ids(&self) -> Vec<String> {
        self.runs()
            .iter()
            .map(|r| {
                r.spec
                    .env_value("STEP_ID")
                    .unwrap_or("<missing STEP_ID>")
                    .to_string()
            })
            .collect()
    }
}

#[async_trait]
impl ProcessRunner for MockRunner {
    async fn run(&self, spec: &ProcessSpec, log_path: &Path) -> Result<i32, RunnerError> {
        // Mirror the real runner: the log file exists once the step ran
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            log_path,
            format!("(cd {} && {})\n", spec.cwd.display(), spec.command),
        )?;
        self.runs.lock().unwrap().push(RecordedRun {
            spec: spec.clone(),
            log_path: log_path.to_path_buf(),
        });
        Ok(self.exit_codes.lock().unwrap().pop_front().unwrap_or(0))
    }
}

/// A throwaway experiment tree: `configs/exp/pipeline.yaml` plus per-step
/// configs under `configs/exp/steps/`, with the data pool defaulting to
/// `<root>/datapool`.
pub struct ExperimentDir {
    root: TempDir,
}

impl ExperimentDir {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
        }
    }

    pub fn root_path(&self) -> &Path {
        self.root.path()
    }

    pub fn pipeline_path(&self) -> PathBuf {
        self.root_path().join("configs/exp/pipeline.yaml")
    }

    pub fn datapool(&self) -> PathBuf {
        self.root_path().join("datapool")
    }

    pub fn write_pipeline(&self, yaml: &str) {
        let path = self.pipeline_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, yaml).unwrap();
    }

    pub fn write_step(&self, instance_id: &str, yaml: &str) -> PathBuf {
        let path = self
            .root_path()
            .join("configs/exp/steps")
            .join(format!("{}.yaml", instance_id));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, yaml).unwrap();
        path
    }

    /// Write a file at a root-relative path, creating parent directories.
    pub fn write_file(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root_path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn log_path(&self, run_id: &str, instance_id: &str) -> PathBuf {
        self.root_path()
            .join(".llmrunner/logs")
            .join(run_id)
            .join(format!("{}.log", instance_id))
    }
}

/// Minimal inherited environment; tests never depend on the host env.
pub fn test_env() -> EnvSnapshot {
    EnvSnapshot::from_pairs([("PATH", "/usr/bin:/bin"), ("HOME", "/home/op")])
}

pub async fn run_pipeline(dir: &ExperimentDir, runner: MockRunner) -> Result<(), RunnerError> {
    run_pipeline_with(dir, runner, test_env(), false).await
}

pub async fn run_pipeline_with(
    dir: &ExperimentDir,
    runner: MockRunner,
    env: EnvSnapshot,
    prepare_only: bool,
) -> Result<(), RunnerError> {
    let engine = PipelineRunner::new(dir.root_path().to_path_buf(), env, runner);
    engine
        .run(&RunOptions {
            config_path: dir.pipeline_path(),
            prepare_only,
        })
        .await
}
