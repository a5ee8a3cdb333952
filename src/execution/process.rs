//! Step subprocess dispatch with console + file tee

use crate::core::error::RunnerError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Fully-built description of a step command: everything a spawn needs,
/// nothing read from ambient process state.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    /// Shell command line, run under `sh -c`.
    pub command: String,
    pub cwd: PathBuf,
    /// Complete child environment; the child inherits nothing else.
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Trait for step execution - allows swapping the shell for a test double
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run the command, teeing output to the console and to `log_path`,
    /// and return the child's exit code.
    async fn run(&self, spec: &ProcessSpec, log_path: &Path) -> Result<i32, RunnerError>;
}

/// Production runner: `sh -c` with a line-buffered tee.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

#[async_trait]
impl ProcessRunner for ShellRunner {
    async fn run(&self, spec: &ProcessSpec, log_path: &Path) -> Result<i32, RunnerError> {
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut log_file = tokio::fs::File::create(log_path).await?;

        debug!("spawning: (cd {} && {})", spec.cwd.display(), spec.command);
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.cwd)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut out_lines = stdout.map(|s| BufReader::new(s).lines());
        let mut err_lines = stderr.map(|s| BufReader::new(s).lines());
        let mut out_done = out_lines.is_none();
        let mut err_done = err_lines.is_none();

        while !out_done || !err_done {
            tokio::select! {
                line = next_line(&mut out_lines), if !out_done => match line? {
                    Some(line) => tee_line(&mut log_file, &line, false).await?,
                    None => out_done = true,
                },
                line = next_line(&mut err_lines), if !err_done => match line? {
                    Some(line) => tee_line(&mut log_file, &line, true).await?,
                    None => err_done = true,
                },
            }
        }
        log_file.flush().await?;

        let status = child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }
}

async fn next_line(
    lines: &mut Option<tokio::io::Lines<BufReader<impl tokio::io::AsyncRead + Unpin>>>,
) -> std::io::Result<Option<String>> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => Ok(None),
    }
}

async fn tee_line(
    log_file: &mut tokio::fs::File,
    line: &str,
    is_stderr: bool,
) -> std::io::Result<()> {
    if is_stderr {
        eprintln!("{}", line);
    } else {
        println!("{}", line);
    }
    log_file.write_all(line.as_bytes()).await?;
    log_file.write_all(b"\n").await
}
