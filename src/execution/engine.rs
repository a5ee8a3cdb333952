//! Pipeline executor: sequential step dispatch over a resolved step list
//!
//! One run is `Init -> Prepare -> step[0] .. step[n-1] -> Finished`; the
//! first failing step aborts the run and prior outputs are left as-is.

use crate::cli::output;
use crate::core::config::{resolve, ConfigUnit, ResolvedConfig};
use crate::core::context::{EnvSnapshot, ResolutionContext, STEP_EXPORT_KEYS};
use crate::core::error::RunnerError;
use crate::core::registry::StepType;
use crate::core::steplist::{resolve_steps, StepInstance};
use crate::execution::process::{ProcessRunner, ProcessSpec};
use crate::prepare::{self, resolve_path, PrepareInputs};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_path: PathBuf,
    /// Prepare the experiment and exit before any step runs.
    pub prepare_only: bool,
}

/// Everything `build_step_env` layers into a step's environment.
pub struct StepEnvInputs<'a> {
    pub base: &'a EnvSnapshot,
    pub root_dir: &'a Path,
    pub config_dir: &'a Path,
    pub step_config_path: &'a Path,
    pub instance: &'a StepInstance,
    pub pipeline: &'a ResolvedConfig,
    pub step_config: Option<&'a ResolvedConfig>,
    pub run_id: &'a str,
    pub workdir: &'a Path,
    pub log_dir: &'a Path,
    pub dry_run: bool,
    pub datapool_root: &'a Path,
}

/// Layer a step subprocess environment. Later pairs override earlier ones:
/// inherited env, orchestration vars, whitelisted pipeline vars, then every
/// key of the step's own resolved config.
pub fn build_step_env(inputs: &StepEnvInputs<'_>) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = inputs
        .base
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let path_str = |p: &Path| p.to_string_lossy().into_owned();
    env.extend([
        ("ROOT_DIR".to_string(), path_str(inputs.root_dir)),
        ("CONFIG_DIR".to_string(), path_str(inputs.config_dir)),
        ("STEP_ENV_PATH".to_string(), path_str(inputs.step_config_path)),
        ("STEP_INDEX".to_string(), inputs.instance.position.to_string()),
        (
            "STEP_OCCURRENCE_INDEX".to_string(),
            inputs.instance.occurrence_index.to_string(),
        ),
        ("STEP_ID".to_string(), inputs.instance.instance_id.clone()),
        (
            "STEP_TYPE".to_string(),
            inputs.instance.step_type.name().to_string(),
        ),
        ("RUN_ID".to_string(), inputs.run_id.to_string()),
        ("WORKDIR".to_string(), path_str(inputs.workdir)),
        ("LOG_DIR".to_string(), path_str(inputs.log_dir)),
        (
            "DRY_RUN".to_string(),
            if inputs.dry_run { "1" } else { "0" }.to_string(),
        ),
        ("DATAPOOL_ROOT".to_string(), path_str(inputs.datapool_root)),
    ]);

    for key in STEP_EXPORT_KEYS {
        if let Some(value) = inputs.pipeline.get(key) {
            env.push((key.to_string(), value.to_string()));
        }
    }
    if let Some(step_config) = inputs.step_config {
        for (key, value) in step_config.iter() {
            env.push((key.clone(), value.clone()));
        }
    }
    env
}

/// Canonical or override config path for a step instance.
pub fn resolve_step_config_path(instance: &StepInstance, config_dir: &Path) -> PathBuf {
    match &instance.config_ref {
        Some(config_ref) => {
            let path = Path::new(config_ref);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                config_dir.join(path)
            }
        }
        None => config_dir
            .join("steps")
            .join(StepType::config_file_name(&instance.instance_id)),
    }
}

fn count_files_recursive(dir: &Path) -> std::io::Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            count += count_files_recursive(&entry.path())?;
        } else {
            count += 1;
        }
    }
    Ok(count)
}

/// Delete the contents of a step's output directory, keeping the directory
/// and the merged tokenizer input prepared for this run. A plain file at the
/// path is removed outright. Dry-run only reports.
pub fn clear_output_directory(
    output_dir: &Path,
    step_name: &str,
    dry_run: bool,
) -> Result<(), RunnerError> {
    if !output_dir.exists() {
        return Ok(());
    }
    if !output_dir.is_dir() {
        if !dry_run {
            fs::remove_file(output_dir)?;
        }
        return Ok(());
    }
    let mut file_count = 0;
    for entry in fs::read_dir(output_dir)? {
        let entry = entry?;
        if entry.file_name() == prepare::MERGED_INPUT_FILE {
            continue;
        }
        if entry.file_type()?.is_dir() {
            file_count += count_files_recursive(&entry.path())?;
        } else {
            file_count += 1;
        }
    }
    if file_count == 0 {
        return Ok(());
    }
    if dry_run {
        println!(
            "[dry-run] {}: would clear {} files from {}",
            step_name,
            file_count,
            output_dir.display()
        );
        return Ok(());
    }
    for entry in fs::read_dir(output_dir)? {
        let entry = entry?;
        if entry.file_name() == prepare::MERGED_INPUT_FILE {
            continue;
        }
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    output::status(&format!(
        "{}: cleared {} files from {}",
        step_name,
        file_count,
        output_dir.display()
    ));
    Ok(())
}

/// Sequential pipeline runner over a pluggable process runner.
pub struct PipelineRunner<R: ProcessRunner> {
    root_dir: PathBuf,
    env: EnvSnapshot,
    runner: R,
}

impl<R: ProcessRunner> PipelineRunner<R> {
    pub fn new(root_dir: PathBuf, env: EnvSnapshot, runner: R) -> Self {
        Self {
            root_dir,
            env,
            runner,
        }
    }

    pub async fn run(&self, opts: &RunOptions) -> Result<(), RunnerError> {
        let config_path = resolve_path(&opts.config_path.to_string_lossy(), &self.root_dir);
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root_dir.clone());

        // Resolution may reference ${DATAPOOL}; default it to <root>/datapool
        let mut env = self.env.clone();
        if env.get("DATAPOOL").is_none() {
            env = env.with(
                "DATAPOOL",
                &self.root_dir.join("datapool").to_string_lossy(),
            );
        }

        let mut unit = ConfigUnit::load(&config_path)?;
        unit.merge_env_imports(&env);
        let steps = resolve_steps(&unit)?;

        // Pass 1: env-only context, just enough to learn where the pool is
        let mut env_ctx = ResolutionContext::new();
        env_ctx.import_env(&env);
        let first_pass = resolve(&unit, &env_ctx);
        let datapool_root = match first_pass.get_nonempty("DATAPOOL_ROOT") {
            Some(raw) => resolve_path(raw, &self.root_dir),
            None => self.root_dir.join("datapool"),
        };
        if !datapool_root.starts_with(&self.root_dir) {
            warn!("DATAPOOL_ROOT is outside the root dir: {}", datapool_root.display());
        }

        // Pass 2: full context
        let mut ctx = ResolutionContext::new();
        ctx.set("DATAPOOL_ROOT", datapool_root.to_string_lossy());
        ctx.set("ROOT_DIR", self.root_dir.to_string_lossy());
        ctx.import_env(&env);
        let pipeline = resolve(&unit, &ctx);
        let dry_run = pipeline.is_truthy("DRY_RUN");

        let cpt_config =
            self.first_step_config(&steps, StepType::TokenizeCpt, &config_dir, &datapool_root, &pipeline, &env)?;
        let sft_config =
            self.first_step_config(&steps, StepType::TokenizeSft, &config_dir, &datapool_root, &pipeline, &env)?;
        prepare::prepare_experiment(&PrepareInputs {
            root_dir: &self.root_dir,
            datapool_root: &datapool_root,
            pipeline: &pipeline,
            cpt_config: cpt_config.as_ref(),
            sft_config: sft_config.as_ref(),
            dry_run,
        })?;

        let run_id = pipeline.get_nonempty("RUN_ID").unwrap_or("run").to_string();
        let workdir = match pipeline.get_nonempty("WORKDIR") {
            Some(raw) => resolve_path(raw, &self.root_dir),
            None => self.root_dir.join(".llmrunner"),
        };
        let log_dir = workdir.join("logs").join(&run_id);
        fs::create_dir_all(&workdir)?;
        fs::create_dir_all(&log_dir)?;

        output::status(&format!(
            "{}run_id={} config_dir={} workdir={} datapool_root={} dry_run={}",
            output::ROCKET,
            run_id,
            config_dir.display(),
            workdir.display(),
            datapool_root.display(),
            if dry_run { "1" } else { "0" }
        ));

        if opts.prepare_only {
            output::status(&format!("{}prepare-only: done (no steps executed)", output::CHECK));
            return Ok(());
        }

        for instance in &steps {
            self.run_step(
                instance,
                &config_dir,
                &datapool_root,
                &pipeline,
                &env,
                &run_id,
                &workdir,
                &log_dir,
                dry_run,
            )
            .await?;
        }
        output::status(&format!("{}pipeline finished", output::CHECK));
        Ok(())
    }

    /// Resolved config of the first instance of `step_type`, when that
    /// instance exists and its config file is present.
    fn first_step_config(
        &self,
        steps: &[StepInstance],
        step_type: StepType,
        config_dir: &Path,
        datapool_root: &Path,
        pipeline: &ResolvedConfig,
        env: &EnvSnapshot,
    ) -> Result<Option<ResolvedConfig>, RunnerError> {
        let Some(instance) = steps.iter().find(|s| s.step_type == step_type) else {
            return Ok(None);
        };
        let path = resolve_step_config_path(instance, config_dir);
        if !path.exists() {
            return Ok(None);
        }
        self.load_step_config(&path, datapool_root, pipeline, env)
            .map(Some)
    }

    fn load_step_config(
        &self,
        path: &Path,
        datapool_root: &Path,
        pipeline: &ResolvedConfig,
        env: &EnvSnapshot,
    ) -> Result<ResolvedConfig, RunnerError> {
        let mut unit = ConfigUnit::load(path)?;
        unit.merge_env_imports(env);
        let mut ctx = ResolutionContext::new();
        ctx.set("DATAPOOL_ROOT", datapool_root.to_string_lossy());
        ctx.set("ROOT_DIR", self.root_dir.to_string_lossy());
        ctx.import_pipeline_vars(pipeline.vars());
        Ok(resolve(&unit, &ctx))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        instance: &StepInstance,
        config_dir: &Path,
        datapool_root: &Path,
        pipeline: &ResolvedConfig,
        env: &EnvSnapshot,
        run_id: &str,
        workdir: &Path,
        log_dir: &Path,
        dry_run: bool,
    ) -> Result<(), RunnerError> {
        let step_config_path = resolve_step_config_path(instance, config_dir);
        let step_config = if step_config_path.exists() {
            Some(self.load_step_config(&step_config_path, datapool_root, pipeline, env)?)
        } else {
            debug!("no config for {}: {}", instance.instance_id, step_config_path.display());
            None
        };

        if let Some(config) = &step_config {
            if let Some(output_dir) = instance.step_type.output_dir(config, datapool_root) {
                clear_output_directory(&output_dir, &instance.instance_id, dry_run)?;
            }
        }

        output::status(&format!(
            "run step[{}] id={} type={}",
            instance.position,
            instance.instance_id,
            instance.step_type
        ));

        let script = step_config
            .as_ref()
            .and_then(|c| c.get_nonempty("SCRIPT"))
            .map(str::to_string)
            .ok_or_else(|| RunnerError::MissingScriptDirective {
                instance_id: instance.instance_id.clone(),
                step_type: instance.step_type.name().to_string(),
                config_path: step_config_path.clone(),
            })?;
        let cwd = match step_config.as_ref().and_then(|c| c.get_nonempty("SCRIPT_CWD")) {
            Some(raw) => resolve_path(raw, &self.root_dir),
            None => self.root_dir.clone(),
        };

        let spec = ProcessSpec {
            command: script,
            cwd,
            env: build_step_env(&StepEnvInputs {
                base: env,
                root_dir: &self.root_dir,
                config_dir,
                step_config_path: &step_config_path,
                instance,
                pipeline,
                step_config: step_config.as_ref(),
                run_id,
                workdir,
                log_dir,
                dry_run,
                datapool_root,
            }),
        };

        if dry_run {
            println!("[dry-run] (cd {} && {})", spec.cwd.display(), spec.command);
            return Ok(());
        }

        let log_path = log_dir.join(format!("{}.log", instance.instance_id));
        let exit_code = self.runner.run(&spec, &log_path).await?;
        if exit_code != 0 {
            return Err(RunnerError::StepExecutionFailed {
                instance_id: instance.instance_id.clone(),
                step_type: instance.step_type.name().to_string(),
                exit_code,
                log_path,
            });
        }
        output::status(&format!(
            "{}done step[{}] id={} type={}",
            output::CHECK,
            instance.position,
            instance.instance_id,
            instance.step_type
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ConfigUnit;
    use tempfile::TempDir;

    fn resolved(yaml: &str) -> ResolvedConfig {
        resolve(&ConfigUnit::from_yaml(yaml).unwrap(), &ResolutionContext::new())
    }

    fn instance(step_type: StepType, id: &str, position: usize) -> StepInstance {
        StepInstance {
            step_type,
            instance_id: id.to_string(),
            config_ref: None,
            position,
            occurrence_index: 0,
        }
    }

    #[test]
    fn test_step_config_path_canonical_and_override() {
        let config_dir = Path::new("/exp/qwen3");
        let inst = instance(StepType::TrainCpt, "train_cpt_0", 0);
        assert_eq!(
            resolve_step_config_path(&inst, config_dir),
            PathBuf::from("/exp/qwen3/steps/train_cpt_0.yaml")
        );

        let mut with_ref = inst.clone();
        with_ref.config_ref = Some("steps/train_cpt_0.yaml".to_string());
        assert_eq!(
            resolve_step_config_path(&with_ref, config_dir),
            PathBuf::from("/exp/qwen3/steps/train_cpt_0.yaml")
        );

        with_ref.config_ref = Some("/abs/train_cpt_0.yaml".to_string());
        assert_eq!(
            resolve_step_config_path(&with_ref, config_dir),
            PathBuf::from("/abs/train_cpt_0.yaml")
        );
    }

    #[test]
    fn test_build_step_env_layering() {
        let base = EnvSnapshot::from_pairs([
            ("PATH", "/usr/bin"),
            ("WORKERS", "from-env"),
        ]);
        let pipeline = resolved(
            "MODEL_PREFIX: qwen3\nBASE_MODEL_PATH: /pool/model/base/qwen3\nUNRELATED: x\n",
        );
        let step = resolved("SCRIPT: run.sh\nWORKERS: \"16\"\n");
        let inst = instance(StepType::TokenizeCpt, "tokenize_cpt_0", 2);

        let env = build_step_env(&StepEnvInputs {
            base: &base,
            root_dir: Path::new("/repo"),
            config_dir: Path::new("/repo/configs/exp"),
            step_config_path: Path::new("/repo/configs/exp/steps/tokenize_cpt_0.yaml"),
            instance: &inst,
            pipeline: &pipeline,
            step_config: Some(&step),
            run_id: "run",
            workdir: Path::new("/repo/.llmrunner"),
            log_dir: Path::new("/repo/.llmrunner/logs/run"),
            dry_run: false,
            datapool_root: Path::new("/pool"),
        });
        let get = |key: &str| {
            env.iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(get("PATH"), Some("/usr/bin"));
        assert_eq!(get("STEP_ID"), Some("tokenize_cpt_0"));
        assert_eq!(get("STEP_INDEX"), Some("2"));
        assert_eq!(get("STEP_TYPE"), Some("tokenize_cpt"));
        assert_eq!(get("DATAPOOL_ROOT"), Some("/pool"));
        assert_eq!(get("MODEL_PREFIX"), Some("qwen3"));
        // Pipeline keys outside the whitelist are not exported
        assert_eq!(get("UNRELATED"), None);
        // Step config overrides inherited env
        assert_eq!(get("WORKERS"), Some("16"));
        assert_eq!(get("SCRIPT"), Some("run.sh"));
    }

    #[test]
    fn test_clear_output_directory_contents_only() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("tokenized");
        fs::create_dir_all(out.join("sub")).unwrap();
        fs::write(out.join("a.bin"), "x").unwrap();
        fs::write(out.join("sub/b.bin"), "x").unwrap();

        clear_output_directory(&out, "tokenize_cpt_0", false).unwrap();
        assert!(out.is_dir());
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn test_clear_output_dry_run_keeps_files() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("tokenized");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("a.bin"), "x").unwrap();

        clear_output_directory(&out, "tokenize_cpt_0", true).unwrap();
        assert!(out.join("a.bin").exists());
    }

    #[test]
    fn test_clear_output_keeps_merged_input() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("tokenized");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("a.bin"), "x").unwrap();
        fs::write(out.join(prepare::MERGED_INPUT_FILE), "{\"text\":\"a\"}\n").unwrap();

        clear_output_directory(&out, "tokenize_cpt_0", false).unwrap();
        assert!(!out.join("a.bin").exists());
        assert!(out.join(prepare::MERGED_INPUT_FILE).exists());
    }

    #[test]
    fn test_clear_output_unlinks_plain_file() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("report.txt");
        fs::write(&out, "x").unwrap();
        clear_output_directory(&out, "eval_0", false).unwrap();
        assert!(!out.exists());
    }
}
