//! Experiment preparation: data-pool layout, base model, raw corpora, merges
//!
//! Preparation is idempotent. Everything it creates is skipped on the next
//! run if already present, so operators can rerun `--prepare-only` freely.

pub mod corpus;
pub mod jsonl;
pub mod sft;

use crate::core::config::{bool_like, ResolvedConfig};
use crate::core::error::RunnerError;
use std::path::{Path, PathBuf};
use tracing::info;

pub use corpus::{copy_or_link, copy_tree_flat, ensure_datapool_structure, FlatCopyReport};
pub use jsonl::{expand_input, merge_and_shuffle, MergeOptions, MERGED_INPUT_FILE};
pub use sft::{rewrite_instruction_to_input_label, PromptTemplates};

/// Resolve a config-supplied path against the orchestrator root.
pub fn resolve_path(raw: &str, root_dir: &Path) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root_dir.join(path)
    }
}

/// Everything `prepare_experiment` needs, resolved by the caller.
pub struct PrepareInputs<'a> {
    pub root_dir: &'a Path,
    pub datapool_root: &'a Path,
    pub pipeline: &'a ResolvedConfig,
    /// Resolved config of the first tokenize_cpt instance, when one exists.
    pub cpt_config: Option<&'a ResolvedConfig>,
    /// Resolved config of the first tokenize_sft instance, when one exists.
    pub sft_config: Option<&'a ResolvedConfig>,
    pub dry_run: bool,
}

/// Stage the experiment: data-pool skeleton, base model, raw CPT/SFT corpora,
/// and the merged tokenizer inputs.
pub fn prepare_experiment(inputs: &PrepareInputs<'_>) -> Result<(), RunnerError> {
    ensure_datapool_structure(inputs.datapool_root)?;
    stage_base_model(inputs)?;
    stage_raw_corpus(inputs, inputs.cpt_config, "CPT_RAW_COPY_SRC", "cpt")?;
    stage_raw_corpus(inputs, inputs.sft_config, "SFT_RAW_COPY_SRC", "sft")?;
    merge_cpt_corpus(inputs)?;
    merge_sft_corpus(inputs)?;
    Ok(())
}

fn stage_base_model(inputs: &PrepareInputs<'_>) -> Result<(), RunnerError> {
    let Some(src) = inputs.pipeline.get_nonempty("BASE_MODEL_SRC") else {
        info!("base_model: skipped (BASE_MODEL_SRC not set)");
        return Ok(());
    };
    let name = inputs
        .pipeline
        .get_nonempty("BASE_MODEL_NAME")
        .unwrap_or("base_model");
    let src = resolve_path(src, inputs.root_dir);
    let dst = inputs.datapool_root.join("model/base").join(name);

    if !src.exists() {
        return Err(RunnerError::MissingSource {
            label: "BASE_MODEL_SRC".to_string(),
            path: src,
            hint: String::new(),
        });
    }
    if dst.exists() {
        info!("base_model: exists, skip -> {}", dst.display());
        return Ok(());
    }
    info!("base_model: {} -> {}", src.display(), dst.display());
    if !inputs.dry_run {
        corpus::copytree_link_fallback(&src, &dst)?;
    }
    Ok(())
}

fn stage_raw_corpus(
    inputs: &PrepareInputs<'_>,
    step_config: Option<&ResolvedConfig>,
    src_key: &str,
    kind: &str,
) -> Result<(), RunnerError> {
    let Some(config) = step_config else {
        info!("{}: skipped (no tokenize_{} step)", src_key, kind);
        return Ok(());
    };
    let Some(src) = config.get_nonempty(src_key) else {
        info!("{}: skipped (not set)", src_key);
        return Ok(());
    };
    let src = resolve_path(src, inputs.root_dir);
    if !src.exists() {
        return Err(RunnerError::MissingSource {
            label: src_key.to_string(),
            path: src,
            hint: String::new(),
        });
    }
    let dst = inputs.datapool_root.join("data/raw").join(kind);
    info!("{}: {} -> {}", src_key, src.display(), dst.display());
    if inputs.dry_run {
        return Ok(());
    }
    let report = copy_tree_flat(&src, &dst)?;
    info!(
        "{}: copied_jsonl={} clashes={}",
        src_key,
        report.copied,
        report.clashes.len()
    );
    report.log_clashes();
    Ok(())
}

fn allow_external(inputs: &PrepareInputs<'_>) -> bool {
    inputs.pipeline.is_truthy("ALLOW_EXTERNAL_PATHS")
}

fn raw_copy_hint(src_key: &str) -> String {
    format!(
        "\nHint: configure {} and rerun with --prepare-only to copy data",
        src_key
    )
}

fn required_keys_from(config: &ResolvedConfig, keys: &[&str], default: &str) -> Vec<String> {
    keys.iter()
        .find_map(|k| config.get_nonempty(k))
        .unwrap_or(default)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn shuffle_options(config: &ResolvedConfig) -> (bool, Option<u64>, usize) {
    let shuffle = config.is_truthy("SHUFFLE_JSONL");
    let seed = config
        .get_nonempty("SHUFFLE_SEED")
        .and_then(|s| s.parse().ok());
    let buffer = config.get_usize("SHUFFLE_BUFFER", jsonl::DEFAULT_SHUFFLE_BUFFER);
    (shuffle, seed, buffer)
}

/// Merge the pretraining corpus into a single tokenizer input. The merged
/// file lands next to `OUTPUT_PREFIX` so the trainer reads one flat file.
fn merge_cpt_corpus(inputs: &PrepareInputs<'_>) -> Result<(), RunnerError> {
    let Some(config) = inputs.cpt_config else {
        return Ok(());
    };
    let Some(input) = config.get_nonempty("INPUT_DIR") else {
        info!("tokenize_cpt merge: skipped (INPUT_DIR not set)");
        return Ok(());
    };
    let input = resolve_path(input, inputs.root_dir);
    corpus::ensure_within_datapool(
        "INPUT_DIR",
        &input,
        inputs.datapool_root,
        allow_external(inputs),
    )?;

    let merge_output = config.get_nonempty("OUTPUT_PREFIX").and_then(|prefix| {
        let prefix = resolve_path(prefix, inputs.root_dir);
        prefix.parent().map(|p| p.join(MERGED_INPUT_FILE))
    });
    if let Some(out) = &merge_output {
        corpus::ensure_within_datapool(
            "OUTPUT_PREFIX",
            out,
            inputs.datapool_root,
            allow_external(inputs),
        )?;
    }

    if inputs.dry_run {
        info!("[dry-run] tokenize_cpt merge: {} (skipped)", input.display());
        return Ok(());
    }

    let (shuffle, seed, buffer_size) = shuffle_options(config);
    let opts = MergeOptions {
        required_keys: required_keys_from(config, &["JSON_KEYS"], "text"),
        shuffle,
        seed,
        buffer_size,
        ..MergeOptions::default()
    };
    let merged = expand_input(
        &input,
        merge_output.as_deref(),
        &opts,
        &raw_copy_hint("CPT_RAW_COPY_SRC"),
    )?;
    info!("tokenize_cpt merge: input={}", merged.display());
    Ok(())
}

/// Merge (and optionally rewrite) the SFT corpus. The merged file stays in
/// the raw directory so tokenized-output clearing never removes it.
fn merge_sft_corpus(inputs: &PrepareInputs<'_>) -> Result<(), RunnerError> {
    let Some(config) = inputs.sft_config else {
        return Ok(());
    };
    let input = config
        .get_nonempty("INPUT_DATA_PATH")
        .or_else(|| config.get_nonempty("SFT_INPUT_DATA_PATH"));
    let Some(input) = input else {
        info!("tokenize_sft merge: skipped (INPUT_DATA_PATH not set)");
        return Ok(());
    };
    let input = resolve_path(input, inputs.root_dir);
    corpus::ensure_within_datapool(
        "INPUT_DATA_PATH",
        &input,
        inputs.datapool_root,
        allow_external(inputs),
    )?;
    if let Some(prefix) = config
        .get_nonempty("OUTPUT_PREFIX")
        .or_else(|| config.get_nonempty("SFT_OUTPUT_PREFIX"))
    {
        corpus::ensure_within_datapool(
            "OUTPUT_PREFIX",
            &resolve_path(prefix, inputs.root_dir),
            inputs.datapool_root,
            allow_external(inputs),
        )?;
    }

    if inputs.dry_run {
        info!("[dry-run] tokenize_sft merge: {} (skipped)", input.display());
        return Ok(());
    }

    let rewrite = config.is_truthy("REWRITE_INPUT_LABEL");
    let merge = config
        .get_nonempty("MERGE_JSONL")
        .and_then(bool_like)
        .unwrap_or(true);
    let (shuffle, seed, buffer_size) = shuffle_options(config);
    let opts = MergeOptions {
        merge,
        // Mixed raw shapes are fine when rewriting; the rewrite classifies
        required_keys: if rewrite {
            Vec::new()
        } else {
            required_keys_from(
                config,
                &["JSON_KEYS", "SFT_JSON_KEYS"],
                "instruction input output",
            )
        },
        shuffle,
        seed,
        buffer_size,
    };
    let mut merged = expand_input(&input, None, &opts, &raw_copy_hint("SFT_RAW_COPY_SRC"))?;

    if rewrite {
        let templates = PromptTemplates {
            prompt: config
                .get_nonempty("PROMPT_TEMPLATE")
                .map(str::to_string)
                .unwrap_or_else(|| PromptTemplates::default().prompt),
            input: config
                .get_nonempty("PROMPT_INPUT_TEMPLATE")
                .map(str::to_string)
                .unwrap_or_else(|| PromptTemplates::default().input),
            response_prefix: config
                .get_nonempty("PROMPT_RESPONSE_PREFIX")
                .map(str::to_string)
                .unwrap_or_else(|| PromptTemplates::default().response_prefix),
        };
        let rewrite_output = match config.get_nonempty("REWRITE_OUTPUT_FILE") {
            Some(out) => resolve_path(out, inputs.root_dir),
            None => merged
                .parent()
                .map(|p| p.join("sft_input_label.jsonl"))
                .unwrap_or_else(|| PathBuf::from("sft_input_label.jsonl")),
        };
        info!("tokenize_sft: rewriting input/label -> {}", rewrite_output.display());
        rewrite_instruction_to_input_label(&merged, &rewrite_output, &templates)?;
        merged = rewrite_output;
    }
    info!("tokenize_sft merge: input={}", merged.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{resolve, ConfigUnit};
    use crate::core::context::ResolutionContext;
    use std::fs;
    use tempfile::TempDir;

    fn resolved(yaml: &str) -> ResolvedConfig {
        resolve(&ConfigUnit::from_yaml(yaml).unwrap(), &ResolutionContext::new())
    }

    fn inputs_with<'a>(
        root: &'a Path,
        pool: &'a Path,
        pipeline: &'a ResolvedConfig,
    ) -> PrepareInputs<'a> {
        PrepareInputs {
            root_dir: root,
            datapool_root: pool,
            pipeline,
            cpt_config: None,
            sft_config: None,
            dry_run: false,
        }
    }

    #[test]
    fn test_prepare_stages_base_model_once() {
        let tmp = TempDir::new().unwrap();
        let model_src = tmp.path().join("upstream/qwen");
        fs::create_dir_all(&model_src).unwrap();
        fs::write(model_src.join("config.json"), "{}").unwrap();
        let pool = tmp.path().join("pool");

        let pipeline = resolved(&format!(
            "BASE_MODEL_SRC: {}\nBASE_MODEL_NAME: qwen3\n",
            model_src.display()
        ));
        let inputs = inputs_with(tmp.path(), &pool, &pipeline);
        prepare_experiment(&inputs).unwrap();
        let staged = pool.join("model/base/qwen3/config.json");
        assert!(staged.is_file());

        // Second run leaves the staged model alone
        fs::write(&staged, "{\"edited\":1}").unwrap();
        prepare_experiment(&inputs).unwrap();
        assert_eq!(fs::read_to_string(&staged).unwrap(), "{\"edited\":1}");
    }

    #[test]
    fn test_missing_base_model_source_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let pipeline = resolved("BASE_MODEL_SRC: /nope/model\n");
        let inputs = inputs_with(tmp.path(), tmp.path(), &pipeline);
        let err = prepare_experiment(&inputs).unwrap_err();
        assert!(matches!(err, RunnerError::MissingSource { .. }));
    }

    #[test]
    fn test_raw_corpus_staged_from_step_config() {
        let tmp = TempDir::new().unwrap();
        let raw_src = tmp.path().join("corpus");
        fs::create_dir_all(raw_src.join("wiki")).unwrap();
        fs::write(raw_src.join("wiki/en.jsonl"), "{}\n").unwrap();
        let pool = tmp.path().join("pool");

        let pipeline = resolved("MODEL_PREFIX: m\n");
        let cpt = resolved(&format!("CPT_RAW_COPY_SRC: {}\n", raw_src.display()));
        let mut inputs = inputs_with(tmp.path(), &pool, &pipeline);
        inputs.cpt_config = Some(&cpt);
        prepare_experiment(&inputs).unwrap();
        assert!(pool.join("data/raw/cpt/wiki__en.jsonl").is_file());
        assert!(pool.join("data/raw").is_dir());
    }

    #[test]
    fn test_cpt_merge_writes_beside_output_prefix() {
        let tmp = TempDir::new().unwrap();
        let pool = tmp.path().join("pool");
        let raw = pool.join("data/raw/cpt");
        fs::create_dir_all(&raw).unwrap();
        fs::write(raw.join("a.jsonl"), "{\"text\":\"a\"}\n").unwrap();
        fs::write(raw.join("b.jsonl"), "{\"text\":\"b\"}\n{\"other\":1}\n").unwrap();

        let pipeline = resolved("MODEL_PREFIX: m\n");
        let cpt = resolved(&format!(
            "INPUT_DIR: {}\nOUTPUT_PREFIX: {}\n",
            raw.display(),
            pool.join("data/tokenized/cpt/corpus").display()
        ));
        let mut inputs = inputs_with(tmp.path(), &pool, &pipeline);
        inputs.cpt_config = Some(&cpt);
        prepare_experiment(&inputs).unwrap();

        let merged = pool.join("data/tokenized/cpt/merged_input.jsonl");
        assert!(merged.is_file());
        // required key "text" drops the keyless record
        assert_eq!(fs::read_to_string(&merged).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_external_input_requires_opt_in() {
        let tmp = TempDir::new().unwrap();
        let outside = tmp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("a.jsonl"), "{\"text\":\"a\"}\n").unwrap();
        let pool = tmp.path().join("pool");

        let strict = resolved("MODEL_PREFIX: m\n");
        let cpt = resolved(&format!("INPUT_DIR: {}\n", outside.display()));
        let mut inputs = inputs_with(tmp.path(), &pool, &strict);
        inputs.cpt_config = Some(&cpt);
        let err = prepare_experiment(&inputs).unwrap_err();
        assert!(matches!(err, RunnerError::PathOutsideDataPool { .. }));

        let permissive = resolved("ALLOW_EXTERNAL_PATHS: \"1\"\n");
        let mut inputs = inputs_with(tmp.path(), &pool, &permissive);
        inputs.cpt_config = Some(&cpt);
        prepare_experiment(&inputs).unwrap();
    }

    #[test]
    fn test_sft_rewrite_produces_input_label_file() {
        let tmp = TempDir::new().unwrap();
        let pool = tmp.path().join("pool");
        let raw = pool.join("data/raw/sft");
        fs::create_dir_all(&raw).unwrap();
        fs::write(
            raw.join("alpaca.jsonl"),
            "{\"instruction\":\"Do X\",\"output\":\"Y\"}\n",
        )
        .unwrap();

        let pipeline = resolved("MODEL_PREFIX: m\n");
        let sft = resolved(&format!(
            "INPUT_DATA_PATH: {}\nREWRITE_INPUT_LABEL: \"1\"\n",
            raw.display()
        ));
        let mut inputs = inputs_with(tmp.path(), &pool, &pipeline);
        inputs.sft_config = Some(&sft);
        prepare_experiment(&inputs).unwrap();
        let rewritten = raw.join("sft_input_label.jsonl");
        assert!(rewritten.is_file());
        let record: serde_json::Value =
            serde_json::from_str(fs::read_to_string(&rewritten).unwrap().lines().next().unwrap())
                .unwrap();
        assert_eq!(record["label"].as_str().unwrap(), "Y");
    }

    #[test]
    fn test_dry_run_creates_structure_but_copies_nothing() {
        let tmp = TempDir::new().unwrap();
        let raw_src = tmp.path().join("corpus");
        fs::create_dir_all(&raw_src).unwrap();
        fs::write(raw_src.join("a.jsonl"), "{}\n").unwrap();
        let pool = tmp.path().join("pool");

        let pipeline = resolved("MODEL_PREFIX: m\n");
        let sft = resolved(&format!("SFT_RAW_COPY_SRC: {}\n", raw_src.display()));
        let mut inputs = inputs_with(tmp.path(), &pool, &pipeline);
        inputs.sft_config = Some(&sft);
        inputs.dry_run = true;
        prepare_experiment(&inputs).unwrap();
        assert!(pool.join("data/raw").is_dir());
        assert!(!pool.join("data/raw/sft/a.jsonl").exists());
    }
}
