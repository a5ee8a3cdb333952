//! Step type registry
//!
//! The closed set of step capabilities, in canonical order. The order drives
//! the legacy `STEP_<TYPE>_ENABLED` fallback; repeats in a pipeline's STEPS
//! list are expected (e.g. train_cpt, train_cpt, train_sft).

use crate::core::config::ResolvedConfig;
use crate::core::error::RunnerError;
use std::fmt;
use std::path::{Path, PathBuf};

/// A step capability. `Mg2Hf`/`Hf2Mg` exchange the two checkpoint-format
/// conventions; both formats are opaque to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StepType {
    Udatasets,
    TokenizeCpt,
    TokenizeSft,
    TrainCpt,
    Mg2Hf,
    Hf2Mg,
    TrainSft,
    Eval,
}

/// All step types in canonical order.
pub const STEP_TYPES_IN_ORDER: [StepType; 8] = [
    StepType::Udatasets,
    StepType::TokenizeCpt,
    StepType::TokenizeSft,
    StepType::TrainCpt,
    StepType::Mg2Hf,
    StepType::Hf2Mg,
    StepType::TrainSft,
    StepType::Eval,
];

impl StepType {
    pub fn name(&self) -> &'static str {
        match self {
            StepType::Udatasets => "udatasets",
            StepType::TokenizeCpt => "tokenize_cpt",
            StepType::TokenizeSft => "tokenize_sft",
            StepType::TrainCpt => "train_cpt",
            StepType::Mg2Hf => "mg2hf",
            StepType::Hf2Mg => "hf2mg",
            StepType::TrainSft => "train_sft",
            StepType::Eval => "eval",
        }
    }

    /// Parse a step-type name (case-insensitive).
    pub fn parse(name: &str) -> Result<Self, RunnerError> {
        let lower = name.trim().to_ascii_lowercase();
        STEP_TYPES_IN_ORDER
            .iter()
            .find(|t| t.name() == lower)
            .copied()
            .ok_or_else(|| RunnerError::UnknownStepType {
                name: name.to_string(),
                valid: STEP_TYPES_IN_ORDER
                    .iter()
                    .map(|t| t.name())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    /// Legacy enabled-flag key, e.g. `STEP_TRAIN_CPT_ENABLED`.
    pub fn enabled_key(&self) -> String {
        format!("STEP_{}_ENABLED", self.name().to_ascii_uppercase())
    }

    /// Canonical per-instance config filename, `steps/<instance_id>.yaml`.
    pub fn config_file_name(instance_id: &str) -> String {
        format!("{}.yaml", instance_id)
    }

    /// Output directory cleared before this step re-runs. The long-running
    /// trainer-delegated steps (and hf2mg) report none: their checkpoints
    /// are never cleared by the orchestrator.
    pub fn output_dir(&self, config: &ResolvedConfig, datapool_root: &Path) -> Option<PathBuf> {
        match self {
            StepType::Udatasets => Some(
                dir_from_keys(config, &["OUTPUT_DIR"])
                    .unwrap_or_else(|| datapool_root.join("data").join("processed")),
            ),
            StepType::TokenizeCpt => dir_from_prefix(config, "OUTPUT_PREFIX"),
            StepType::TokenizeSft => dir_from_prefix(config, "OUTPUT_PREFIX")
                .or_else(|| dir_from_prefix(config, "SFT_OUTPUT_PREFIX")),
            StepType::Mg2Hf => Some(
                dir_from_keys(config, &["OUT_HF_DIR", "OUTPUT_DIR", "HF_OUTPUT_DIR"])
                    .unwrap_or_else(|| datapool_root.join("model").join("hf")),
            ),
            StepType::Eval => Some(
                dir_from_keys(config, &["OUTPUT_DIR", "REPORT_DIR"])
                    .unwrap_or_else(|| datapool_root.join("reports")),
            ),
            StepType::TrainCpt | StepType::Hf2Mg | StepType::TrainSft => None,
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn dir_from_prefix(config: &ResolvedConfig, key: &str) -> Option<PathBuf> {
    config
        .get_nonempty(key)
        .and_then(|p| Path::new(p).parent().map(Path::to_path_buf))
}

fn dir_from_keys(config: &ResolvedConfig, keys: &[&str]) -> Option<PathBuf> {
    keys.iter()
        .find_map(|k| config.get_nonempty(k).map(PathBuf::from))
}
