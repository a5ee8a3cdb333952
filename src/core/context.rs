//! Resolution context - explicit variable environment for `${VAR}` expansion
//!
//! All ambient state the orchestrator consumes is captured once per run into
//! an [`EnvSnapshot`]; resolution and execution never read the process
//! environment directly.

use std::collections::BTreeMap;

/// Environment variables imported into resolution contexts (data-pool root
/// override, trainer-framework install roots, base-model source, raw-copy
/// sources).
pub const ENV_IMPORT_KEYS: &[&str] = &[
    "DATAPOOL",
    "ROOT",
    "BASE_MODEL_SRC",
    "MEGATRON",
    "MINDSPEED",
    "MINDSPEED_LLM",
    "CPT_RAW_COPY_SRC",
    "SFT_RAW_COPY_SRC",
];

/// Pipeline-level variables made visible to step-config resolution.
pub const PIPELINE_CONTEXT_KEYS: &[&str] = &[
    "BASE_MODEL_NAME",
    "BASE_MODEL_SRC",
    "BASE_MODEL_PATH",
    "MODEL_PREFIX",
    "MEGATRON",
    "MINDSPEED",
];

/// Pipeline-level variables exported into every step subprocess environment.
pub const STEP_EXPORT_KEYS: &[&str] = &[
    "BASE_MODEL_NAME",
    "BASE_MODEL_SRC",
    "BASE_MODEL_PATH",
    "TOKENIZER_PATH",
    "SFT_TOKENIZER_PATH",
    "MODEL_PREFIX",
    "MEGATRON",
    "MINDSPEED",
    "ROOT",
];

/// Immutable snapshot of the process environment, taken once at startup.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    /// Capture the current process environment.
    pub fn from_process_env() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build a snapshot from explicit pairs (tests, embedding).
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Copy of this snapshot with one variable added or replaced.
    pub fn with(&self, key: &str, value: &str) -> Self {
        let mut vars = self.vars.clone();
        vars.insert(key.to_string(), value.to_string());
        Self { vars }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Variable name → known string value, used for `${NAME}` substitution.
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    vars: BTreeMap<String, String>,
}

impl ResolutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Import the whitelisted environment variables from a snapshot.
    pub fn import_env(&mut self, env: &EnvSnapshot) {
        for key in ENV_IMPORT_KEYS {
            if let Some(value) = env.get(key) {
                self.vars.insert((*key).to_string(), value.to_string());
            }
        }
    }

    /// Import the pipeline-level variables visible to step configs.
    pub fn import_pipeline_vars(&mut self, pipeline_env: &BTreeMap<String, String>) {
        for key in PIPELINE_CONTEXT_KEYS {
            if let Some(value) = pipeline_env.get(*key) {
                self.vars.insert((*key).to_string(), value.clone());
            }
        }
    }
}
