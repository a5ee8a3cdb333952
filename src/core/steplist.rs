//! Step-list resolution: declarative STEPS entries → ordered step instances
//!
//! Instance ids are strict: the canonical form is `<type>_<occurrence>`,
//! occurrence counted over enabled entries of the same type in declaration
//! order. An explicit id must equal the canonical form, and an override
//! config's filename stem must equal the id. This eliminates the class of
//! bugs where a step silently runs against the wrong config file.

use crate::core::config::{bool_like, ConfigUnit, ConfigValue};
use crate::core::error::RunnerError;
use crate::core::registry::{StepType, STEP_TYPES_IN_ORDER};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Raw `enabled` scalar, kept typed until it is parsed at resolution time.
#[derive(Debug, Clone, PartialEq)]
pub enum EnabledValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl EnabledValue {
    fn parse(&self, index: usize) -> Result<bool, RunnerError> {
        let invalid = |repr: String| RunnerError::InvalidEnabledValue {
            index,
            value: repr,
        };
        match self {
            EnabledValue::Bool(b) => Ok(*b),
            EnabledValue::Int(i) => Ok(*i != 0),
            EnabledValue::Text(s) => bool_like(s).ok_or_else(|| invalid(s.clone())),
        }
    }
}

/// One declarative entry of the STEPS list: either a bare type name or a
/// structured instance descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct StepEntry {
    pub step_type: String,
    pub id: Option<String>,
    pub config: Option<String>,
    pub enabled: Option<EnabledValue>,
}

impl StepEntry {
    pub fn bare(step_type: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            id: None,
            config: None,
            enabled: None,
        }
    }

    /// Parse the STEPS value. Shape errors (non-list, entry of the wrong
    /// kind, missing `type`) are load-time failures.
    pub fn parse_list(value: &serde_yaml::Value) -> Result<Vec<StepEntry>, String> {
        let seq = match value {
            serde_yaml::Value::Sequence(seq) => seq,
            _ => return Err("STEPS must be a list".to_string()),
        };
        seq.iter()
            .enumerate()
            .map(|(idx, item)| Self::parse_entry(item, idx))
            .collect()
    }

    fn parse_entry(value: &serde_yaml::Value, idx: usize) -> Result<StepEntry, String> {
        match value {
            serde_yaml::Value::String(s) => Ok(StepEntry::bare(s.clone())),
            serde_yaml::Value::Mapping(map) => {
                let get = |key: &str| map.get(serde_yaml::Value::String(key.to_string()));
                // "step" is accepted as an alias of "type"
                let step_type = get("type")
                    .or_else(|| get("step"))
                    .and_then(serde_yaml::Value::as_str)
                    .ok_or_else(|| {
                        format!("STEPS[{}] object must include 'type' (or 'step')", idx)
                    })?
                    .to_string();
                let id = get("id")
                    .and_then(serde_yaml::Value::as_str)
                    .map(str::to_string);
                let config = get("config")
                    .and_then(serde_yaml::Value::as_str)
                    .map(str::to_string);
                let enabled = match get("enabled") {
                    None | Some(serde_yaml::Value::Null) => None,
                    Some(serde_yaml::Value::Bool(b)) => Some(EnabledValue::Bool(*b)),
                    Some(serde_yaml::Value::Number(n)) => match n.as_i64() {
                        Some(i) => Some(EnabledValue::Int(i)),
                        None => Some(EnabledValue::Text(n.to_string())),
                    },
                    Some(serde_yaml::Value::String(s)) => Some(EnabledValue::Text(s.clone())),
                    Some(other) => Some(EnabledValue::Text(format!("{:?}", other))),
                };
                Ok(StepEntry {
                    step_type,
                    id,
                    config,
                    enabled,
                })
            }
            other => Err(format!(
                "Unsupported STEPS[{}] entry type: {}",
                idx,
                match other {
                    serde_yaml::Value::Null => "null",
                    serde_yaml::Value::Bool(_) => "bool",
                    serde_yaml::Value::Number(_) => "number",
                    serde_yaml::Value::Sequence(_) => "sequence",
                    _ => "other",
                }
            )),
        }
    }
}

/// One concrete step run in a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct StepInstance {
    /// Atomic capability type, e.g. train_cpt.
    pub step_type: StepType,
    /// Unique id within the current run.
    pub instance_id: String,
    /// Optional override config path (relative to the config dir, or absolute).
    pub config_ref: Option<String>,
    /// Index in the full pipeline sequence.
    pub position: usize,
    /// 0-based index among same-type occurrences.
    pub occurrence_index: usize,
}

fn canonical_instance_id(step_type: StepType, occurrence_index: usize) -> String {
    format!("{}_{}", step_type.name(), occurrence_index)
}

/// Resolve the ordered list of step instances to run.
///
/// With a STEPS list, entries are validated and numbered over enabled
/// entries only. Without one, fall back to the registry's canonical order
/// filtered by truthy `STEP_<TYPE>_ENABLED` flags.
pub fn resolve_steps(pipeline_config: &ConfigUnit) -> Result<Vec<StepInstance>, RunnerError> {
    if let Some(entries) = pipeline_config.steps() {
        let mut seen_counts: BTreeMap<StepType, usize> = BTreeMap::new();
        let mut used_ids: BTreeSet<String> = BTreeSet::new();
        let mut instances = Vec::new();

        for (idx, entry) in entries.iter().enumerate() {
            let step_type = StepType::parse(&entry.step_type)?;

            if let Some(enabled) = &entry.enabled {
                if !enabled.parse(idx)? {
                    continue;
                }
            }

            let occurrence_index = *seen_counts.get(&step_type).unwrap_or(&0);
            seen_counts.insert(step_type, occurrence_index + 1);

            let canonical_id = canonical_instance_id(step_type, occurrence_index);
            let instance_id = match &entry.id {
                None => canonical_id,
                Some(explicit) => {
                    if *explicit != canonical_id {
                        return Err(RunnerError::InvalidInstanceId {
                            index: idx,
                            actual: explicit.clone(),
                            expected: canonical_id,
                            step_type: step_type.name().to_string(),
                            occurrence: occurrence_index,
                        });
                    }
                    explicit.clone()
                }
            };

            if let Some(config_ref) = &entry.config {
                let stem = Path::new(config_ref)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("");
                if stem != instance_id {
                    return Err(RunnerError::InvalidConfigRef {
                        index: idx,
                        config_ref: config_ref.clone(),
                        instance_id,
                    });
                }
            }

            if !used_ids.insert(instance_id.clone()) {
                return Err(RunnerError::DuplicateInstanceId(instance_id));
            }

            instances.push(StepInstance {
                step_type,
                instance_id,
                config_ref: entry.config.clone(),
                position: instances.len(),
                occurrence_index,
            });
        }
        return Ok(instances);
    }

    // Legacy: canonical order, include only types with a truthy enabled flag.
    let mut instances = Vec::new();
    for step_type in STEP_TYPES_IN_ORDER {
        let enabled = pipeline_config
            .get(&step_type.enabled_key())
            .and_then(ConfigValue::string_form)
            .and_then(|v| bool_like(&v))
            .unwrap_or(false);
        if enabled {
            instances.push(StepInstance {
                step_type,
                instance_id: canonical_instance_id(step_type, 0),
                config_ref: None,
                position: instances.len(),
                occurrence_index: 0,
            });
        }
    }
    Ok(instances)
}
