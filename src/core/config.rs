//! Configuration units: declarative YAML key/value documents with
//! `${NAME}` placeholder substitution.
//!
//! A unit is a flat mapping of uppercase-style keys to scalar values plus
//! the structured `STEPS` list. Scalars are normalized to their string form
//! so substitution works uniformly; `STEPS` is preserved as-is. A unit may
//! declare `INCLUDE: <relative path>` to inherit a parent unit (merged
//! base-first, the child wins).

use crate::core::context::{ResolutionContext, EnvSnapshot, ENV_IMPORT_KEYS};
use crate::core::error::RunnerError;
use crate::core::steplist::StepEntry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Maximum substitution passes before leftover placeholders are kept verbatim.
pub const MAX_RESOLVE_PASSES: usize = 10;

/// Maximum INCLUDE chain depth.
const MAX_INCLUDE_DEPTH: usize = 8;

/// A typed configuration value. Scalars expose a canonical string form for
/// substitution; conversion to a specific type happens at the use site.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Steps(Vec<StepEntry>),
}

impl ConfigValue {
    /// String form used for substitution and env export. `Steps` has none.
    pub fn string_form(&self) -> Option<String> {
        match self {
            ConfigValue::String(s) => Some(s.clone()),
            ConfigValue::Integer(i) => Some(i.to_string()),
            ConfigValue::Float(f) => Some(f.to_string()),
            ConfigValue::Boolean(b) => Some(b.to_string()),
            ConfigValue::Steps(_) => None,
        }
    }
}

/// Parse a boolean-like scalar string. Recognized truthy: 1/true/yes/on;
/// falsy: 0/false/no/off/"".
pub fn bool_like(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// A loaded, unresolved configuration unit.
#[derive(Debug, Clone, Default)]
pub struct ConfigUnit {
    values: BTreeMap<String, ConfigValue>,
}

impl ConfigUnit {
    /// Load a unit from a YAML file, following `INCLUDE` references.
    pub fn load(path: &Path) -> Result<Self, RunnerError> {
        let mut stack = Vec::new();
        Self::load_inner(path, &mut stack)
    }

    fn load_inner(path: &Path, stack: &mut Vec<PathBuf>) -> Result<Self, RunnerError> {
        if !path.exists() {
            return Err(RunnerError::ConfigNotFound(path.to_path_buf()));
        }
        let canonical = path.canonicalize().map_err(|e| RunnerError::ConfigLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if stack.contains(&canonical) {
            return Err(RunnerError::ConfigLoad {
                path: path.to_path_buf(),
                reason: "INCLUDE cycle detected".to_string(),
            });
        }
        if stack.len() >= MAX_INCLUDE_DEPTH {
            return Err(RunnerError::ConfigLoad {
                path: path.to_path_buf(),
                reason: format!("INCLUDE chain deeper than {}", MAX_INCLUDE_DEPTH),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| RunnerError::ConfigLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut unit = Self::from_yaml(&content).map_err(|reason| RunnerError::ConfigLoad {
            path: path.to_path_buf(),
            reason,
        })?;

        // INCLUDE: merge the parent unit underneath this one.
        if let Some(ConfigValue::String(include)) = unit.values.remove("INCLUDE") {
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            let include_path = parent.join(&include);
            stack.push(canonical);
            let base = Self::load_inner(&include_path, stack)?;
            stack.pop();

            let mut merged = base.values;
            merged.extend(unit.values);
            unit.values = merged;
        }

        Ok(unit)
    }

    /// Parse a unit from a YAML string. Only string keys that don't start
    /// with `_` are captured; sequences other than `STEPS` and nested
    /// mappings are dropped (they have no string form).
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        let doc: serde_yaml::Value =
            serde_yaml::from_str(yaml).map_err(|e| e.to_string())?;
        let mapping = match doc {
            serde_yaml::Value::Mapping(m) => m,
            serde_yaml::Value::Null => return Ok(Self::default()),
            other => {
                return Err(format!(
                    "expected a top-level mapping, got {}",
                    yaml_type_name(&other)
                ))
            }
        };

        let mut values = BTreeMap::new();
        for (key, value) in mapping {
            let name = match key {
                serde_yaml::Value::String(s) => s,
                _ => continue,
            };
            if name.starts_with('_') {
                continue;
            }
            if name == "STEPS" {
                let entries = StepEntry::parse_list(&value)?;
                values.insert(name, ConfigValue::Steps(entries));
                continue;
            }
            let parsed = match value {
                serde_yaml::Value::String(s) => ConfigValue::String(s),
                serde_yaml::Value::Bool(b) => ConfigValue::Boolean(b),
                serde_yaml::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        ConfigValue::Integer(i)
                    } else {
                        ConfigValue::Float(n.as_f64().unwrap_or(0.0))
                    }
                }
                serde_yaml::Value::Null => ConfigValue::String(String::new()),
                _ => continue,
            };
            values.insert(name, parsed);
        }
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: ConfigValue) {
        self.values.insert(key.into(), value);
    }

    /// The declared step list, if any.
    pub fn steps(&self) -> Option<&[StepEntry]> {
        match self.values.get("STEPS") {
            Some(ConfigValue::Steps(entries)) => Some(entries),
            _ => None,
        }
    }

    /// Overlay whitelisted environment variables (env wins over the unit).
    pub fn merge_env_imports(&mut self, env: &EnvSnapshot) {
        for key in ENV_IMPORT_KEYS {
            if let Some(value) = env.get(key) {
                self.values
                    .insert((*key).to_string(), ConfigValue::String(value.to_string()));
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
        self.values.iter()
    }
}

fn yaml_type_name(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "bool",
        serde_yaml::Value::Number(_) => "number",
        serde_yaml::Value::String(_) => "string",
        serde_yaml::Value::Sequence(_) => "sequence",
        serde_yaml::Value::Mapping(_) => "mapping",
        serde_yaml::Value::Tagged(_) => "tagged",
    }
}

/// A resolved unit: every scalar substituted to a plain string, the step
/// list carried through untouched.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    values: BTreeMap<String, String>,
    steps: Option<Vec<StepEntry>>,
}

impl ResolvedConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Value with surrounding whitespace trimmed, `None` if empty or absent.
    pub fn get_nonempty(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|s| !s.is_empty())
    }

    /// Boolean-like lookup; unrecognized or missing values read as `false`.
    pub fn is_truthy(&self, key: &str) -> bool {
        self.get(key).and_then(bool_like).unwrap_or(false)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn steps(&self) -> Option<&[StepEntry]> {
        self.steps.as_deref()
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }
}

/// Substitute `${NAME}` placeholders in every entry of `unit`, first from
/// `context`, then from other already-substituted entries of the same unit.
/// Repeats until a full pass changes nothing, bounded at
/// [`MAX_RESOLVE_PASSES`]; whatever is still unresolved stays verbatim.
pub fn resolve(unit: &ConfigUnit, context: &ResolutionContext) -> ResolvedConfig {
    let mut resolved: BTreeMap<String, String> = unit
        .iter()
        .filter_map(|(k, v)| v.string_form().map(|s| (k.clone(), s)))
        .collect();

    for _ in 0..MAX_RESOLVE_PASSES {
        let mut changed = false;
        let source = resolved.clone();
        for (key, value) in resolved.iter_mut() {
            if !value.contains("${") {
                continue;
            }
            let mut next = value.clone();
            for (name, var_value) in context.vars() {
                let token = format!("${{{}}}", name);
                if next.contains(&token) {
                    next = next.replace(&token, var_value);
                }
            }
            for (name, var_value) in &source {
                if name == key {
                    continue;
                }
                let token = format!("${{{}}}", name);
                if next.contains(&token) {
                    next = next.replace(&token, var_value);
                }
            }
            if next != *value {
                *value = next;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    ResolvedConfig {
        values: resolved,
        steps: unit.steps().map(<[StepEntry]>::to_vec),
    }
}
