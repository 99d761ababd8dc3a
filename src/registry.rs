//! Effect registry.
//!
//! Maps an effect type name to its constructor and its descriptive
//! metadata. The registry is built once at startup, then shared read-only
//! with every chain.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use thiserror::Error;
use tracing::debug;

use crate::effect::{ConfigError, Effect};
use crate::lamp_types::EffectArgs;

pub type EffectConstructor = fn(&EffectParams) -> Result<Box<dyn Effect>, ConfigError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Effect '{0}' is already registered")]
    DuplicateEffect(String),
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Debug, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ParamKind {
    Float,
    Int,
    Text,
}

/// Schema of one effect parameter.
#[derive(Clone, Serialize, Debug)]
pub struct ParamSpec {
    /// Key in the effect's `args`
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub kind: ParamKind,
    /// Parameters without a default are required
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Allowed values for text parameters; empty means any text
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl ParamSpec {
    fn new(kind: ParamKind, name: &str, display_name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            description: description.to_string(),
            kind,
            default: None,
            min: None,
            max: None,
            options: Vec::new(),
        }
    }

    pub fn float(name: &str, display_name: &str, description: &str) -> Self {
        Self::new(ParamKind::Float, name, display_name, description)
    }

    pub fn int(name: &str, display_name: &str, description: &str) -> Self {
        Self::new(ParamKind::Int, name, display_name, description)
    }

    pub fn text(name: &str, display_name: &str, description: &str) -> Self {
        Self::new(ParamKind::Text, name, display_name, description)
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|o| o.to_string()).collect();
        self
    }

    fn check(&self, effect: &str, value: &Value) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::invalid(effect, &self.name, reason);
        match self.kind {
            ParamKind::Text => {
                let text = value
                    .as_str()
                    .ok_or_else(|| invalid(format!("expected text, got {value}")))?;
                if !self.options.is_empty() && !self.options.iter().any(|o| o == text) {
                    return Err(invalid(format!(
                        "'{text}' is not one of {}",
                        self.options.join(", ")
                    )));
                }
                Ok(())
            }
            ParamKind::Float | ParamKind::Int => {
                let number = value
                    .as_f64()
                    .ok_or_else(|| invalid(format!("expected a number, got {value}")))?;
                if self.kind == ParamKind::Int && number.fract() != 0.0 {
                    return Err(invalid(format!("expected an integer, got {number}")));
                }
                if let Some(min) = self.min.filter(|min| number < *min) {
                    return Err(invalid(format!("{number} is below the minimum {min}")));
                }
                if let Some(max) = self.max.filter(|max| number > *max) {
                    return Err(invalid(format!("{number} is above the maximum {max}")));
                }
                Ok(())
            }
        }
    }
}

/// Descriptive metadata of an effect type.
#[derive(Clone, Serialize, Debug)]
pub struct EffectMetadata {
    pub display_name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub parameters: Vec<ParamSpec>,
}

impl EffectMetadata {
    pub fn new(display_name: &str, description: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            description: description.to_string(),
            tags: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ParamSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Resolved, validated arguments handed to a constructor.
pub struct EffectParams<'a> {
    effect: &'a str,
    args: &'a EffectArgs,
}

impl<'a> EffectParams<'a> {
    pub fn new(effect: &'a str, args: &'a EffectArgs) -> Self {
        Self { effect, args }
    }

    pub fn effect(&self) -> &str {
        self.effect
    }

    fn get(&self, name: &str) -> Result<&'a Value, ConfigError> {
        self.args
            .get(name)
            .ok_or_else(|| ConfigError::MissingArgument {
                effect: self.effect.to_string(),
                param: name.to_string(),
            })
    }

    pub fn float(&self, name: &str) -> Result<f64, ConfigError> {
        let value = self.get(name)?;
        value
            .as_f64()
            .ok_or_else(|| ConfigError::invalid(self.effect, name, format!("expected a number, got {value}")))
    }

    pub fn int(&self, name: &str) -> Result<i64, ConfigError> {
        let number = self.float(name)?;
        if number.fract() != 0.0 {
            return Err(ConfigError::invalid(
                self.effect,
                name,
                format!("expected an integer, got {number}"),
            ));
        }
        Ok(number as i64)
    }

    pub fn text(&self, name: &str) -> Result<&'a str, ConfigError> {
        let value = self.get(name)?;
        value
            .as_str()
            .ok_or_else(|| ConfigError::invalid(self.effect, name, format!("expected text, got {value}")))
    }
}

struct RegisteredEffect {
    constructor: EffectConstructor,
    metadata: EffectMetadata,
}

#[derive(Default)]
pub struct EffectRegistry {
    effects: BTreeMap<String, RegisteredEffect>,
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in effect.
    pub fn with_builtins() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        crate::builtin_effects::register_builtins(&mut registry)?;
        Ok(registry)
    }

    pub fn register(
        &mut self,
        name: &str,
        metadata: EffectMetadata,
        constructor: EffectConstructor,
    ) -> Result<(), RegistryError> {
        if self.effects.contains_key(name) {
            return Err(RegistryError::DuplicateEffect(name.to_string()));
        }
        self.effects.insert(
            name.to_string(),
            RegisteredEffect {
                constructor,
                metadata,
            },
        );
        Ok(())
    }

    /// Builds a fresh instance of `name`.
    ///
    /// Missing optional arguments take their declared defaults; every
    /// declared parameter is checked against its kind, range and options
    /// before the constructor runs.
    pub fn construct(&self, name: &str, args: &EffectArgs) -> Result<Box<dyn Effect>, ConfigError> {
        let entry = self
            .effects
            .get(name)
            .ok_or_else(|| ConfigError::UnknownEffect(name.to_string()))?;

        let mut resolved = args.clone();
        for param in &entry.metadata.parameters {
            match resolved.get(&param.name) {
                Some(value) => param.check(name, value)?,
                None => match &param.default {
                    Some(default) => {
                        resolved.insert(param.name.clone(), default.clone());
                    }
                    None => {
                        return Err(ConfigError::MissingArgument {
                            effect: name.to_string(),
                            param: param.name.clone(),
                        });
                    }
                },
            }
        }
        for key in args.keys() {
            if entry.metadata.parameter(key).is_none() {
                debug!(effect = name, arg = %key, "ignoring undeclared effect argument");
            }
        }

        (entry.constructor)(&EffectParams::new(name, &resolved))
    }

    /// Inserts declared defaults for arguments absent from `args`.
    /// Returns whether anything was added. Unknown names are left alone.
    pub fn fill_defaults(&self, name: &str, args: &mut EffectArgs) -> bool {
        let Some(entry) = self.effects.get(name) else {
            return false;
        };
        let mut changed = false;
        for param in &entry.metadata.parameters {
            if let Some(default) = &param.default {
                if !args.contains_key(&param.name) {
                    args.insert(param.name.clone(), default.clone());
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn list_available(&self) -> Vec<&str> {
        self.effects.keys().map(String::as_str).collect()
    }

    pub fn metadata(&self, name: &str) -> Option<&EffectMetadata> {
        self.effects.get(name).map(|e| &e.metadata)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.effects.contains_key(name)
    }

    /// Markdown reference of every registered effect, sorted by type name.
    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Effects\n\n");
        for (name, entry) in &self.effects {
            let meta = &entry.metadata;
            let _ = writeln!(out, "## {} (`{name}`)\n", meta.display_name);
            let _ = writeln!(out, "{}\n", meta.description);
            if !meta.tags.is_empty() {
                let mut tags = meta.tags.clone();
                tags.sort();
                let _ = writeln!(out, "**Tags**: {}\n", tags.join(", "));
            }
            if !meta.parameters.is_empty() {
                out.push_str("| Parameter | Name | Type | Default | Min | Max | Description |\n");
                out.push_str("|---|---|---|---|---|---|---|\n");
                let dash = || String::from("-");
                for p in &meta.parameters {
                    let default = p.default.as_ref().map(|d| d.to_string()).unwrap_or_else(dash);
                    let min = p.min.map(|m| m.to_string()).unwrap_or_else(dash);
                    let max = p.max.map(|m| m.to_string()).unwrap_or_else(dash);
                    let _ = writeln!(
                        out,
                        "| {} | {} | {} | {default} | {min} | {max} | {} |",
                        p.name, p.display_name, p.kind, p.description
                    );
                }
                out.push('\n');
            }
        }
        out
    }
}
