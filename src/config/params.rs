use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Deserialize;

use crate::{Error, Result};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.-]*)\}").expect("valid placeholder regex"));

/// Values for `${name}` placeholders in a task file.
#[derive(Debug, Clone, Default)]
pub struct Params {
    values: HashMap<String, String>,
}

impl Params {
    /// Create empty params.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter value, replacing any earlier one.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Get a parameter value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Check if no values were given.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse `-P key=value` arguments. The value may itself contain `=`.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut params = Self::new();
        for arg in args {
            let (key, value) = arg
                .split_once('=')
                .filter(|(key, _)| !key.trim().is_empty())
                .ok_or_else(|| {
                    Error::Config(format!("invalid param '{}', expected key=value", arg))
                })?;
            params
                .values
                .insert(key.trim().to_string(), value.to_string());
        }
        Ok(params)
    }
}

/// A declared placeholder.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParamDef {
    /// Whether a value must be given when there is no default.
    #[serde(default)]
    pub required: bool,

    /// Value used when none is given.
    pub default: Option<String>,

    /// Shown by `pagepilot check`.
    pub description: Option<String>,
}

/// Replace every known `${name}` in `template`. Given values win over
/// defaults; an undeclared name is left untouched.
pub fn substitute(
    template: &str,
    params: &Params,
    defs: &HashMap<String, ParamDef>,
) -> Result<String> {
    let mut missing = None;
    let result = PLACEHOLDER_RE.replace_all(template, |caps: &Captures| {
        let name = &caps[1];
        if let Some(value) = params.get(name) {
            return value.to_string();
        }
        match defs.get(name) {
            Some(ParamDef {
                default: Some(default),
                ..
            }) => default.clone(),
            Some(def) => {
                if def.required && missing.is_none() {
                    missing = Some(name.to_string());
                }
                String::new()
            }
            None => caps[0].to_string(),
        }
    });
    if let Some(name) = missing {
        return Err(Error::Config(format!("missing required parameter: {}", name)));
    }
    Ok(result.into_owned())
}

/// Substitute inside every string of a YAML tree.
pub fn substitute_value(
    value: &mut serde_yaml::Value,
    params: &Params,
    defs: &HashMap<String, ParamDef>,
) -> Result<()> {
    match value {
        serde_yaml::Value::String(s) => *s = substitute(s, params, defs)?,
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                substitute_value(v, params, defs)?;
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for v in seq.iter_mut() {
                substitute_value(v, params, defs)?;
            }
        }
        _ => {}
    }
    Ok(())
}
