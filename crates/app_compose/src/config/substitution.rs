//! Substitution engine for `$VAR` and `${VAR}` references

use crate::config::ScalarValue;
use indexmap::IndexMap;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Regex for matching variable references: $NAME or ${NAME}
static VARIABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:([A-Za-z_][A-Za-z0-9_]*)|\{([A-Za-z_][A-Za-z0-9_]*)\})").unwrap()
});

/// Variable mapping handed to processes and used for substitution
pub type Environment = HashMap<String, String>;

/// Substitution context containing all available variables
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    /// Variables available for substitution
    pub vars: Environment,
}

impl SubstitutionContext {
    /// Create a new, empty substitution context
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Add multiple variables; later values override earlier ones
    pub fn with_vars<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.vars.extend(vars);
        self
    }

    /// Substitute all references in a string (single pass)
    pub fn substitute(&self, input: &str) -> String {
        VARIABLE_PATTERN
            .replace_all(input, |caps: &Captures| self.resolve_capture(caps))
            .into_owned()
    }

    /// Substitute every value of an environment map
    pub fn substitute_env(&self, env: &Environment) -> Environment {
        env.iter()
            .map(|(key, value)| (key.clone(), self.substitute(value)))
            .collect()
    }

    /// Render scalar values to strings, substituting inside string values only
    pub fn substitute_scalars(&self, values: &IndexMap<String, ScalarValue>) -> Environment {
        values
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    ScalarValue::String(s) => self.substitute(s),
                    other => other.as_str(),
                };
                (key.clone(), rendered)
            })
            .collect()
    }

    /// Resolve a single capture group
    fn resolve_capture(&self, caps: &Captures) -> String {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let Some(name) = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()) else {
            return whole.to_string();
        };

        if let Some(value) = self.vars.get(name) {
            return value.clone();
        }

        log::warn!(
            "Substituted variable {} but it is not defined, using an empty string",
            name
        );
        String::new()
    }
}
