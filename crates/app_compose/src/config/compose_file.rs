//! Compose file YAML schema definitions

use crate::runtime::Signal;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Root compose file configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeFile {
    /// Variables added on top of the host environment for every app
    #[serde(default)]
    pub environment: IndexMap<String, ScalarValue>,

    /// App definitions (ordered map for deterministic start wiring)
    pub apps: IndexMap<String, AppSpec>,
}

/// Scalar values can be strings, booleans, or numbers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ScalarValue {
    /// Convert to string representation
    pub fn as_str(&self) -> String {
        match self {
            ScalarValue::Bool(b) => b.to_string(),
            ScalarValue::Int(i) => i.to_string(),
            ScalarValue::Float(f) => f.to_string(),
            ScalarValue::String(s) => s.clone(),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// A single app entry, either a native command or a container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSpec {
    /// Shell command (native) or container command override
    #[serde(default)]
    pub command: Option<String>,

    /// Container image reference
    #[serde(default)]
    pub image: Option<String>,

    /// Container image build instructions
    #[serde(default)]
    pub build: Option<BuildSpec>,

    /// Container entrypoint override
    #[serde(default)]
    pub entrypoint: Option<String>,

    /// Working directory inside the container
    #[serde(default)]
    pub cwd: Option<String>,

    /// Environment variables for this app
    #[serde(default)]
    pub environment: IndexMap<String, ScalarValue>,

    /// Apps that must be ready before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Variables published to direct dependents once ready
    #[serde(default)]
    pub export: IndexMap<String, ScalarValue>,

    /// Readiness criteria
    #[serde(default)]
    pub ready: Option<ReadySpec>,

    /// Signal sent on the first interrupt
    #[serde(default)]
    pub quit_signal: Signal,

    /// Container port definitions (`source[:host][/protocol]`)
    #[serde(default)]
    pub ports: Vec<PortValue>,

    /// Container volume definitions (`source:target` or `/anonymous`)
    #[serde(default)]
    pub volumes: Vec<String>,
}

/// Image build instructions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Build context, relative to the working directory
    #[serde(default)]
    pub context: Option<String>,

    /// Dockerfile path, relative to the context
    #[serde(default)]
    pub dockerfile: Option<String>,

    /// Extra files whose content changes force a rebuild
    #[serde(default)]
    pub trigger_files: Vec<String>,
}

/// Readiness criteria; all declared conditions must be met
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadySpec {
    /// Regular expression matched against output lines
    #[serde(default)]
    pub wait_for_log: Option<String>,

    /// Ports that must accept TCP connections
    #[serde(default)]
    pub wait_for_ports: Option<WaitForPorts>,

    /// Ready only once the process has exited
    #[serde(default)]
    pub when_done: Option<bool>,
}

/// `wait_for_ports` is either a list of ports or `true` for every declared TCP port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaitForPorts {
    All(bool),
    List(Vec<PortValue>),
}

/// Ports may be written as numbers or strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u32),
    Text(String),
}

impl fmt::Display for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortValue::Number(n) => write!(f, "{}", n),
            PortValue::Text(s) => f.write_str(s),
        }
    }
}

/// How an app is driven, decided by the presence of `image`/`build`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppKind<'a> {
    Native { command: &'a str },
    Container,
}

impl AppSpec {
    /// Classify this app as a native command or a container
    pub fn kind(&self) -> Result<AppKind<'_>, SpecError> {
        if self.image.is_some() || self.build.is_some() {
            return Ok(AppKind::Container);
        }
        match self.command.as_deref().map(str::trim) {
            Some(command) if !command.is_empty() => Ok(AppKind::Native { command }),
            _ => Err(SpecError::MissingCommand),
        }
    }

    fn is_container(&self) -> bool {
        self.image.is_some() || self.build.is_some()
    }
}

impl ComposeFile {
    /// Load compose file from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ComposeFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ComposeFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse compose file from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ComposeFileError> {
        let compose_file: ComposeFile =
            serde_yaml::from_str(content).map_err(ComposeFileError::Parse)?;
        compose_file.validate()?;
        Ok(compose_file)
    }

    /// Validate the compose file configuration
    pub fn validate(&self) -> Result<(), ComposeFileError> {
        for (name, app) in &self.apps {
            if !app.is_container() {
                let container_only = [
                    ("ports", !app.ports.is_empty()),
                    ("volumes", !app.volumes.is_empty()),
                    ("entrypoint", app.entrypoint.is_some()),
                    ("cwd", app.cwd.is_some()),
                ];
                if let Some((field, _)) = container_only.iter().find(|(_, set)| *set) {
                    return Err(ComposeFileError::Validation(format!(
                        "App '{}': '{}' is only valid for container apps (set 'image' or 'build')",
                        name, field
                    )));
                }
            }

            let Some(ready) = &app.ready else {
                continue;
            };

            if ready.when_done == Some(false) {
                return Err(ComposeFileError::Validation(format!(
                    "App '{}': 'when_done' can only be true",
                    name
                )));
            }

            if let Some(pattern) = &ready.wait_for_log {
                if pattern.is_empty() {
                    return Err(ComposeFileError::Validation(format!(
                        "App '{}': 'wait_for_log' must not be empty",
                        name
                    )));
                }
                if let Err(e) = Regex::new(pattern) {
                    return Err(ComposeFileError::Validation(format!(
                        "App '{}': invalid 'wait_for_log' pattern: {}",
                        name, e
                    )));
                }
            }
        }

        Ok(())
    }

    /// Names of the apps that run as containers
    pub fn container_apps(&self) -> Vec<&str> {
        self.apps
            .iter()
            .filter(|(_, app)| app.is_container())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Errors that can occur when loading a compose file
#[derive(Debug, thiserror::Error)]
pub enum ComposeFileError {
    #[error("Failed to read compose file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse compose file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Errors in the shape of a single app, fatal for that app only
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("You need to specify a command")]
    MissingCommand,

    #[error("Cannot parse port definition: {0}")]
    InvalidPort(String),

    #[error("Cannot parse volume definition: {0}")]
    InvalidVolume(String),

    #[error("Cannot parse command line: {0}")]
    InvalidCommand(String),
}
