//! Translation of app definitions into container creation options

use crate::config::{PortValue, SpecError};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

/// Label carrying the identity hash of a container's creation options
pub const OPTIONS_HASH_LABEL: &str = "AppComposeOptionsHash";

static PORT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(?::(\d+))?(?:/(tcp|udp|sctp))?$").unwrap());

static VOLUME_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^([^:]+):(.+)$").unwrap());

/// Names the engine treats as named volumes rather than host paths
static NAMED_VOLUME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap());

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

/// Parsed `sourcePort[:hostPort][/protocol]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    /// Port inside the container
    pub source_port: u16,
    /// Port published on the host
    pub host_port: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn parse(definition: &PortValue) -> Result<Self, SpecError> {
        let text = definition.to_string();
        let invalid = || SpecError::InvalidPort(text.clone());
        let caps = PORT_PATTERN.captures(&text).ok_or_else(invalid)?;

        let source_port: u16 = caps[1].parse().map_err(|_| invalid())?;
        let host_port: u16 = match caps.get(2) {
            Some(host) => host.as_str().parse().map_err(|_| invalid())?,
            None => source_port,
        };
        let protocol = match caps.get(3).map(|m| m.as_str()) {
            Some("udp") => Protocol::Udp,
            Some("sctp") => Protocol::Sctp,
            _ => Protocol::Tcp,
        };

        Ok(Self {
            source_port,
            host_port,
            protocol,
        })
    }

    /// Engine key for this port, e.g. `8080/tcp`
    pub fn engine_key(&self) -> String {
        format!("{}/{}", self.source_port, self.protocol.as_str())
    }
}

/// Parsed volume definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSpec {
    /// Engine-managed volume, already prefixed with the project name
    Named { name: String, target: String },
    /// Host directory bind mount
    Bind { source: PathBuf, target: String },
    /// Anonymous volume inside the container
    Anonymous { target: String },
}

impl VolumeSpec {
    /// Parse `source:target` or a bare `/path`
    pub fn parse(definition: &str, cwd: &Path, prefix: &str) -> Result<Self, SpecError> {
        if let Some(caps) = VOLUME_PATTERN.captures(definition) {
            let source = &caps[1];
            let target = caps[2].to_string();
            if NAMED_VOLUME_PATTERN.is_match(source) {
                return Ok(VolumeSpec::Named {
                    name: format!("{}_{}", prefix, source),
                    target,
                });
            }
            return Ok(VolumeSpec::Bind {
                source: normalize_path(&cwd.join(source)),
                target,
            });
        }

        if definition.starts_with('/') {
            return Ok(VolumeSpec::Anonymous {
                target: definition.to_string(),
            });
        }

        Err(SpecError::InvalidVolume(definition.to_string()))
    }

    /// `source:target` string for bind-style volumes
    pub fn bind(&self) -> Option<String> {
        match self {
            VolumeSpec::Named { name, target } => Some(format!("{}:{}", name, target)),
            VolumeSpec::Bind { source, target } => {
                Some(format!("{}:{}", source.display(), target))
            }
            VolumeSpec::Anonymous { .. } => None,
        }
    }
}

/// Lexically resolve `.` and `..` in an absolute path
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Project prefix derived from a directory name (lowercase alphanumerics)
pub fn project_prefix(cwd: &Path) -> String {
    let prefix: String = cwd
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if prefix.is_empty() {
        "default".to_string()
    } else {
        prefix
    }
}

/// Append `:latest` when a reference carries neither tag nor digest
pub fn normalize_image_reference(reference: &str) -> String {
    let last_segment = reference.rsplit('/').next().unwrap_or(reference);
    if last_segment.contains(':') || last_segment.contains('@') {
        reference.to_string()
    } else {
        format!("{}:latest", reference)
    }
}

/// Split a command line into arguments, honoring quotes and backslashes
pub fn split_command(command: &str) -> Result<Vec<String>, SpecError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => match chars.next() {
                Some(next) => {
                    current.push(next);
                    in_word = true;
                }
                None => return Err(SpecError::InvalidCommand(command.to_string())),
            },
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(SpecError::InvalidCommand(command.to_string()));
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

/// Host side of a published port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

/// Fully resolved container creation options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateOptions {
    /// Image id (digest) the container runs
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    /// `KEY=value` pairs, sorted
    pub env: Vec<String>,
    pub exposed_ports: BTreeSet<String>,
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    pub binds: Vec<String>,
    /// Anonymous volume targets
    pub volumes: BTreeSet<String>,
    pub working_dir: Option<String>,
    /// Not part of the identity
    #[serde(skip)]
    pub labels: BTreeMap<String, String>,
}

impl CreateOptions {
    /// Set environment from a map, in a deterministic order
    pub fn with_env<'a, I>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut pairs: Vec<String> = env
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        pairs.sort();
        self.env = pairs;
        self
    }

    /// Expose and publish ports on all interfaces
    pub fn with_ports(mut self, ports: &[PortSpec]) -> Self {
        for port in ports {
            let key = port.engine_key();
            self.exposed_ports.insert(key.clone());
            self.port_bindings.entry(key).or_default().push(PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: port.host_port.to_string(),
            });
        }
        self
    }

    pub fn with_volumes(mut self, volumes: &[VolumeSpec]) -> Self {
        for volume in volumes {
            match volume {
                VolumeSpec::Anonymous { target } => {
                    self.volumes.insert(target.clone());
                }
                other => self.binds.extend(other.bind()),
            }
        }
        self
    }

    /// Deterministic digest of everything that shapes the container
    pub fn identity_hash(&self) -> Result<String, serde_json::Error> {
        let canonical = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}

impl fmt::Display for CreateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.image)?;
        if let Some(cmd) = &self.cmd {
            write!(f, " {}", cmd.join(" "))?;
        }
        Ok(())
    }
}
