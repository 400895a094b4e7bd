//! Container engine interface

use crate::runtime::container::spec::CreateOptions;
use crate::runtime::process::{OutputStream, Signal};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Stream of progress updates for one image pull
pub type PullStream = BoxStream<'static, Result<PullProgress, EngineError>>;

/// Stream of image build output, ending with [`BuildEvent::Finished`]
pub type BuildStream = BoxStream<'static, BuildEvent>;

/// Locally available image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    /// Image id (content digest)
    pub id: String,
    pub labels: HashMap<String, String>,
}

/// Existing container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub labels: HashMap<String, String>,
    pub exit_code: i64,
    /// Address on the default network; empty when not attached to one
    pub ip_address: String,
}

/// Progress of one layer of an image pull
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullProgress {
    pub layer: Option<String>,
    pub status: String,
    pub current: Option<u64>,
    pub total: Option<u64>,
}

/// Image build invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Tag given to the built image
    pub tag: String,
    pub context: PathBuf,
    pub dockerfile: PathBuf,
    pub labels: BTreeMap<String, String>,
}

/// Which output channel a build line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputOrigin {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    Line { origin: OutputOrigin, text: String },
    Finished { code: i64 },
}

/// Client of a container engine, addressing containers by name
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo, EngineError>;

    async fn pull_image(&self, reference: &str) -> Result<PullStream, EngineError>;

    async fn build_image(&self, request: &BuildRequest) -> Result<BuildStream, EngineError>;

    /// Create a container and return its id
    async fn create_container(
        &self,
        name: &str,
        options: &CreateOptions,
    ) -> Result<String, EngineError>;

    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo, EngineError>;

    async fn start_container(&self, name: &str) -> Result<(), EngineError>;

    async fn kill_container(&self, name: &str, signal: Signal) -> Result<(), EngineError>;

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), EngineError>;

    /// Attach to the combined output of a container
    async fn attach_container(&self, name: &str) -> Result<OutputStream, EngineError>;

    async fn create_volume(&self, name: &str) -> Result<(), EngineError>;
}

/// Container engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("No such object: {0}")]
    NotFound(String),

    #[error("'{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("Failed to run '{command}': {message}")]
    Io { command: String, message: String },

    #[error("Failed to decode engine response: {0}")]
    Decode(String),
}

impl EngineError {
    /// Expected "no such image/container" condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}
