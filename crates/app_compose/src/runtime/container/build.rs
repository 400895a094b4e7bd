//! Image build change detection
//!
//! Every file that can influence an image build (the Dockerfile plus any
//! declared trigger files) is digested and recorded as a label on the built
//! image. A later run rebuilds only when one of those digests changed.

use crate::config::BuildSpec;
use crate::runtime::container::engine::BuildRequest;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Prefix of the image labels recording trigger file digests
pub const TRIGGER_LABEL_PREFIX: &str = "AppComposeTriggerHash.";

/// Digest recorded for a trigger file that could not be read
const MISSING_FILE_HASH: &str = "missing";

const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Resolved build instructions for one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub tag: String,
    pub context: PathBuf,
    /// Relative to the context
    pub dockerfile: PathBuf,
    /// Relative to the context
    pub trigger_files: Vec<PathBuf>,
}

impl BuildPlan {
    /// Resolve a build spec against the compose file's directory
    pub fn new(spec: &BuildSpec, cwd: &Path, tag: impl Into<String>) -> Self {
        let context = match spec.context.as_deref() {
            Some(context) => cwd.join(context),
            None => cwd.to_path_buf(),
        };
        Self {
            tag: tag.into(),
            context,
            dockerfile: PathBuf::from(spec.dockerfile.as_deref().unwrap_or(DEFAULT_DOCKERFILE)),
            trigger_files: spec.trigger_files.iter().map(PathBuf::from).collect(),
        }
    }

    /// Files whose content decides whether a rebuild is needed
    fn tracked_files(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.dockerfile).chain(self.trigger_files.iter())
    }

    /// Digest every tracked file, keyed by image label
    pub async fn trigger_hashes(&self) -> BTreeMap<String, String> {
        let mut hashes = BTreeMap::new();
        for file in self.tracked_files() {
            let label = format!("{}{}", TRIGGER_LABEL_PREFIX, file.display());
            let hash = match tokio::fs::read(self.context.join(file)).await {
                Ok(content) => hex::encode(Sha256::digest(&content)),
                Err(e) => {
                    log::debug!("Cannot read trigger file {}: {}", file.display(), e);
                    MISSING_FILE_HASH.to_string()
                }
            };
            hashes.insert(label, hash);
        }
        hashes
    }

    /// An image is current when every digest matches its recorded label
    pub fn is_up_to_date(hashes: &BTreeMap<String, String>, labels: &HashMap<String, String>) -> bool {
        hashes
            .iter()
            .all(|(label, hash)| labels.get(label) == Some(hash))
    }

    pub fn request(&self, hashes: BTreeMap<String, String>) -> BuildRequest {
        BuildRequest {
            tag: self.tag.clone(),
            context: self.context.clone(),
            dockerfile: self.dockerfile.clone(),
            labels: hashes,
        }
    }
}
