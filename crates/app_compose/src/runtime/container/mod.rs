//! Container process driver
//!
//! A [`ContainerProcess`] maps one app onto a named container: it builds or
//! pulls the image, derives the container's creation options, reuses an
//! existing container when those options are unchanged and otherwise
//! recreates it, then attaches to its output and starts it.

mod build;
mod docker_cli;
mod engine;
mod spec;

pub use build::*;
pub use docker_cli::DockerCli;
pub use engine::*;
pub use spec::*;

use crate::config::{AppSpec, Environment, ScalarValue, SpecError, SubstitutionContext};
use crate::runtime::process::{lock, Process, ProcessCore, ProcessState, Signal};
use crate::runtime::single_flight::SingleFlight;
use async_trait::async_trait;
use futures::stream::StreamExt;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::AbortHandle;

/// Interval between aggregated pull progress reports
const PULL_PROGRESS_INTERVAL: Duration = Duration::from_secs(3);

/// Driver-internal variable holding the container's address
pub const IP_ADDRESS_VARIABLE: &str = "IP_ADDRESS";

/// Errors preparing or running a container
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContainerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("Building image '{image}' failed with exit code {code}")]
    BuildFailed { image: String, code: i64 },

    #[error("Cannot compute container identity: {0}")]
    Identity(String),
}

/// Apps waiting on each image pull in flight
type PullAudience = Arc<Mutex<HashMap<String, Vec<ProcessCore>>>>;

/// Container resources shared by every container app of one run
pub struct ContainerRuntime {
    engine: Arc<dyn ContainerEngine>,
    pulls: SingleFlight<String, Result<(), EngineError>>,
    pull_audience: PullAudience,
    volumes: SingleFlight<String, Result<(), EngineError>>,
    prefix: String,
    remove_containers: bool,
}

impl ContainerRuntime {
    pub fn new(engine: Arc<dyn ContainerEngine>, prefix: impl Into<String>) -> Self {
        Self {
            engine,
            pulls: SingleFlight::new(),
            pull_audience: PullAudience::default(),
            volumes: SingleFlight::new(),
            prefix: prefix.into(),
            remove_containers: false,
        }
    }

    /// Remove containers on cleanup instead of keeping them for reuse
    pub fn with_remove_containers(mut self, remove: bool) -> Self {
        self.remove_containers = remove;
        self
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Create a named volume at most once per run
    pub async fn ensure_volume(&self, name: &str) -> Result<(), EngineError> {
        let engine = self.engine.clone();
        let volume = name.to_string();
        self.volumes
            .run(name.to_string(), async move {
                log::info!("Creating volume {}", volume);
                engine.create_volume(&volume).await
            })
            .await
    }

    /// Inspect an image, pulling it first when it is not available locally
    pub async fn resolve_image(
        &self,
        reference: &str,
        core: &ProcessCore,
    ) -> Result<ImageInfo, EngineError> {
        match self.engine.inspect_image(reference).await {
            Ok(image) => return Ok(image),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        core.emit_status(format!("Pulling image {}", reference));
        lock(&self.pull_audience)
            .entry(reference.to_string())
            .or_default()
            .push(core.clone());

        let engine = self.engine.clone();
        let pull_reference = reference.to_string();
        let audience = self.pull_audience.clone();
        let pulled = self
            .pulls
            .run(reference.to_string(), async move {
                pull_with_progress(engine, pull_reference, audience).await
            })
            .await;
        lock(&self.pull_audience).remove(reference);
        pulled?;

        self.engine.inspect_image(reference).await
    }
}

/// Narrate to every live app waiting on the pull of `reference`
fn narrate(audience: &PullAudience, reference: &str, message: String) {
    let waiting = lock(audience).get(reference).cloned().unwrap_or_default();
    for core in waiting.iter().filter(|core| !core.is_ended()) {
        core.emit_status(message.clone());
    }
}

/// Run one pull, reporting aggregated progress on a fixed interval
async fn pull_with_progress(
    engine: Arc<dyn ContainerEngine>,
    reference: String,
    audience: PullAudience,
) -> Result<(), EngineError> {
    log::info!("Pulling image {}", reference);
    let mut progress = engine.pull_image(&reference).await?;
    let mut totals = PullTotals::default();
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + PULL_PROGRESS_INTERVAL,
        PULL_PROGRESS_INTERVAL,
    );

    loop {
        tokio::select! {
            update = progress.next() => match update {
                Some(Ok(update)) => totals.record(&update),
                Some(Err(e)) => return Err(e),
                None => break,
            },
            _ = ticker.tick() => narrate(&audience, &reference, totals.summary(&reference)),
        }
    }

    narrate(&audience, &reference, format!("Pulled image {}", reference));
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
struct LayerTotals {
    downloaded: u64,
    extracted: u64,
    size: u64,
    download_complete: bool,
    extract_complete: bool,
}

/// Progress summed over every layer of a pull
///
/// Engines that report no byte counts are summarized by layer counts.
#[derive(Debug, Default)]
pub struct PullTotals {
    layers: HashMap<String, LayerTotals>,
}

impl PullTotals {
    pub fn record(&mut self, progress: &PullProgress) {
        let Some(layer) = &progress.layer else {
            return;
        };
        let totals = self.layers.entry(layer.clone()).or_default();
        if let Some(total) = progress.total {
            totals.size = total;
        }
        match progress.status.as_str() {
            "Downloading" => totals.downloaded = progress.current.unwrap_or(totals.downloaded),
            "Download complete" => {
                totals.downloaded = totals.size;
                totals.download_complete = true;
            }
            "Extracting" => {
                totals.extracted = progress.current.unwrap_or(totals.extracted);
                totals.download_complete = true;
            }
            "Pull complete" | "Already exists" => {
                totals.downloaded = totals.size;
                totals.extracted = totals.size;
                totals.download_complete = true;
                totals.extract_complete = true;
            }
            _ => {}
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.layers.values().map(|l| l.downloaded).sum()
    }

    pub fn extracted(&self) -> u64 {
        self.layers.values().map(|l| l.extracted).sum()
    }

    pub fn size(&self) -> u64 {
        self.layers.values().map(|l| l.size).sum()
    }

    pub fn summary(&self, reference: &str) -> String {
        const MB: f64 = 1024.0 * 1024.0;
        if self.size() == 0 {
            let downloaded = self.layers.values().filter(|l| l.download_complete).count();
            let extracted = self.layers.values().filter(|l| l.extract_complete).count();
            return format!(
                "Pulling {}: {} layers, {} downloaded, {} extracted",
                reference,
                self.layers.len(),
                downloaded,
                extracted,
            );
        }
        format!(
            "Pulling {}: {} layers, downloaded {:.1}/{:.1} MB, extracted {:.1} MB",
            reference,
            self.layers.len(),
            self.downloaded() as f64 / MB,
            self.size() as f64 / MB,
            self.extracted() as f64 / MB,
        )
    }
}

/// An app running as a container
pub struct ContainerProcess {
    inner: Arc<ContainerInner>,
}

struct ContainerInner {
    core: ProcessCore,
    runtime: Arc<ContainerRuntime>,
    container_name: String,
    image: String,
    build: Option<BuildPlan>,
    cmd: Option<Vec<String>>,
    entrypoint: Option<Vec<String>>,
    working_dir: Option<String>,
    environment: IndexMap<String, ScalarValue>,
    host_environment: Environment,
    ports: Vec<PortSpec>,
    volumes: Vec<VolumeSpec>,
    built: OnceCell<Result<(), ContainerError>>,
    container: Mutex<Option<String>>,
    attached: AtomicBool,
    address_requested: AtomicBool,
    startup: Mutex<Option<AbortHandle>>,
    cleaned_up: OnceCell<()>,
}

impl ContainerProcess {
    /// Translate an app definition; malformed ports, volumes or commands fail here
    pub fn new(
        name: &str,
        app: &AppSpec,
        cwd: &Path,
        host_environment: Environment,
        runtime: Arc<ContainerRuntime>,
    ) -> Result<Self, SpecError> {
        let ports = app
            .ports
            .iter()
            .map(PortSpec::parse)
            .collect::<Result<Vec<_>, _>>()?;
        let volumes = app
            .volumes
            .iter()
            .map(|volume| VolumeSpec::parse(volume, cwd, runtime.prefix()))
            .collect::<Result<Vec<_>, _>>()?;
        let cmd = app.command.as_deref().map(split_command).transpose()?;
        let entrypoint = app.entrypoint.as_deref().map(split_command).transpose()?;

        let container_name = format!("{}_{}", runtime.prefix(), name);
        let image = normalize_image_reference(app.image.as_deref().unwrap_or(&container_name));
        let build = app
            .build
            .as_ref()
            .map(|spec| BuildPlan::new(spec, cwd, image.clone()));

        Ok(Self {
            inner: Arc::new(ContainerInner {
                core: ProcessCore::new(name),
                runtime,
                container_name,
                image,
                build,
                cmd,
                entrypoint,
                working_dir: app.cwd.clone(),
                environment: app.environment.clone(),
                host_environment,
                ports,
                volumes,
                built: OnceCell::new(),
                container: Mutex::new(None),
                attached: AtomicBool::new(false),
                address_requested: AtomicBool::new(false),
                startup: Mutex::new(None),
                cleaned_up: OnceCell::new(),
            }),
        })
    }

    /// Name of the engine-side container
    pub fn container_name(&self) -> &str {
        &self.inner.container_name
    }

    /// Normalized image reference this app runs
    pub fn image(&self) -> &str {
        &self.inner.image
    }

    /// Build the image if needed; runs at most once per process
    pub async fn prepare(&self) -> Result<(), ContainerError> {
        self.inner.prepare().await
    }
}

impl ContainerInner {
    async fn prepare(&self) -> Result<(), ContainerError> {
        self.built
            .get_or_init(|| async {
                match &self.build {
                    Some(plan) => self.build_image(plan).await,
                    None => Ok(()),
                }
            })
            .await
            .clone()
    }

    async fn build_image(&self, plan: &BuildPlan) -> Result<(), ContainerError> {
        let engine = self.runtime.engine();
        let hashes = plan.trigger_hashes().await;

        match engine.inspect_image(&plan.tag).await {
            Ok(image) if BuildPlan::is_up_to_date(&hashes, &image.labels) => {
                self.core.emit_status(format!(
                    "Image {} is up to date, trigger files unchanged",
                    plan.tag
                ));
                return Ok(());
            }
            Ok(_) => self
                .core
                .emit_status(format!("Trigger files changed, rebuilding {}", plan.tag)),
            Err(e) if e.is_not_found() => self
                .core
                .emit_status(format!("Image {} not found, building", plan.tag)),
            Err(e) => return Err(e.into()),
        }

        let mut output = engine.build_image(&plan.request(hashes)).await?;
        let mut code = -1;
        while let Some(event) = output.next().await {
            match event {
                BuildEvent::Line { origin, text } => {
                    log::trace!("[{}] build {:?}: {}", self.core.name(), origin, text);
                    self.core.emit_status(text);
                }
                BuildEvent::Finished { code: exit } => code = exit,
            }
        }

        if code != 0 {
            return Err(ContainerError::BuildFailed {
                image: plan.tag.clone(),
                code,
            });
        }
        Ok(())
    }

    /// Final environment: declared values win over upstream ones
    fn resolve_environment(&self, extra_environment: Environment) -> Environment {
        let mut merged = extra_environment;
        merged.extend(
            self.environment
                .iter()
                .map(|(key, value)| (key.clone(), value.as_str())),
        );
        SubstitutionContext::new()
            .with_vars(self.host_environment.clone())
            .with_vars(merged.clone())
            .substitute_env(&merged)
    }

    /// Create, recreate or reuse the container for the resolved options
    async fn prepare_container(&self, extra_environment: Environment) -> Result<(), ContainerError> {
        let engine = self.runtime.engine();
        let environment = self.resolve_environment(extra_environment);

        for volume in &self.volumes {
            if let VolumeSpec::Named { name, .. } = volume {
                self.runtime.ensure_volume(name).await?;
            }
        }

        let image = self.runtime.resolve_image(&self.image, &self.core).await?;

        let mut options = CreateOptions {
            image: image.id,
            cmd: self.cmd.clone(),
            entrypoint: self.entrypoint.clone(),
            working_dir: self.working_dir.clone(),
            ..Default::default()
        }
        .with_env(&environment)
        .with_ports(&self.ports)
        .with_volumes(&self.volumes);
        let hash = options
            .identity_hash()
            .map_err(|e| ContainerError::Identity(e.to_string()))?;
        options.labels.insert(OPTIONS_HASH_LABEL.to_string(), hash.clone());

        let name = &self.container_name;
        let reuse = match engine.inspect_container(name).await {
            Ok(existing) if existing.labels.get(OPTIONS_HASH_LABEL) == Some(&hash) => true,
            Ok(_) => {
                self.core
                    .emit_status(format!("Options of {} changed, recreating it", name));
                engine.remove_container(name, true).await?;
                false
            }
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e.into()),
        };

        if reuse {
            self.core.emit_status(format!("Re-using container {}", name));
        } else {
            log::info!("[{}] Creating container {} ({})", self.core.name(), name, options);
            engine.create_container(name, &options).await?;
        }

        *lock(&self.container) = Some(name.clone());
        Ok(())
    }

    async fn run(self: Arc<Self>, extra_environment: Environment) -> Result<(), ContainerError> {
        self.prepare().await?;
        self.prepare_container(extra_environment).await?;

        let engine = self.runtime.engine().clone();
        let name = self.container_name.clone();
        let output = engine.attach_container(&name).await?;

        let pump = self.clone();
        tokio::spawn(async move {
            let on_output = pump.clone();
            pump.core
                .forward_output(output, move || {
                    if on_output.core.mark_started() {
                        on_output.clone().resolve_address();
                    }
                })
                .await;

            let code = match pump.runtime.engine().inspect_container(&pump.container_name).await {
                Ok(info) => info.exit_code,
                Err(e) => {
                    pump.core.emit_error(ContainerError::from(e));
                    -1
                }
            };
            pump.core.mark_exited(code);
            pump.cleanup().await;
        });
        self.attached.store(true, Ordering::SeqCst);

        engine.start_container(&name).await?;
        self.core.mark_started();
        self.clone().resolve_address();
        Ok(())
    }

    /// Inspect the running container once and publish its address
    fn resolve_address(self: Arc<Self>) {
        if self.address_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(async move {
            let address = match self.runtime.engine().inspect_container(&self.container_name).await {
                Ok(info) => info.ip_address,
                Err(e) => {
                    log::warn!("[{}] Cannot resolve container address: {}", self.core.name(), e);
                    String::new()
                }
            };
            if !address.is_empty() {
                self.core.set_variable(IP_ADDRESS_VARIABLE, address.clone());
            }
            self.core.set_address(address);
        });
    }

    async fn cleanup(&self) {
        self.cleaned_up
            .get_or_init(|| async {
                let Some(name) = lock(&self.container).clone() else {
                    return;
                };
                if !self.runtime.remove_containers {
                    log::debug!("[{}] Keeping container {}", self.core.name(), name);
                    return;
                }
                if let Err(e) = self.runtime.engine().remove_container(&name, true).await {
                    log::debug!("[{}] Failed to remove container {}: {}", self.core.name(), name, e);
                }
            })
            .await;
    }
}

#[async_trait]
impl Process for ContainerProcess {
    fn core(&self) -> &ProcessCore {
        &self.inner.core
    }

    async fn start(&self, extra_environment: Environment) {
        let core = &self.inner.core;
        if core.state() != ProcessState::Created || lock(&self.inner.startup).is_some() {
            log::debug!("[{}] Not starting, state is {:?}", core.name(), core.state());
            return;
        }

        log::info!("[{}] Starting container {}", core.name(), self.inner.container_name);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = inner.clone().run(extra_environment).await {
                log::error!("[{}] {}", inner.core.name(), e);
                inner.core.fail(e);
            }
        });
        *lock(&self.inner.startup) = Some(task.abort_handle());
    }

    async fn kill(&self, signal: Signal) -> bool {
        let inner = &self.inner;
        let startup = lock(&inner.startup).clone();
        let Some(startup) = startup else {
            return false;
        };
        // Cancels a startup still in progress; a no-op once it finished
        startup.abort();
        if inner.core.is_ended() {
            return false;
        }

        let container = lock(&inner.container).clone();
        let Some(name) = container.filter(|_| inner.attached.load(Ordering::SeqCst)) else {
            // Startup was abandoned before the container ever ran
            log::debug!("[{}] Abandoning container startup", inner.core.name());
            inner.core.abandon();
            return false;
        };

        inner.core.mark_exiting(signal);
        if let Err(e) = inner.runtime.engine().kill_container(&name, signal).await {
            log::debug!("[{}] Failed to send {}: {}", inner.core.name(), signal, e);
        }
        if signal == Signal::Kill {
            inner.cleanup().await;
        }
        true
    }

    async fn cleanup(&self) {
        self.inner.cleanup().await;
    }

    async fn resolve_host(&self) -> Option<String> {
        let core = &self.inner.core;
        // A lookup once started always publishes an address, even after exit
        let requested = || self.inner.address_requested.load(Ordering::SeqCst);
        let mut address = core.watch_address();
        let resolved = loop {
            if let Some(resolved) = address.borrow_and_update().clone() {
                break resolved;
            }
            if core.is_ended() && !requested() {
                return None;
            }
            tokio::select! {
                changed = address.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = core.wait_until_ended(), if !requested() => {}
            }
        };
        Some(if resolved.is_empty() {
            "localhost".to_string()
        } else {
            resolved
        })
    }

    fn declared_tcp_ports(&self) -> Option<Vec<u16>> {
        Some(
            self.inner
                .ports
                .iter()
                .filter(|port| port.protocol == Protocol::Tcp)
                .map(|port| port.source_port)
                .collect(),
        )
    }
}

impl std::fmt::Debug for ContainerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerProcess")
            .field("core", &self.inner.core)
            .field("container", &self.inner.container_name)
            .field("image", &self.inner.image)
            .finish()
    }
}
