//! Orchestrator - creates app processes and starts them in dependency order

use crate::config::{AppKind, AppSpec, ComposeFile, Environment, SpecError, SubstitutionContext};
use crate::console::{self, ConsoleSink, LineSink};
use crate::runtime::container::{
    project_prefix, ContainerEngine, ContainerProcess, ContainerRuntime, DockerCli,
};
use crate::runtime::dependency::{DependencyError, DependencyGraph};
use crate::runtime::native::{NativeProcess, ShellSpawner, Spawner};
use crate::runtime::process::{lock, Process, ProcessState, Signal, Subscription};
use crate::runtime::readiness::{ProbeTiming, ReadinessEvaluator};
use crate::runtime::shutdown::ShutdownTimeouts;
use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory apps run in and relative paths resolve against
    pub working_dir: PathBuf,
    /// Prefix of container and volume names; derived from `working_dir` when unset
    pub project: Option<String>,
    /// Remove containers on cleanup instead of keeping them for reuse
    pub remove_containers: bool,
    pub shutdown: ShutdownTimeouts,
    pub probe: ProbeTiming,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            project: None,
            remove_containers: false,
            shutdown: ShutdownTimeouts::default(),
            probe: ProbeTiming::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn project_prefix(&self) -> String {
        self.project
            .clone()
            .unwrap_or_else(|| project_prefix(&self.working_dir))
    }
}

/// A created process with the definition it was created from
#[derive(Clone)]
pub struct RegisteredProcess {
    pub process: Arc<dyn Process>,
    pub app: AppSpec,
}

/// Every process of a run, keyed by app name
///
/// Filled once by [`Orchestrator::create_processes`] and read-only afterwards.
#[derive(Default)]
pub struct ProcessRegistry {
    entries: IndexMap<String, RegisteredProcess>,
    shutting_down: AtomicBool,
}

impl ProcessRegistry {
    pub fn get(&self, name: &str) -> Option<&RegisteredProcess> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RegisteredProcess)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Processes with a live handle, with their configured quit signals
    pub fn live_processes(&self) -> Vec<(Arc<dyn Process>, Signal)> {
        self.entries
            .values()
            .filter(|entry| entry.process.core().state().is_live())
            .map(|entry| (entry.process.clone(), entry.app.quit_signal))
            .collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop starting apps; apps not yet started will never run
    pub async fn begin_shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for (name, entry) in &self.entries {
            let process = &entry.process;
            if process.core().state() != ProcessState::Created {
                continue;
            }
            // A container mid-startup is cancelled by kill
            if !process.kill(Signal::Kill).await {
                log::debug!("[{}] Never started", name);
                process.core().abandon();
            }
        }
    }

    /// Release whatever the processes left behind, ended or not
    pub async fn cleanup(&self) {
        let cleanups = self.entries.values().map(|entry| entry.process.cleanup());
        futures::future::join_all(cleanups).await;
    }

    /// Wait until every process reached `Ended`
    pub async fn wait_all_ended(&self) {
        let waits = self
            .entries
            .values()
            .map(|entry| entry.process.core().wait_until_ended());
        futures::future::join_all(waits).await;
    }
}

/// Creates and starts the apps of a compose file
pub struct Orchestrator {
    config: OrchestratorConfig,
    compose: ComposeFile,
    host_environment: Environment,
    spawner: Arc<dyn Spawner>,
    engine: Arc<dyn ContainerEngine>,
    sink: Arc<dyn LineSink>,
    graph: Option<DependencyGraph>,
    registry: Option<Arc<ProcessRegistry>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Orchestrator {
    /// Create an orchestrator with the shell spawner, docker CLI and console sink
    pub fn new(compose: ComposeFile, config: OrchestratorConfig) -> Self {
        let sink = ConsoleSink::new(compose.apps.keys().map(String::as_str));
        Self {
            config,
            compose,
            host_environment: std::env::vars().collect(),
            spawner: Arc::new(ShellSpawner::default()),
            engine: Arc::new(DockerCli::default()),
            sink: Arc::new(sink),
            graph: None,
            registry: None,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn ContainerEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LineSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the inherited host environment used for substitution
    pub fn with_host_environment(mut self, environment: Environment) -> Self {
        self.host_environment = environment;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Top-level `environment`, resolved against the host environment
    fn compose_environment(&self) -> Environment {
        SubstitutionContext::new()
            .with_vars(self.host_environment.clone())
            .substitute_scalars(&self.compose.environment)
    }

    /// Host variables extended by the top-level `environment`
    fn host_variables(&self) -> Environment {
        let mut variables = self.host_environment.clone();
        variables.extend(self.compose_environment());
        variables
    }

    /// Instantiate one driver per app
    ///
    /// Every app is attempted; apps with a malformed definition are reported
    /// together and fail the whole run.
    pub fn create_processes(&mut self) -> Result<Arc<ProcessRegistry>, OrchestratorError> {
        let graph = DependencyGraph::build(&self.compose.apps)?;

        let runtime = Arc::new(
            ContainerRuntime::new(self.engine.clone(), self.config.project_prefix())
                .with_remove_containers(self.config.remove_containers),
        );
        let base_environment = self.compose_environment();
        let host_variables = self.host_variables();

        let mut entries = IndexMap::new();
        let mut invalid = Vec::new();

        for (name, app) in &self.compose.apps {
            let process: Result<Arc<dyn Process>, SpecError> = app.kind().and_then(|kind| match kind {
                AppKind::Native { command } => Ok(Arc::new(NativeProcess::new(
                    name.as_str(),
                    command,
                    self.config.working_dir.clone(),
                    app.environment.clone(),
                    base_environment.clone(),
                    self.spawner.clone(),
                )) as Arc<dyn Process>),
                AppKind::Container => ContainerProcess::new(
                    name,
                    app,
                    &self.config.working_dir,
                    host_variables.clone(),
                    runtime.clone(),
                )
                .map(|process| Arc::new(process) as Arc<dyn Process>),
            });

            match process {
                Ok(process) => {
                    entries.insert(
                        name.clone(),
                        RegisteredProcess {
                            process,
                            app: app.clone(),
                        },
                    );
                }
                Err(e) => {
                    log::error!("[{}] {}", name, e);
                    invalid.push((name.clone(), e));
                }
            }
        }

        if !invalid.is_empty() {
            return Err(OrchestratorError::InvalidApps(invalid));
        }

        log::info!("Created {} apps", entries.len());
        let registry = Arc::new(ProcessRegistry {
            entries,
            shutting_down: AtomicBool::new(false),
        });
        self.graph = Some(graph);
        self.registry = Some(registry.clone());
        Ok(registry)
    }

    /// Wire output and readiness, then start every app once its dependencies are ready
    pub fn start_processes(&self) -> Result<(), OrchestratorError> {
        let (Some(registry), Some(graph)) = (&self.registry, &self.graph) else {
            return Err(OrchestratorError::NotCreated);
        };
        let evaluator = ReadinessEvaluator::new(self.config.probe, self.host_variables());
        let mut subscriptions = lock(&self.subscriptions);

        for app in graph.start_order() {
            let name = &app.name;
            let Some(entry) = registry.get(name) else {
                continue;
            };
            let process = entry.process.clone();
            subscriptions.push(console::attach(process.core(), self.sink.clone()));
            subscriptions.push(evaluator.evaluate(
                process.clone(),
                entry.app.ready.as_ref(),
                &entry.app.export,
            ));

            let dependencies: Vec<Arc<dyn Process>> = graph
                .dependencies(name)
                .iter()
                .filter_map(|dependency| registry.get(dependency))
                .map(|dependency| dependency.process.clone())
                .collect();

            if !dependencies.is_empty() {
                log::info!(
                    "[{}] Waiting for {}",
                    name,
                    graph.dependencies(name).join(", ")
                );
            }

            let registry = registry.clone();
            let task = tokio::spawn(async move {
                let waits = dependencies.iter().map(|dependency| dependency.core().wait_until_ready());
                futures::future::join_all(waits).await;
                if registry.is_shutting_down() {
                    return;
                }

                // Later dependencies win on key collisions
                let mut inherited = Environment::new();
                for dependency in &dependencies {
                    inherited.extend(dependency.core().exported_environment());
                }
                process.core().extend_exported(inherited.clone());
                process.start(inherited).await;
            });
            subscriptions.push(Subscription::new(task.abort_handle()));
        }

        Ok(())
    }

    pub fn registry(&self) -> Option<Arc<ProcessRegistry>> {
        self.registry.clone()
    }

    /// Stop forwarding output and evaluating readiness
    pub fn dispose(&self) {
        for subscription in lock(&self.subscriptions).iter_mut() {
            subscription.dispose();
        }
    }
}

/// Errors that abort a run before apps start
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Invalid apps: {}", format_invalid(.0))]
    InvalidApps(Vec<(String, SpecError)>),

    #[error("Processes have not been created")]
    NotCreated,
}

fn format_invalid(invalid: &[(String, SpecError)]) -> String {
    invalid
        .iter()
        .map(|(name, e)| format!("{} ({})", name, e))
        .collect::<Vec<_>>()
        .join(", ")
}
