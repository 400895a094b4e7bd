//! Shared helpers for app_compose integration tests
#![allow(dead_code)]

use app_compose::config::{ComposeFile, Environment};
use app_compose::console::LineSink;
use app_compose::runtime::container::{
    BuildEvent, BuildRequest, BuildStream, ContainerEngine, ContainerInfo, CreateOptions,
    EngineError, ImageInfo, OutputOrigin, PullProgress, PullStream,
};
use app_compose::runtime::native::{ChildHandle, SpawnRequest, SpawnedProcess, Spawner};
use app_compose::runtime::{
    OutputStream, Orchestrator, OrchestratorConfig, ProbeTiming, ShutdownTimeouts, Signal,
};
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Orchestrator options with fast probes and short shutdown windows
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        working_dir: PathBuf::from("/tmp/app-compose-tests"),
        project: Some("test".to_string()),
        remove_containers: false,
        shutdown: ShutdownTimeouts {
            quit: Duration::from_millis(100),
            terminate: Duration::from_millis(100),
        },
        probe: ProbeTiming {
            first_probe: Duration::from_millis(10),
            interval: Duration::from_millis(20),
        },
    }
}

/// Build an orchestrator over fakes; nothing touches the host environment
pub fn orchestrator(
    yaml: &str,
    spawner: Arc<ScriptedSpawner>,
    engine: Arc<CountingEngine>,
    sink: Arc<RecordingSink>,
) -> Orchestrator {
    let compose = ComposeFile::from_yaml(yaml).unwrap();
    Orchestrator::new(compose, test_config())
        .with_spawner(spawner)
        .with_engine(engine)
        .with_sink(sink)
        .with_host_environment(Environment::new())
}

/// Like [`orchestrator`], with apps resolved against `working_dir`
pub fn orchestrator_in(
    working_dir: &Path,
    yaml: &str,
    spawner: Arc<ScriptedSpawner>,
    engine: Arc<CountingEngine>,
    sink: Arc<RecordingSink>,
) -> Orchestrator {
    let compose = ComposeFile::from_yaml(yaml).unwrap();
    let config = OrchestratorConfig {
        working_dir: working_dir.to_path_buf(),
        ..test_config()
    };
    Orchestrator::new(compose, config)
        .with_spawner(spawner)
        .with_engine(engine)
        .with_sink(sink)
        .with_host_environment(Environment::new())
}

/// Await `future`, failing the test after [`TEST_TIMEOUT`]
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("timed out")
}

/// Line sink remembering everything it was given
#[derive(Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries.lock().unwrap().iter().any(|e| e == entry)
    }

    /// Wait until `entry` was recorded, failing the test after [`TEST_TIMEOUT`]
    pub async fn wait_for(&self, entry: &str) {
        within(async {
            while !self.contains(entry) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
    }
}

impl LineSink for RecordingSink {
    fn line(&self, app: &str, text: &str) {
        self.entries.lock().unwrap().push(format!("{app}: {text}"));
    }

    fn status(&self, app: &str, message: &str) {
        self.entries.lock().unwrap().push(format!("{app} ... {message}"));
    }
}

/// How a scripted command behaves once spawned
#[derive(Debug, Clone)]
pub struct Script {
    /// Lines written to the output right away
    pub output: Vec<String>,
    /// Exit immediately with this code; otherwise run until signalled
    pub exit_code: Option<i64>,
    /// Signals the command dies from; `SIGKILL` always works
    pub exits_on: Vec<Signal>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            output: Vec::new(),
            exit_code: None,
            exits_on: vec![Signal::Interrupt, Signal::Terminate],
        }
    }
}

impl Script {
    pub fn exiting(code: i64) -> Self {
        Self {
            exit_code: Some(code),
            ..Default::default()
        }
    }

    pub fn printing(lines: &[&str]) -> Self {
        Self {
            output: lines.iter().map(|line| line.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Ignore everything but `SIGKILL`
    pub fn stubborn() -> Self {
        Self {
            exits_on: Vec::new(),
            ..Default::default()
        }
    }
}

/// Spawner that runs scripts instead of commands and records every request
#[derive(Default)]
pub struct ScriptedSpawner {
    scripts: Mutex<HashMap<String, Script>>,
    requests: Mutex<Vec<SpawnRequest>>,
    children: Mutex<HashMap<String, Arc<ScriptedChild>>>,
}

impl ScriptedSpawner {
    pub fn with_script(self, command: &str, script: Script) -> Self {
        self.scripts.lock().unwrap().insert(command.to_string(), script);
        self
    }

    pub fn requests(&self) -> Vec<SpawnRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request(&self, command: &str) -> Option<SpawnRequest> {
        self.requests()
            .into_iter()
            .find(|request| request.command == command)
    }

    /// How often the process tree of `command` was killed
    pub fn tree_kills(&self, command: &str) -> usize {
        self.children
            .lock()
            .unwrap()
            .get(command)
            .map(|child| child.tree_kills.load(Ordering::SeqCst))
            .unwrap_or_default()
    }

    /// Signals delivered to the child spawned for `command`
    pub fn signals(&self, command: &str) -> Vec<Signal> {
        self.children
            .lock()
            .unwrap()
            .get(command)
            .map(|child| child.signals.lock().unwrap().clone())
            .unwrap_or_default()
    }
}

impl Spawner for ScriptedSpawner {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedProcess> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&request.command)
            .cloned()
            .unwrap_or_default();

        let (exit, _) = watch::channel(script.exit_code);
        let child = Arc::new(ScriptedChild {
            exits_on: script.exits_on.clone(),
            signals: Mutex::new(Vec::new()),
            tree_kills: AtomicUsize::new(0),
            exit,
        });
        self.children
            .lock()
            .unwrap()
            .insert(request.command.clone(), child.clone());

        let chunks: Vec<io::Result<Vec<u8>>> = script
            .output
            .iter()
            .map(|line| Ok(format!("{line}\n").into_bytes()))
            .collect();
        let output: OutputStream = futures::stream::iter(chunks).boxed();

        Ok(SpawnedProcess {
            handle: child,
            output,
        })
    }
}

pub struct ScriptedChild {
    exits_on: Vec<Signal>,
    signals: Mutex<Vec<Signal>>,
    tree_kills: AtomicUsize,
    exit: watch::Sender<Option<i64>>,
}

impl ScriptedChild {
    fn exit_with(&self, code: i64) {
        self.exit.send_if_modified(|exit| {
            if exit.is_some() {
                return false;
            }
            *exit = Some(code);
            true
        });
    }
}

#[async_trait]
impl ChildHandle for ScriptedChild {
    fn id(&self) -> Option<u32> {
        None
    }

    fn signal(&self, signal: Signal) -> io::Result<()> {
        self.signals.lock().unwrap().push(signal);
        if signal == Signal::Kill || self.exits_on.contains(&signal) {
            let number = match signal {
                Signal::Interrupt => 2,
                Signal::Terminate => 15,
                Signal::Kill => 9,
            };
            self.exit_with(128 + number);
        }
        Ok(())
    }

    fn kill_tree(&self) -> io::Result<()> {
        self.tree_kills.fetch_add(1, Ordering::SeqCst);
        self.exit_with(137);
        Ok(())
    }

    async fn wait(&self) -> io::Result<i64> {
        let mut rx = self.exit.subscribe();
        let code = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| io::Error::other("child handle dropped"))?;
        Ok(code.unwrap_or(-1))
    }
}

struct FakeContainer {
    labels: HashMap<String, String>,
    ip_address: String,
    exit_code: i64,
    output: Option<futures::channel::mpsc::UnboundedSender<io::Result<Vec<u8>>>>,
}

/// Outcome of every image build
#[derive(Debug, Clone)]
pub struct BuildScript {
    pub output: Vec<String>,
    pub exit_code: i64,
}

/// In-memory container engine counting the calls tests care about
pub struct CountingEngine {
    pull_delay: Duration,
    /// Address reported for every container; sequential `172.17.0.x` when unset
    ip_address: Option<String>,
    /// Builds fail to start when unset
    build: Option<BuildScript>,
    /// Local images and their labels
    images: Mutex<HashMap<String, HashMap<String, String>>>,
    containers: Mutex<HashMap<String, FakeContainer>>,
    pulls: AtomicUsize,
    builds: AtomicUsize,
    creates: AtomicUsize,
    volumes: AtomicUsize,
    kills: Mutex<Vec<(String, Signal)>>,
}

impl Default for CountingEngine {
    fn default() -> Self {
        Self {
            pull_delay: Duration::from_millis(50),
            ip_address: None,
            build: None,
            images: Mutex::new(HashMap::new()),
            containers: Mutex::new(HashMap::new()),
            pulls: AtomicUsize::new(0),
            builds: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            volumes: AtomicUsize::new(0),
            kills: Mutex::new(Vec::new()),
        }
    }
}

impl CountingEngine {
    pub fn with_ip_address(mut self, address: &str) -> Self {
        self.ip_address = Some(address.to_string());
        self
    }

    pub fn with_build(mut self, output: &[&str], exit_code: i64) -> Self {
        self.build = Some(BuildScript {
            output: output.iter().map(|line| line.to_string()).collect(),
            exit_code,
        });
        self
    }

    /// Make `reference` available locally
    pub fn with_image<I>(self, reference: &str, labels: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.images
            .lock()
            .unwrap()
            .insert(reference.to_string(), labels.into_iter().collect());
        self
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn volumes(&self) -> usize {
        self.volumes.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> Vec<(String, Signal)> {
        self.kills.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerEngine for CountingEngine {
    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo, EngineError> {
        let images = self.images.lock().unwrap();
        let labels = images
            .get(reference)
            .ok_or_else(|| EngineError::NotFound(reference.to_string()))?;
        Ok(ImageInfo {
            id: format!("sha256:{reference}"),
            labels: labels.clone(),
        })
    }

    async fn pull_image(&self, reference: &str) -> Result<PullStream, EngineError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.pull_delay).await;
        self.images
            .lock()
            .unwrap()
            .insert(reference.to_string(), HashMap::new());
        let progress = PullProgress {
            layer: Some("0123456789ab".to_string()),
            status: "Pull complete".to_string(),
            current: None,
            total: Some(1024),
        };
        Ok(futures::stream::iter(vec![Ok(progress)]).boxed())
    }

    async fn build_image(&self, request: &BuildRequest) -> Result<BuildStream, EngineError> {
        let Some(script) = &self.build else {
            return Err(EngineError::Command {
                command: "build".to_string(),
                message: format!("cannot build {}", request.tag),
            });
        };
        self.builds.fetch_add(1, Ordering::SeqCst);
        if script.exit_code == 0 {
            let labels = request.labels.clone().into_iter().collect();
            self.images.lock().unwrap().insert(request.tag.clone(), labels);
        }

        let mut events: Vec<BuildEvent> = script
            .output
            .iter()
            .map(|text| BuildEvent::Line {
                origin: OutputOrigin::Stdout,
                text: text.clone(),
            })
            .collect();
        events.push(BuildEvent::Finished {
            code: script.exit_code,
        });
        Ok(futures::stream::iter(events).boxed())
    }

    async fn create_container(
        &self,
        name: &str,
        options: &CreateOptions,
    ) -> Result<String, EngineError> {
        let count = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        let container = FakeContainer {
            labels: options.labels.clone().into_iter().collect(),
            ip_address: self
                .ip_address
                .clone()
                .unwrap_or_else(|| format!("172.17.0.{}", count + 1)),
            exit_code: 0,
            output: None,
        };
        self.containers
            .lock()
            .unwrap()
            .insert(name.to_string(), container);
        Ok(format!("id-{name}"))
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo, EngineError> {
        let containers = self.containers.lock().unwrap();
        let container = containers
            .get(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        Ok(ContainerInfo {
            id: format!("id-{name}"),
            labels: container.labels.clone(),
            exit_code: container.exit_code,
            ip_address: container.ip_address.clone(),
        })
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        let containers = self.containers.lock().unwrap();
        let container = containers
            .get(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        if let Some(output) = &container.output {
            let _ = output.unbounded_send(Ok(b"container started\n".to_vec()));
        }
        Ok(())
    }

    async fn kill_container(&self, name: &str, signal: Signal) -> Result<(), EngineError> {
        self.kills.lock().unwrap().push((name.to_string(), signal));
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        container.exit_code = 130;
        // Closing the output ends the attached stream
        container.output = None;
        Ok(())
    }

    async fn remove_container(&self, name: &str, _force: bool) -> Result<(), EngineError> {
        self.containers.lock().unwrap().remove(name);
        Ok(())
    }

    async fn attach_container(&self, name: &str) -> Result<OutputStream, EngineError> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        let (tx, rx) = futures::channel::mpsc::unbounded();
        container.output = Some(tx);
        Ok(rx.boxed())
    }

    async fn create_volume(&self, _name: &str) -> Result<(), EngineError> {
        self.volumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
