//! Process abstraction shared by native and container drivers
//!
//! Every app is driven through a [`Process`]. Drivers own the underlying OS
//! or container handle; the lifecycle state machine, typed event stream and
//! exported environment live in [`ProcessCore`] so they behave identically for
//! both kinds of app.

use crate::config::Environment;
use crate::runtime::container::ContainerError;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

/// Raw output of a process or container, chunked as it arrives
pub type OutputStream = BoxStream<'static, std::io::Result<Vec<u8>>>;

const READ_BUFFER_SIZE: usize = 8192;

/// Signals the orchestrator sends to apps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Signal {
    #[default]
    #[serde(rename = "SIGINT")]
    Interrupt,
    #[serde(rename = "SIGTERM")]
    Terminate,
    #[serde(rename = "SIGKILL")]
    Kill,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    pub fn to_nix(self) -> nix::sys::signal::Signal {
        match self {
            Signal::Interrupt => nix::sys::signal::Signal::SIGINT,
            Signal::Terminate => nix::sys::signal::Signal::SIGTERM,
            Signal::Kill => nix::sys::signal::Signal::SIGKILL,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created, not yet started
    Created,
    /// Underlying process or container is running
    Started,
    /// Readiness criteria have been met
    Ready,
    /// A kill has been requested
    Exiting,
    /// Terminal state
    Ended,
}

impl ProcessState {
    /// Check if the underlying handle is alive
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ProcessState::Started | ProcessState::Ready | ProcessState::Exiting
        )
    }
}

/// Event emitted by a process
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// Process started (emitted once)
    Started,
    /// Readiness reached; `notify` is false when no condition was declared
    Ready { notify: bool },
    /// One line of output
    Line(String),
    /// Underlying process exited
    Exit { code: i64 },
    /// A kill signal is being sent
    Killing(Signal),
    /// Non-fatal failure of this app
    Error(Arc<ProcessError>),
    /// Progress narration (image pulls, builds, reuse decisions)
    Status(String),
}

/// Explicitly disposable handle to a background subscription
#[derive(Debug)]
pub struct Subscription {
    handle: Option<AbortHandle>,
}

impl Subscription {
    pub fn new(handle: AbortHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Stop the subscription; calling this more than once is a no-op
    pub fn dispose(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Lock a std mutex, recovering the data if a panicking thread poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State machine, event stream and environment maps of one app
#[derive(Clone)]
pub struct ProcessCore {
    inner: Arc<CoreInner>,
}

struct CoreInner {
    name: String,
    state: watch::Sender<ProcessState>,
    ready: watch::Sender<bool>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ProcessEvent>>>,
    address: watch::Sender<Option<String>>,
    exported: Mutex<Environment>,
    variables: Mutex<Environment>,
}

impl fmt::Debug for ProcessCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessCore")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ProcessCore {
    /// Create the core for a process in the `Created` state
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(CoreInner {
                name: name.into(),
                state: watch::Sender::new(ProcessState::Created),
                ready: watch::Sender::new(false),
                subscribers: Mutex::new(Vec::new()),
                address: watch::Sender::new(None),
                exported: Mutex::new(Environment::new()),
                variables: Mutex::new(Environment::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ProcessState {
        *self.inner.state.borrow()
    }

    pub fn is_ended(&self) -> bool {
        self.state() == ProcessState::Ended
    }

    /// Whether readiness has fired for this process
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Subscribe to every event emitted from now on
    ///
    /// Each subscriber has its own unbounded queue, so a slow reader never
    /// loses events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ProcessEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    fn emit(&self, event: ProcessEvent) {
        lock(&self.inner.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// `Created -> Started`; repeated calls are no-ops
    pub fn mark_started(&self) -> bool {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == ProcessState::Created {
                *state = ProcessState::Started;
                true
            } else {
                false
            }
        });
        if changed {
            self.emit(ProcessEvent::Started);
        }
        changed
    }

    /// Fire readiness at most once per process
    pub fn mark_ready(&self, notify: bool) -> bool {
        let fired = self.inner.ready.send_if_modified(|ready| !std::mem::replace(ready, true));
        if !fired {
            return false;
        }
        self.inner.state.send_if_modified(|state| {
            if *state == ProcessState::Started {
                *state = ProcessState::Ready;
                true
            } else {
                false
            }
        });
        self.emit(ProcessEvent::Ready { notify });
        true
    }

    /// Announce a kill request and move a live process to `Exiting`
    pub fn mark_exiting(&self, signal: Signal) {
        self.inner.state.send_if_modified(|state| {
            if matches!(*state, ProcessState::Started | ProcessState::Ready) {
                *state = ProcessState::Exiting;
                true
            } else {
                false
            }
        });
        self.emit(ProcessEvent::Killing(signal));
    }

    /// Record the exit of the underlying handle; `Ended` is sticky
    pub fn mark_exited(&self, code: i64) -> bool {
        self.end(Some(ProcessEvent::Exit { code }))
    }

    /// Report a startup failure and end the process without an exit code
    pub fn fail(&self, error: impl Into<ProcessError>) {
        self.emit_error(error);
        self.end(None);
    }

    /// End a process whose underlying handle will never report an exit
    pub fn abandon(&self) -> bool {
        self.end(None)
    }

    /// Move to `Ended`, queueing `event` before state watchers are woken
    fn end(&self, mut event: Option<ProcessEvent>) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == ProcessState::Ended {
                return false;
            }
            if let Some(event) = event.take() {
                self.emit(event);
            }
            *state = ProcessState::Ended;
            true
        })
    }

    pub fn emit_line(&self, line: impl Into<String>) {
        self.emit(ProcessEvent::Line(line.into()));
    }

    pub fn emit_status(&self, message: impl Into<String>) {
        self.emit(ProcessEvent::Status(message.into()));
    }

    pub fn emit_error(&self, error: impl Into<ProcessError>) {
        self.emit(ProcessEvent::Error(Arc::new(error.into())));
    }

    /// Wait until readiness has fired
    pub async fn wait_until_ready(&self) {
        let mut rx = self.inner.ready.subscribe();
        // The sender lives as long as `self`, so this only returns once ready
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Wait until the process reaches `Ended`
    pub async fn wait_until_ended(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == ProcessState::Ended).await;
    }

    /// Publish the assigned network address; late subscribers see the last value
    pub fn set_address(&self, address: impl Into<String>) {
        self.inner.address.send_replace(Some(address.into()));
    }

    pub fn watch_address(&self) -> watch::Receiver<Option<String>> {
        self.inner.address.subscribe()
    }

    pub fn exported_environment(&self) -> Environment {
        lock(&self.inner.exported).clone()
    }

    /// Merge values into the exported environment, overriding existing keys
    pub fn extend_exported(&self, values: Environment) {
        lock(&self.inner.exported).extend(values);
    }

    /// Driver-internal facts; never propagated to dependents on their own
    pub fn variables(&self) -> Environment {
        lock(&self.inner.variables).clone()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: impl Into<String>) {
        lock(&self.inner.variables).insert(name.into(), value.into());
    }

    /// Tokenize an output stream into `Line` events until it ends
    ///
    /// `on_first_chunk` runs once, before the first line of the first chunk.
    pub async fn forward_output<F>(&self, mut output: OutputStream, mut on_first_chunk: F)
    where
        F: FnMut() + Send,
    {
        let mut splitter = LineSplitter::default();
        let mut seen_output = false;

        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(bytes) => {
                    if !seen_output {
                        seen_output = true;
                        on_first_chunk();
                    }
                    for line in splitter.push(&bytes) {
                        self.emit_line(line);
                    }
                }
                Err(e) => {
                    self.emit_error(ProcessError::Output(e));
                    break;
                }
            }
        }

        if let Some(rest) = splitter.finish() {
            self.emit_line(rest);
        }
    }
}

/// Splits a byte stream into lines
///
/// A trailing fragment is only emitted by [`LineSplitter::finish`] when it is
/// non-empty, so a stream ending in `\n` does not produce a spurious blank line.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// Feed bytes and return every completed line
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            lines.push(Self::decode(line));
        }
        lines
    }

    /// Flush the unterminated remainder, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(Self::decode(std::mem::take(&mut self.pending)))
    }

    fn decode(mut line: Vec<u8>) -> String {
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8_lossy(&line).into_owned()
    }
}

/// Turn an async reader into an [`OutputStream`]
pub fn read_chunks<R>(reader: R) -> OutputStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    futures::stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(buf), Some(reader)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

/// Uniform lifecycle of an app, native or containerized
#[async_trait]
pub trait Process: Send + Sync {
    fn core(&self) -> &ProcessCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    /// Begin the underlying process; failures surface as `Error` events
    async fn start(&self, extra_environment: Environment);

    /// Request termination; returns whether a request was actually issued
    async fn kill(&self, signal: Signal) -> bool;

    async fn terminate(&self) -> bool {
        self.kill(Signal::Kill).await
    }

    /// Release resources after exit
    async fn cleanup(&self) {}

    /// Host to probe for port readiness; `None` if it will never be known
    async fn resolve_host(&self) -> Option<String> {
        Some("localhost".to_string())
    }

    /// Declared TCP ports, for `wait_for_ports: true`; `None` when not applicable
    fn declared_tcp_ports(&self) -> Option<Vec<u16>> {
        None
    }
}

/// Errors surfaced through `ProcessEvent::Error`
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read output: {0}")]
    Output(#[source] std::io::Error),

    #[error("Failed to wait for exit: {0}")]
    Wait(#[source] std::io::Error),

    #[error(transparent)]
    Container(#[from] ContainerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_splitter_keeps_explicit_blank_lines() {
        let mut splitter = LineSplitter::default();
        let lines = splitter.push(b"a\n\nb\n");
        assert_eq!(lines, vec!["a", "", "b"]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_line_splitter_joins_partial_chunks() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"hel").is_empty());
        assert_eq!(splitter.push(b"lo\r\nwor"), vec!["hello"]);
        assert_eq!(splitter.finish(), Some("wor".to_string()));
    }

    #[test]
    fn test_started_is_idempotent() {
        let core = ProcessCore::new("app");
        let mut events = core.subscribe();

        assert!(core.mark_started());
        assert!(!core.mark_started());
        assert_eq!(core.state(), ProcessState::Started);

        assert!(matches!(events.try_recv(), Ok(ProcessEvent::Started)));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_ready_fires_once() {
        let core = ProcessCore::new("app");
        core.mark_started();
        let mut events = core.subscribe();

        assert!(core.mark_ready(true));
        assert!(!core.mark_ready(false));
        assert_eq!(core.state(), ProcessState::Ready);

        assert!(matches!(
            events.try_recv(),
            Ok(ProcessEvent::Ready { notify: true })
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_ended_is_sticky() {
        let core = ProcessCore::new("app");
        core.mark_started();
        core.mark_exiting(Signal::Interrupt);
        assert_eq!(core.state(), ProcessState::Exiting);

        assert!(core.mark_exited(0));
        assert!(!core.mark_exited(1));
        core.mark_started();
        core.mark_exiting(Signal::Kill);
        assert_eq!(core.state(), ProcessState::Ended);
    }

    #[test]
    fn test_ready_after_exit_keeps_ended_state() {
        let core = ProcessCore::new("job");
        core.mark_started();
        core.mark_exited(0);

        assert!(core.mark_ready(true));
        assert!(core.is_ready());
        assert_eq!(core.state(), ProcessState::Ended);
    }

    #[tokio::test]
    async fn test_address_replays_to_late_subscribers() {
        let core = ProcessCore::new("db");
        core.set_address("172.17.0.2");

        let rx = core.watch_address();
        assert_eq!(rx.borrow().as_deref(), Some("172.17.0.2"));
    }

    #[tokio::test]
    async fn test_forward_output_suppresses_trailing_empty_fragment() {
        let core = ProcessCore::new("app");
        let mut events = core.subscribe();
        let chunks: Vec<std::io::Result<Vec<u8>>> = vec![Ok(b"one\n".to_vec()), Ok(b"\ntwo\n".to_vec())];
        let mut first_chunks = 0;

        core.forward_output(futures::stream::iter(chunks).boxed(), || first_chunks += 1)
            .await;

        let mut lines = Vec::new();
        while let Ok(ProcessEvent::Line(line)) = events.try_recv() {
            lines.push(line);
        }
        assert_eq!(lines, vec!["one", "", "two"]);
        assert_eq!(first_chunks, 1);
    }

    #[tokio::test]
    async fn test_subscription_dispose_is_idempotent() {
        let task = tokio::spawn(futures::future::pending::<()>());
        let mut subscription = Subscription::new(task.abort_handle());

        subscription.dispose();
        subscription.dispose();

        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_slow_subscriber_sees_every_line() {
        let core = ProcessCore::new("app");
        let mut events = core.subscribe();
        let chunk = (0..5000).map(|i| format!("line {i}\n")).collect::<String>();

        core.forward_output(futures::stream::iter(vec![Ok(chunk.into_bytes())]).boxed(), || {})
            .await;

        let mut count = 0;
        while let Ok(ProcessEvent::Line(line)) = events.try_recv() {
            assert_eq!(line, format!("line {count}"));
            count += 1;
        }
        assert_eq!(count, 5000);
    }

    #[test]
    fn test_dropped_subscribers_are_forgotten() {
        let core = ProcessCore::new("app");
        let events = core.subscribe();
        drop(events);

        core.emit_line("nobody listens");
        assert!(lock(&core.inner.subscribers).is_empty());
    }
}
