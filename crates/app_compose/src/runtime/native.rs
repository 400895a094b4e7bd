//! Native process driver and the process-spawn interface it runs on

use crate::config::{Environment, ScalarValue, SubstitutionContext};
use crate::runtime::process::{
    lock, read_chunks, OutputStream, Process, ProcessCore, ProcessError, ProcessState, Signal,
};
use async_trait::async_trait;
#[cfg(not(unix))]
use futures::stream::StreamExt;
use indexmap::IndexMap;
use std::io;
use std::path::PathBuf;
#[cfg(not(unix))]
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};

const DEFAULT_COLUMNS: u16 = 80;
const DEFAULT_ROWS: u16 = 30;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Terminal dimensions advertised to spawned commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub columns: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            columns: DEFAULT_COLUMNS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl TerminalSize {
    /// Read `COLUMNS`/`LINES` from the environment, falling back to 80x30
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().and_then(|v| v.parse::<u16>().ok());
        Self {
            columns: read("COLUMNS").unwrap_or(DEFAULT_COLUMNS),
            rows: read("LINES").unwrap_or(DEFAULT_ROWS),
        }
    }
}

/// Everything needed to spawn one command
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Command line, interpreted by a shell
    pub command: String,
    /// Working directory
    pub cwd: PathBuf,
    /// Variables added to the inherited environment
    pub env: Environment,
    pub size: TerminalSize,
}

/// Handle to a spawned child
#[async_trait]
pub trait ChildHandle: Send + Sync {
    /// OS process id, if known
    fn id(&self) -> Option<u32>;

    /// Deliver a signal to the child and everything it spawned
    fn signal(&self, signal: Signal) -> io::Result<()>;

    /// Forcefully kill the child and everything it spawned
    fn kill_tree(&self) -> io::Result<()>;

    /// Wait for exit and return the exit code
    async fn wait(&self) -> io::Result<i64>;
}

/// A freshly spawned child with its combined output
pub struct SpawnedProcess {
    pub handle: Arc<dyn ChildHandle>,
    pub output: OutputStream,
}

/// Process-spawn primitive
pub trait Spawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedProcess>;
}

/// Spawns commands through `/bin/sh -c` on a pseudo-terminal, each in its own
/// process group
#[derive(Debug, Clone)]
pub struct ShellSpawner {
    shell: PathBuf,
}

impl Default for ShellSpawner {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl ShellSpawner {
    fn command(&self, request: &SpawnRequest) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&request.cwd)
            .envs(&request.env)
            .env("TERM", "xterm-color")
            .env("COLUMNS", request.size.columns.to_string())
            .env("LINES", request.size.rows.to_string())
            .kill_on_drop(true);
        cmd
    }
}

impl Spawner for ShellSpawner {
    #[cfg(unix)]
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedProcess> {
        let terminal = terminal::Terminal::open(request.size)?;
        let mut cmd = self.command(request);
        cmd.stdin(terminal.slave()?)
            .stdout(terminal.slave()?)
            .stderr(terminal.slave()?);

        // Keep terminal interrupts away from children; the orchestrator relays them
        cmd.process_group(0);

        let child = cmd.spawn()?;
        // Only the child may hold the slave side, or the output never ends
        drop(cmd);

        Ok(SpawnedProcess {
            handle: Arc::new(ShellChild {
                pid: child.id(),
                child: tokio::sync::Mutex::new(child),
            }),
            output: read_chunks(terminal.into_reader()?),
        })
    }

    #[cfg(not(unix))]
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnedProcess> {
        let mut cmd = self.command(request);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().map(read_chunks);
        let stderr = child.stderr.take().map(read_chunks);
        let output = match (stdout, stderr) {
            (Some(out), Some(err)) => futures::stream::select(out, err).boxed(),
            (Some(out), None) => out,
            (None, Some(err)) => err,
            (None, None) => futures::stream::empty().boxed(),
        };

        Ok(SpawnedProcess {
            handle: Arc::new(ShellChild {
                pid: child.id(),
                child: tokio::sync::Mutex::new(child),
            }),
            output,
        })
    }
}

#[cfg(unix)]
mod terminal {
    use super::TerminalSize;
    use nix::errno::Errno;
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    use nix::pty::{openpty, Winsize};
    use std::io;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::pin::Pin;
    use std::process::Stdio;
    use std::task::{ready, Context, Poll};
    use tokio::io::unix::AsyncFd;
    use tokio::io::{AsyncRead, ReadBuf};

    /// Pseudo-terminal pair a child runs on
    pub(super) struct Terminal {
        master: OwnedFd,
        slave: OwnedFd,
    }

    impl Terminal {
        pub(super) fn open(size: TerminalSize) -> io::Result<Self> {
            let winsize = Winsize {
                ws_row: size.rows,
                ws_col: size.columns,
                ws_xpixel: 0,
                ws_ypixel: 0,
            };
            let pty = openpty(&winsize, None::<&nix::sys::termios::Termios>)?;
            Ok(Self {
                master: pty.master,
                slave: pty.slave,
            })
        }

        /// One standard stream of the child
        pub(super) fn slave(&self) -> io::Result<Stdio> {
            Ok(Stdio::from(self.slave.try_clone()?))
        }

        /// Reader over everything the child writes to the terminal
        pub(super) fn into_reader(self) -> io::Result<TerminalReader> {
            let Terminal { master, slave } = self;
            drop(slave);
            let flags = OFlag::from_bits_truncate(fcntl(master.as_raw_fd(), FcntlArg::F_GETFL)?);
            fcntl(master.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
            Ok(TerminalReader {
                master: AsyncFd::new(master)?,
            })
        }
    }

    pub(super) struct TerminalReader {
        master: AsyncFd<OwnedFd>,
    }

    impl AsyncRead for TerminalReader {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            loop {
                let mut guard = ready!(self.master.poll_read_ready(cx))?;
                let unfilled = buf.initialize_unfilled();
                let read = guard.try_io(|master| {
                    nix::unistd::read(master.as_raw_fd(), unfilled).map_err(io::Error::from)
                });
                match read {
                    Ok(Ok(n)) => {
                        buf.advance(n);
                        return Poll::Ready(Ok(()));
                    }
                    // Every process holding the slave side has exited
                    Ok(Err(e)) if e.raw_os_error() == Some(Errno::EIO as i32) => {
                        return Poll::Ready(Ok(()));
                    }
                    Ok(Err(e)) => return Poll::Ready(Err(e)),
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

struct ShellChild {
    pid: Option<u32>,
    child: tokio::sync::Mutex<Child>,
}

#[async_trait]
impl ChildHandle for ShellChild {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    #[cfg(unix)]
    fn signal(&self, signal: Signal) -> io::Result<()> {
        use nix::unistd::Pid;

        // The child leads its own process group; everything in it gets the signal
        let pid = self.pid.ok_or_else(|| io::Error::other("process has no pid"))?;
        nix::sys::signal::killpg(Pid::from_raw(pid as i32), signal.to_nix()).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn signal(&self, _signal: Signal) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "signals are unix-only"))
    }

    #[cfg(unix)]
    fn kill_tree(&self) -> io::Result<()> {
        use nix::unistd::Pid;

        // Members of the group may outlive its leader
        let pid = self.pid.ok_or_else(|| io::Error::other("process has no pid"))?;
        nix::sys::signal::killpg(Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL)
            .map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn kill_tree(&self) -> io::Result<()> {
        match self.child.try_lock() {
            Ok(mut child) => child.start_kill(),
            Err(_) => Err(io::Error::other("child is being awaited")),
        }
    }

    async fn wait(&self) -> io::Result<i64> {
        let status = self.child.lock().await.wait().await?;
        if let Some(code) = status.code() {
            return Ok(code as i64);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Ok(128 + signal as i64);
            }
        }
        Ok(-1)
    }
}

/// An app running as a native OS command
pub struct NativeProcess {
    core: ProcessCore,
    command: String,
    cwd: PathBuf,
    environment: IndexMap<String, ScalarValue>,
    base_environment: Environment,
    spawner: Arc<dyn Spawner>,
    handle: Mutex<Option<Arc<dyn ChildHandle>>>,
}

impl NativeProcess {
    /// Create a native process
    ///
    /// `base_environment` is added to every spawn underneath the app's own
    /// environment (the compose file's top-level `environment`).
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        cwd: impl Into<PathBuf>,
        environment: IndexMap<String, ScalarValue>,
        base_environment: Environment,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        Self {
            core: ProcessCore::new(name),
            command: command.into(),
            cwd: cwd.into(),
            environment,
            base_environment,
            spawner,
            handle: Mutex::new(None),
        }
    }

    /// Merge upstream values under the app's own environment and resolve references
    fn resolve_environment(&self, extra_environment: Environment) -> Environment {
        let mut merged = extra_environment;
        merged.extend(
            self.environment
                .iter()
                .map(|(key, value)| (key.clone(), value.as_str())),
        );
        SubstitutionContext::new()
            .with_vars(merged.clone())
            .substitute_env(&merged)
    }
}

#[async_trait]
impl Process for NativeProcess {
    fn core(&self) -> &ProcessCore {
        &self.core
    }

    async fn start(&self, extra_environment: Environment) {
        if self.core.state() != ProcessState::Created {
            log::debug!("[{}] Not starting, state is {:?}", self.core.name(), self.core.state());
            return;
        }

        let mut env = self.base_environment.clone();
        env.extend(self.resolve_environment(extra_environment));

        let request = SpawnRequest {
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            env,
            size: TerminalSize::from_env(),
        };

        log::info!("[{}] Starting: {}", self.core.name(), self.command);

        let SpawnedProcess { handle, output } = match self.spawner.spawn(&request) {
            Ok(spawned) => spawned,
            Err(e) => {
                log::error!("[{}] Failed to spawn process: {}", self.core.name(), e);
                self.core.fail(ProcessError::SpawnFailed {
                    command: self.command.clone(),
                    source: e,
                });
                return;
            }
        };

        *lock(&self.handle) = Some(handle.clone());
        self.core.mark_started();

        let core = self.core.clone();
        tokio::spawn(async move {
            let forwarder = tokio::spawn({
                let core = core.clone();
                async move { core.forward_output(output, || {}).await }
            });
            let status = handle.wait().await;
            // Background grandchildren may keep the output open past exit
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, forwarder).await.is_err() {
                log::debug!("[{}] Output still open after exit", core.name());
            }
            match status {
                Ok(code) => {
                    core.mark_exited(code);
                }
                Err(e) => {
                    core.emit_error(ProcessError::Wait(e));
                    core.mark_exited(-1);
                }
            }
        });
    }

    async fn kill(&self, signal: Signal) -> bool {
        let handle = lock(&self.handle).clone();
        let Some(handle) = handle else {
            return false;
        };
        if self.core.is_ended() {
            return false;
        }

        self.core.mark_exiting(signal);
        if let Err(e) = handle.signal(signal) {
            log::debug!("[{}] Failed to send {}: {}", self.core.name(), signal, e);
        }
        if signal == Signal::Kill {
            self.cleanup().await;
        }
        true
    }

    async fn cleanup(&self) {
        let handle = lock(&self.handle).clone();
        let Some(handle) = handle else {
            return;
        };
        // The group may already be gone
        if let Err(e) = handle.kill_tree() {
            log::debug!("[{}] Failed to kill process tree: {}", self.core.name(), e);
        }
    }
}
