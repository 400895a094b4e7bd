//! Interrupt-driven shutdown escalation
//!
//! The first interrupt stops every live app gracefully: its quit signal,
//! then `SIGTERM` once the quit timeout expires, then `SIGKILL` once the
//! terminate timeout expires. A second interrupt force-kills everything and
//! a third exits at once.

use crate::runtime::orchestrator::ProcessRegistry;
use crate::runtime::process::{Process, Signal};
use futures::future::{BoxFuture, FutureExt, OptionFuture};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Exit status of a graceful run
pub const EXIT_SUCCESS: i32 = 0;
/// Exit status of a forced or panic exit
pub const EXIT_FORCED: i32 = 1;

/// Escalation state; only ever advances
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    SoftExit,
    ForcedExit,
    PanicExit,
}

/// What an interrupt asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    Graceful,
    ForceKill,
    Exit,
}

/// Bounded waits between signal escalations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownTimeouts {
    /// Wait after the quit signal before sending `SIGTERM`
    pub quit: Duration,
    /// Wait after `SIGTERM` before sending `SIGKILL`
    pub terminate: Duration,
}

impl Default for ShutdownTimeouts {
    fn default() -> Self {
        Self {
            quit: Duration::from_millis(3000),
            terminate: Duration::from_millis(5000),
        }
    }
}

/// Drives the escalation for every app of a registry
pub struct ShutdownCoordinator {
    registry: Arc<ProcessRegistry>,
    timeouts: ShutdownTimeouts,
    state: Mutex<ShutdownState>,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<ProcessRegistry>, timeouts: ShutdownTimeouts) -> Self {
        Self {
            registry,
            timeouts,
            state: Mutex::new(ShutdownState::SoftExit),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *crate::runtime::process::lock(&self.state)
    }

    /// Advance the escalation by one interrupt
    pub fn on_interrupt(&self) -> InterruptAction {
        let mut state = crate::runtime::process::lock(&self.state);
        let (next, action) = match *state {
            ShutdownState::SoftExit => (ShutdownState::ForcedExit, InterruptAction::Graceful),
            ShutdownState::ForcedExit => (ShutdownState::PanicExit, InterruptAction::ForceKill),
            ShutdownState::PanicExit => (ShutdownState::PanicExit, InterruptAction::Exit),
        };
        *state = next;
        action
    }

    /// Stop every live app, escalating per app on timeout
    pub async fn stop_gracefully(&self) {
        self.registry.begin_shutdown().await;

        let stops = self
            .registry
            .live_processes()
            .into_iter()
            .map(|(process, quit_signal)| self.stop(process, quit_signal));
        futures::future::join_all(stops).await;
        self.registry.cleanup().await;
        log::info!("All apps stopped");
    }

    async fn stop(&self, process: Arc<dyn Process>, quit_signal: Signal) {
        let core = process.core();
        if !process.kill(quit_signal).await {
            return;
        }
        if tokio::time::timeout(self.timeouts.quit, core.wait_until_ended()).await.is_ok() {
            return;
        }

        log::warn!(
            "[{}] Still running {:?} after {}, sending SIGTERM",
            core.name(),
            self.timeouts.quit,
            quit_signal
        );
        process.kill(Signal::Terminate).await;
        if tokio::time::timeout(self.timeouts.terminate, core.wait_until_ended())
            .await
            .is_ok()
        {
            return;
        }

        log::warn!("[{}] Still running after SIGTERM, sending SIGKILL", core.name());
        process.terminate().await;
    }

    /// Send `SIGKILL` to every live app without waiting
    pub async fn force_kill(&self) {
        self.registry.begin_shutdown().await;
        let kills = self
            .registry
            .live_processes()
            .into_iter()
            .map(|(process, _)| async move {
                process.terminate().await;
            });
        futures::future::join_all(kills).await;
    }

    /// Run until every app has ended or the interrupts demand an exit
    ///
    /// Returns the exit status of the orchestrator.
    pub async fn supervise(&self, mut interrupts: mpsc::UnboundedReceiver<()>) -> i32 {
        let mut graceful: OptionFuture<BoxFuture<'_, ()>> = None.into();
        let mut interrupts_open = true;

        loop {
            tokio::select! {
                _ = self.registry.wait_all_ended() => {
                    log::info!("All apps have ended");
                    self.registry.cleanup().await;
                    return EXIT_SUCCESS;
                }
                Some(()) = &mut graceful => {
                    return EXIT_SUCCESS;
                }
                interrupt = interrupts.recv(), if interrupts_open => {
                    if interrupt.is_none() {
                        interrupts_open = false;
                        continue;
                    }
                    match self.on_interrupt() {
                        InterruptAction::Graceful => {
                            log::info!("Gracefully stopping... (press Ctrl+C again to force)");
                            graceful = Some(self.stop_gracefully().boxed()).into();
                        }
                        InterruptAction::ForceKill => {
                            log::warn!("Forcing shutdown");
                            self.force_kill().await;
                            return EXIT_FORCED;
                        }
                        InterruptAction::Exit => return EXIT_FORCED,
                    }
                }
            }
        }
    }
}

/// Install the process-wide Ctrl+C handler, delivering interrupts to a channel
pub fn install_interrupt_handler() -> Result<mpsc::UnboundedReceiver<()>, ctrlc::Error> {
    let (tx, rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_only_advances() {
        let registry = Arc::new(ProcessRegistry::default());
        let coordinator = ShutdownCoordinator::new(registry, ShutdownTimeouts::default());

        assert_eq!(coordinator.state(), ShutdownState::SoftExit);
        assert_eq!(coordinator.on_interrupt(), InterruptAction::Graceful);
        assert_eq!(coordinator.state(), ShutdownState::ForcedExit);
        assert_eq!(coordinator.on_interrupt(), InterruptAction::ForceKill);
        assert_eq!(coordinator.state(), ShutdownState::PanicExit);
        assert_eq!(coordinator.on_interrupt(), InterruptAction::Exit);
        assert_eq!(coordinator.state(), ShutdownState::PanicExit);
    }

    #[test]
    fn test_default_timeouts() {
        let timeouts = ShutdownTimeouts::default();
        assert_eq!(timeouts.quit, Duration::from_secs(3));
        assert_eq!(timeouts.terminate, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_empty_registry_supervises_to_success() {
        let coordinator = ShutdownCoordinator::new(
            Arc::new(ProcessRegistry::default()),
            ShutdownTimeouts::default(),
        );
        let (_tx, rx) = mpsc::unbounded_channel();
        assert_eq!(coordinator.supervise(rx).await, EXIT_SUCCESS);
    }
}
