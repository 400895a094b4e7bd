//! Readiness evaluation
//!
//! Readiness is the AND of every condition an app declares: a matching log
//! line, its own exit, and TCP reachability of its ports. An app declaring
//! nothing is ready as soon as it has started. When readiness fires the app's
//! `export` map is published before the ready flag flips, so dependents
//! always observe the exported values.

use crate::config::{Environment, PortValue, ReadySpec, ScalarValue, SubstitutionContext, WaitForPorts};
use crate::runtime::container::PortSpec;
use crate::runtime::process::{Process, ProcessEvent, ProcessState, Subscription};
use futures::future::{BoxFuture, FutureExt, OptionFuture};
use indexmap::IndexMap;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Timing of TCP reachability probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTiming {
    /// Delay before the first probe
    pub first_probe: Duration,
    /// Delay between subsequent probes
    pub interval: Duration,
}

impl Default for ProbeTiming {
    fn default() -> Self {
        Self {
            first_probe: Duration::from_millis(100),
            interval: Duration::from_millis(500),
        }
    }
}

/// Conditions resolved from a [`ReadySpec`] for one process
#[derive(Debug, Default)]
struct Conditions {
    log: Option<Regex>,
    when_done: bool,
    ports: Vec<u16>,
}

impl Conditions {
    fn resolve(process: &dyn Process, ready: Option<&ReadySpec>) -> Self {
        let Some(ready) = ready else {
            return Self::default();
        };

        let log = ready.wait_for_log.as_deref().and_then(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                log::warn!("[{}] Ignoring invalid wait_for_log: {}", process.name(), e);
                None
            }
        });

        let ports = match &ready.wait_for_ports {
            None | Some(WaitForPorts::All(false)) => Vec::new(),
            Some(WaitForPorts::All(true)) => match process.declared_tcp_ports() {
                Some(ports) => ports,
                None => {
                    log::warn!(
                        "[{}] wait_for_ports: true needs declared container ports, ignoring",
                        process.name()
                    );
                    Vec::new()
                }
            },
            Some(WaitForPorts::List(ports)) => ports
                .iter()
                .filter_map(|port| Self::probe_port(process, port))
                .collect(),
        };

        Self {
            log,
            when_done: ready.when_done.unwrap_or(false),
            ports,
        }
    }

    fn probe_port(process: &dyn Process, port: &PortValue) -> Option<u16> {
        match PortSpec::parse(port) {
            Ok(spec) => Some(spec.source_port),
            Err(e) => {
                log::warn!("[{}] Ignoring wait_for_ports entry: {}", process.name(), e);
                None
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.log.is_none() && !self.when_done && self.ports.is_empty()
    }
}

/// Watches processes and fires their readiness
#[derive(Debug, Clone, Default)]
pub struct ReadinessEvaluator {
    timing: ProbeTiming,
    host_variables: Environment,
}

impl ReadinessEvaluator {
    /// `host_variables` take part in `export` substitution
    pub fn new(timing: ProbeTiming, host_variables: Environment) -> Self {
        Self {
            timing,
            host_variables,
        }
    }

    /// Start watching `process`
    ///
    /// Events are subscribed to before this returns, so a process started
    /// afterwards cannot slip past its conditions. The watch ends by itself
    /// once readiness fired or the process exits or begins killing.
    pub fn evaluate(
        &self,
        process: Arc<dyn Process>,
        ready: Option<&ReadySpec>,
        export: &IndexMap<String, ScalarValue>,
    ) -> Subscription {
        let conditions = Conditions::resolve(process.as_ref(), ready);
        let watch = Watch {
            events: process.core().subscribe(),
            process,
            notify: !conditions.is_empty(),
            conditions,
            timing: self.timing,
            host_variables: self.host_variables.clone(),
            export: export.clone(),
        };
        let task = tokio::spawn(watch.run());
        Subscription::new(task.abort_handle())
    }
}

struct Watch {
    process: Arc<dyn Process>,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
    conditions: Conditions,
    notify: bool,
    timing: ProbeTiming,
    host_variables: Environment,
    export: IndexMap<String, ScalarValue>,
}

impl Watch {
    async fn run(mut self) {
        let core = self.process.core().clone();
        let mut started = core.state() != ProcessState::Created;
        let mut log_pending = self.conditions.log.is_some();
        let done_pending = self.conditions.when_done;
        let mut ports_pending = !self.conditions.ports.is_empty();
        let mut probe: OptionFuture<BoxFuture<'static, bool>> = None.into();

        if started && ports_pending {
            probe = Some(self.probe()).into();
        }

        loop {
            if started && !log_pending && !done_pending && !ports_pending {
                self.fire().await;
                return;
            }

            tokio::select! {
                event = self.events.recv() => match event {
                    Some(ProcessEvent::Started) => {
                        started = true;
                        if ports_pending {
                            probe = Some(self.probe()).into();
                        }
                    }
                    Some(ProcessEvent::Line(line)) => {
                        if log_pending && self.matches(&line) {
                            log_pending = false;
                        }
                    }
                    Some(ProcessEvent::Exit { .. }) => {
                        // Exit satisfies `when_done`; nothing else can change afterwards
                        if !log_pending && !ports_pending {
                            self.fire().await;
                        }
                        return;
                    }
                    Some(ProcessEvent::Killing(_)) | None => return,
                    Some(_) => {}
                },
                Some(reachable) = &mut probe => {
                    probe = None.into();
                    if reachable {
                        ports_pending = false;
                    }
                }
                _ = core.wait_until_ended() => {
                    // The exit event is queued before the state changes
                    while let Ok(event) = self.events.try_recv() {
                        match event {
                            ProcessEvent::Line(line) if log_pending && self.matches(&line) => {
                                log_pending = false;
                            }
                            ProcessEvent::Exit { .. } => {
                                if !log_pending && !ports_pending {
                                    self.fire().await;
                                }
                                return;
                            }
                            ProcessEvent::Killing(_) => return,
                            _ => {}
                        }
                    }
                    return;
                }
            }
        }
    }

    fn matches(&self, line: &str) -> bool {
        self.conditions
            .log
            .as_ref()
            .is_some_and(|regex| regex.is_match(line))
    }

    fn probe(&self) -> BoxFuture<'static, bool> {
        wait_for_ports(self.process.clone(), self.conditions.ports.clone(), self.timing).boxed()
    }

    /// Publish exports, then flip readiness
    async fn fire(&self) {
        // Exports may reference the container address, published just after start
        let _ = self.process.resolve_host().await;

        let core = self.process.core();
        let exports = SubstitutionContext::new()
            .with_vars(self.host_variables.clone())
            .with_vars(core.exported_environment())
            .with_vars(core.variables())
            .substitute_scalars(&self.export);
        core.extend_exported(exports);

        if core.mark_ready(self.notify) && self.notify {
            log::info!("[{}] Ready", core.name());
        }
    }
}

/// Wait until every port accepts a TCP connection on the process's host
///
/// Returns `false` when the host can never be known.
pub async fn wait_for_ports(process: Arc<dyn Process>, ports: Vec<u16>, timing: ProbeTiming) -> bool {
    let Some(host) = process.resolve_host().await else {
        return false;
    };
    tokio::time::sleep(timing.first_probe).await;

    let name = process.name();
    let probes = ports.into_iter().map(|port| {
        let host = host.clone();
        async move {
            loop {
                let attempt = tokio::time::timeout(timing.interval, TcpStream::connect((host.as_str(), port)));
                if let Ok(Ok(_)) = attempt.await {
                    log::debug!("[{}] Port {}:{} is reachable", name, host, port);
                    return;
                }
                tokio::time::sleep(timing.interval).await;
            }
        }
    });
    futures::future::join_all(probes).await;
    true
}
