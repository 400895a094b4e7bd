//! Console output of app lines and lifecycle narration

use crate::runtime::{ProcessCore, ProcessEvent, Subscription};
use std::io::Write;
use std::sync::Arc;

/// Destination of app output
pub trait LineSink: Send + Sync {
    /// One line of app output
    fn line(&self, app: &str, text: &str);

    /// Progress or lifecycle narration
    fn status(&self, app: &str, message: &str);
}

/// Prints `name | line`, names right-aligned to the longest app name
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    width: usize,
}

impl ConsoleSink {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            width: names.into_iter().map(str::len).max().unwrap_or(0),
        }
    }

    fn prefix(&self, app: &str) -> String {
        format!("{:>width$} |", app, width = self.width)
    }
}

impl LineSink for ConsoleSink {
    fn line(&self, app: &str, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{} {}", self.prefix(app), text);
    }

    fn status(&self, app: &str, message: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{} ... {}", self.prefix(app), message);
    }
}

/// Forward the events of one process to a sink until disposed
pub fn attach(core: &ProcessCore, sink: Arc<dyn LineSink>) -> Subscription {
    let mut events = core.subscribe();
    let name = core.name().to_string();

    let task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Line(line) => sink.line(&name, &line),
                ProcessEvent::Status(message) => sink.status(&name, &message),
                ProcessEvent::Started => log::debug!("[{}] Started", name),
                ProcessEvent::Ready { notify: true } => sink.status(&name, "ready"),
                ProcessEvent::Ready { notify: false } => {}
                ProcessEvent::Killing(signal) => sink.status(&name, &format!("sending {}", signal)),
                ProcessEvent::Exit { code } => {
                    sink.status(&name, &format!("exited with code {}", code))
                }
                ProcessEvent::Error(error) => {
                    log::error!("[{}] {}", name, error);
                    sink.status(&name, &format!("error: {}", error));
                }
            }
        }
    });

    Subscription::new(task.abort_handle())
}
