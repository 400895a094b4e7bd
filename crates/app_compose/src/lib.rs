//! app_compose
//!
//! Runs the apps of a development environment side by side: native
//! commands through a shell and containers through a container engine.
//!
//! # Overview
//!
//! - Apps start once every app they depend on is ready
//! - Readiness comes from a log line, open ports or the app finishing
//! - Ready apps export variables to the apps that depend on them
//! - Images are pulled once per run and rebuilt only when their inputs change
//! - Ctrl+C stops apps gracefully, escalating from SIGINT to SIGTERM to SIGKILL
//!
//! # Example Compose File
//!
//! ```yaml
//! environment:
//!   DATA_DIR: "$HOME/.cache/shop"
//!
//! apps:
//!   db:
//!     image: postgres:16
//!     ports: [5432]
//!     environment:
//!       POSTGRES_PASSWORD: dev
//!     ready:
//!       wait_for_ports: true
//!     export:
//!       DATABASE_URL: "postgres://postgres:dev@$IP_ADDRESS:5432/postgres"
//!
//!   api:
//!     command: cargo run
//!     depends_on: [db]
//!     quit_signal: SIGTERM
//!     ready:
//!       wait_for_log: "listening on"
//! ```

pub mod cli;
pub mod config;
pub mod console;
pub mod runtime;

pub use cli::ComposeArgs;
pub use config::{AppSpec, ComposeFile, ComposeFileError, SpecError, SubstitutionContext};
pub use console::{ConsoleSink, LineSink};
pub use runtime::{
    DependencyError, DependencyGraph, Orchestrator, OrchestratorConfig, OrchestratorError,
    Process, ProcessError, ProcessEvent, ProcessState, Signal,
};
