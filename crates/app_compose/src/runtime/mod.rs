//! Runtime components for process management

pub mod container;
pub mod dependency;
pub mod native;
pub mod orchestrator;
pub mod process;
pub mod readiness;
pub mod shutdown;
pub mod single_flight;

pub use dependency::*;
pub use native::{NativeProcess, ShellSpawner, Spawner};
pub use orchestrator::*;
pub use process::*;
pub use readiness::{ProbeTiming, ReadinessEvaluator};
pub use shutdown::*;
pub use single_flight::SingleFlight;
