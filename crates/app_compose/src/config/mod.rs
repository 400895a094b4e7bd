//! Compose file configuration parsing and substitution

mod compose_file;
mod substitution;

pub use compose_file::*;
pub use substitution::*;
