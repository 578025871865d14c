//! Process execution
//!
//! - `process.rs` - spawn abstraction with a bounded wait
//! - `shell.rs` - sequential command stacks run as the instance user

mod process;
mod shell;

pub use process::{CommandSpec, ExitResult, ProcessSpawner, SystemSpawner};
pub use shell::ShellExecutor;
