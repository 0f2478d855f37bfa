mod cleanup;
mod compose;
mod control;
mod runner;
mod wait;
mod workspace;

pub use runner::{ComposeRunner, ComposeRunnerConfig, ComposeRunnerError};
pub use workspace::ComposeWorkspace;
