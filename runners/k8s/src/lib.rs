mod cleanup;
mod control;
mod helm;
mod logs;
mod runner;
mod values;
mod wait;

pub use runner::{K8sRunner, K8sRunnerConfig, K8sRunnerError};
