mod control;
mod process;
mod runner;

pub use runner::{LocalDeployer, LocalDeployerConfig, LocalDeployerError};
