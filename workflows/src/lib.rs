pub mod builder;
pub mod expectations;
pub mod workloads;

pub use builder::{ChaosBuilderExt, ScenarioBuilderExt};
pub use expectations::ConsensusLiveness;
pub use workloads::transaction::TxFlowExpectation;
