mod liveness;

pub use liveness::ConsensusLiveness;
