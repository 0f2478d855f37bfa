use std::{num::NonZero, time::Duration};

const DEFAULT_SLOT_DURATION: Duration = Duration::from_secs(2);

/// Consensus parameters shared by every node in a generated cluster.
#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub slot_duration: Duration,
    /// Probability that any given slot produces a block.
    pub active_slot_coeff: f64,
    pub security_param: NonZero<u32>,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            slot_duration: DEFAULT_SLOT_DURATION,
            // a block should be produced (on average) almost every slot, while
            // leaving nodes some room to sync before settling on a chain
            active_slot_coeff: 0.9,
            security_param: NonZero::new(10).unwrap(),
        }
    }
}

impl ConsensusParams {
    #[must_use]
    pub fn with_slot_duration(mut self, slot_duration: Duration) -> Self {
        self.slot_duration = slot_duration;
        self
    }

    #[must_use]
    pub fn with_active_slot_coeff(mut self, coeff: f64) -> Self {
        self.active_slot_coeff = coeff;
        self
    }
}
