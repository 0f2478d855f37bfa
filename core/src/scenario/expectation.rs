use async_trait::async_trait;

use super::{DynError, RunContext};

#[async_trait]
pub trait Expectation: Send + Sync {
    fn name(&self) -> &str;

    /// Captures baseline state before any workload starts. Runs
    /// sequentially in registration order.
    async fn start_capture(&mut self, _ctx: &RunContext) -> Result<(), DynError> {
        Ok(())
    }

    /// Judges the quiesced cluster after all workloads have finished.
    async fn evaluate(&mut self, ctx: &RunContext) -> Result<(), DynError>;
}
