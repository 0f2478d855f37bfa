use async_trait::async_trait;

use super::{DynError, Expectation, RunContext, runtime::context::RunMetrics};
use crate::topology::GeneratedTopology;

#[async_trait]
pub trait Workload: Send + Sync {
    fn name(&self) -> &str;

    /// Expectations bundled with this workload, registered in order right
    /// after the workload itself.
    fn expectations(&self) -> Vec<Box<dyn Expectation>> {
        Vec::new()
    }

    /// Validates prerequisites against the generated topology before any
    /// workload starts. Runs again if the scenario is deployed a second
    /// time, so derived state must be recomputed here.
    fn init(
        &mut self,
        _descriptors: &GeneratedTopology,
        _run_metrics: &RunMetrics,
    ) -> Result<(), DynError> {
        Ok(())
    }

    /// Drives traffic until completion or cooperative cancellation at the
    /// end of the scenario window.
    async fn start(&self, ctx: &RunContext) -> Result<(), DynError>;
}
