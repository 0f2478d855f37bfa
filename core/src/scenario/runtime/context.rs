use std::{fmt, sync::Arc, time::Duration};

use super::{block_feed::BlockFeed, metrics::Metrics, node_clients::ClusterClient};
use crate::{
    nodes::ApiClient,
    scenario::{NodeClients, NodeControlHandle},
    topology::{GeneratedTopology, configs::wallet::WalletAccount},
};

/// Everything a running workload or expectation may touch: the generated
/// descriptors, per-node API clients, telemetry, the shared block feed and the
/// optional node-control handle of the active backend.
pub struct RunContext {
    descriptors: GeneratedTopology,
    node_clients: NodeClients,
    metrics: RunMetrics,
    telemetry: Metrics,
    block_feed: BlockFeed,
    node_control: Option<Arc<dyn NodeControlHandle>>,
}

impl RunContext {
    #[must_use]
    pub fn new(
        descriptors: GeneratedTopology,
        node_clients: NodeClients,
        run_duration: Duration,
        telemetry: Metrics,
        block_feed: BlockFeed,
        node_control: Option<Arc<dyn NodeControlHandle>>,
    ) -> Self {
        let metrics = RunMetrics::new(&descriptors, run_duration);

        Self {
            descriptors,
            node_clients,
            metrics,
            telemetry,
            block_feed,
            node_control,
        }
    }

    #[must_use]
    pub const fn descriptors(&self) -> &GeneratedTopology {
        &self.descriptors
    }

    #[must_use]
    pub const fn node_clients(&self) -> &NodeClients {
        &self.node_clients
    }

    #[must_use]
    pub fn random_node_client(&self) -> Option<&ApiClient> {
        self.node_clients.any_client()
    }

    #[must_use]
    pub fn block_feed(&self) -> BlockFeed {
        self.block_feed.clone()
    }

    #[must_use]
    pub fn wallet_accounts(&self) -> &[WalletAccount] {
        self.descriptors.wallet_accounts()
    }

    #[must_use]
    pub const fn telemetry(&self) -> &Metrics {
        &self.telemetry
    }

    #[must_use]
    pub const fn run_duration(&self) -> Duration {
        self.metrics.run_duration()
    }

    #[must_use]
    pub const fn expected_blocks(&self) -> u64 {
        self.metrics.expected_consensus_blocks()
    }

    #[must_use]
    pub const fn run_metrics(&self) -> RunMetrics {
        self.metrics
    }

    #[must_use]
    pub fn node_control(&self) -> Option<Arc<dyn NodeControlHandle>> {
        self.node_control.clone()
    }

    #[must_use]
    pub const fn cluster_client(&self) -> ClusterClient<'_> {
        self.node_clients.cluster_client()
    }
}

/// Handle returned by the runner to control the lifecycle of the run.
pub struct RunHandle {
    run_context: Arc<RunContext>,
    cleanup_guard: Option<Box<dyn CleanupGuard>>,
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle").finish_non_exhaustive()
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if let Some(guard) = self.cleanup_guard.take() {
            guard.cleanup();
        }
    }
}

impl RunHandle {
    #[must_use]
    pub fn new(context: RunContext, cleanup_guard: Option<Box<dyn CleanupGuard>>) -> Self {
        Self {
            run_context: Arc::new(context),
            cleanup_guard,
        }
    }

    #[must_use]
    pub(crate) fn from_shared(
        context: Arc<RunContext>,
        cleanup_guard: Option<Box<dyn CleanupGuard>>,
    ) -> Self {
        Self {
            run_context: context,
            cleanup_guard,
        }
    }

    #[must_use]
    pub fn context(&self) -> &RunContext {
        &self.run_context
    }
}

/// Derived run parameters shared with workloads before deployment starts.
#[derive(Clone, Copy)]
pub struct RunMetrics {
    run_duration: Duration,
    expected_blocks: u64,
    block_interval_hint: Duration,
}

impl RunMetrics {
    #[must_use]
    pub fn new(descriptors: &GeneratedTopology, run_duration: Duration) -> Self {
        Self::from_topology(descriptors, run_duration)
    }

    #[must_use]
    pub fn from_topology(descriptors: &GeneratedTopology, run_duration: Duration) -> Self {
        let slot_duration = descriptors.slot_duration();
        let active_slot_coeff = descriptors.active_slot_coeff();

        let expected_blocks =
            calculate_expected_blocks(run_duration, slot_duration, active_slot_coeff);
        // A coefficient of 0.5 means one block every two slots on average.
        let block_interval_hint = if active_slot_coeff > 0.0 {
            slot_duration.div_f64(active_slot_coeff.min(1.0))
        } else {
            Duration::ZERO
        };

        Self {
            run_duration,
            expected_blocks,
            block_interval_hint,
        }
    }

    #[must_use]
    pub const fn run_duration(&self) -> Duration {
        self.run_duration
    }

    #[must_use]
    pub const fn expected_consensus_blocks(&self) -> u64 {
        self.expected_blocks
    }

    /// Mean time between blocks implied by the consensus parameters.
    #[must_use]
    pub const fn block_interval_hint(&self) -> Duration {
        self.block_interval_hint
    }
}

/// Backend teardown hook fired exactly once when the owning handle goes away.
pub trait CleanupGuard: Send {
    fn cleanup(self: Box<Self>);
}

/// Expected number of block production opportunities within the run window.
fn calculate_expected_blocks(
    run_duration: Duration,
    slot_duration: Duration,
    active_slot_coeff: f64,
) -> u64 {
    if slot_duration.is_zero() {
        return 0;
    }
    let slot_secs = slot_duration.as_secs_f64();
    let run_secs = run_duration.as_secs_f64();
    let expected = run_secs / slot_secs * active_slot_coeff;

    expected.ceil().clamp(0.0, u64::MAX as f64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{TopologyBuilder, TopologyConfig, configs::consensus::ConsensusParams};

    fn descriptors_with_slot(slot: Duration, coeff: f64) -> GeneratedTopology {
        TopologyBuilder::new(TopologyConfig::with_node_numbers(1, 0))
            .with_consensus_params(
                ConsensusParams::default()
                    .with_slot_duration(slot)
                    .with_active_slot_coeff(coeff),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn expected_blocks_round_up_per_slot_odds() {
        let descriptors = descriptors_with_slot(Duration::from_secs(2), 0.5);
        let metrics = RunMetrics::from_topology(&descriptors, Duration::from_secs(60));

        // 30 slots at 50% odds.
        assert_eq!(metrics.expected_consensus_blocks(), 15);
    }

    #[test]
    fn block_interval_hint_stretches_slot_by_coefficient() {
        let descriptors = descriptors_with_slot(Duration::from_secs(4), 0.5);
        let metrics = RunMetrics::from_topology(&descriptors, Duration::from_secs(10));

        assert_eq!(metrics.block_interval_hint(), Duration::from_secs(8));
    }

    #[test]
    fn zero_coefficient_yields_no_interval_hint() {
        let descriptors = descriptors_with_slot(Duration::from_secs(2), 0.0);
        let metrics = RunMetrics::from_topology(&descriptors, Duration::from_secs(30));

        assert!(metrics.block_interval_hint().is_zero());
    }

    #[test]
    fn zero_slot_duration_yields_no_expected_blocks() {
        let descriptors = descriptors_with_slot(Duration::ZERO, 0.9);
        let metrics = RunMetrics::from_topology(&descriptors, Duration::from_secs(30));

        assert_eq!(metrics.expected_consensus_blocks(), 0);
    }
}
