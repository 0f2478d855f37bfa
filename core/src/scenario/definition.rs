use std::{fmt, marker::PhantomData, sync::Arc, time::Duration};

use super::{
    capabilities::{NodeControlCapability, RequiresNodeControl},
    expectation::Expectation,
    workload::Workload,
};
use crate::topology::{
    GeneratedTopology, TopologyBuilder, TopologyConfig, TopologyError, configs::wallet::WalletParams,
};

const DEFAULT_FUNDS_PER_WALLET: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum ScenarioBuildError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Immutable scenario definition shared between the runner, workloads, and
/// expectations. The `Caps` marker records whether the scenario was granted
/// node-control access when it was described.
pub struct Scenario<Caps = ()> {
    topology: GeneratedTopology,
    workloads: Vec<Arc<dyn Workload>>,
    expectations: Vec<Box<dyn Expectation>>,
    duration: Duration,
    _caps: PhantomData<Caps>,
}

impl<Caps> fmt::Debug for Scenario<Caps> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario").finish_non_exhaustive()
    }
}

impl<Caps> Scenario<Caps> {
    fn new(
        topology: GeneratedTopology,
        workloads: Vec<Arc<dyn Workload>>,
        expectations: Vec<Box<dyn Expectation>>,
        duration: Duration,
    ) -> Self {
        Self {
            topology,
            workloads,
            expectations,
            duration,
            _caps: PhantomData,
        }
    }

    #[must_use]
    pub const fn topology(&self) -> &GeneratedTopology {
        &self.topology
    }

    #[must_use]
    pub fn workloads(&self) -> &[Arc<dyn Workload>] {
        &self.workloads
    }

    pub(crate) fn workloads_mut(&mut self) -> &mut [Arc<dyn Workload>] {
        &mut self.workloads
    }

    #[must_use]
    pub fn expectations(&self) -> &[Box<dyn Expectation>] {
        &self.expectations
    }

    #[must_use]
    pub fn expectations_mut(&mut self) -> &mut [Box<dyn Expectation>] {
        &mut self.expectations
    }

    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }
}

impl<Caps: RequiresNodeControl> Scenario<Caps> {
    /// Whether deployment backends must provide a node-control handle for
    /// this scenario to run.
    #[must_use]
    pub const fn requires_node_control(&self) -> bool {
        Caps::REQUIRED
    }
}

/// Builder used by callers to describe the desired scenario.
pub struct Builder<Caps = ()> {
    topology: TopologyBuilder,
    workloads: Vec<Arc<dyn Workload>>,
    expectations: Vec<Box<dyn Expectation>>,
    duration: Duration,
    _caps: PhantomData<Caps>,
}

pub type ScenarioBuilder = Builder<()>;

impl<Caps> Builder<Caps> {
    #[must_use]
    pub fn new(topology: TopologyBuilder) -> Self {
        Self {
            topology,
            workloads: Vec::new(),
            expectations: Vec::new(),
            duration: Duration::ZERO,
            _caps: PhantomData,
        }
    }

    #[must_use]
    pub fn with_node_counts(validators: usize, executors: usize) -> Self {
        Self::new(TopologyBuilder::new(TopologyConfig::with_node_numbers(
            validators, executors,
        )))
    }

    #[must_use]
    pub fn with_workload<W>(mut self, workload: W) -> Self
    where
        W: Workload + 'static,
    {
        self.expectations.extend(workload.expectations());
        self.workloads.push(Arc::new(workload));
        self
    }

    #[must_use]
    pub fn with_expectation<E>(mut self, expectation: E) -> Self
    where
        E: Expectation + 'static,
    {
        self.expectations.push(Box::new(expectation));
        self
    }

    #[must_use]
    pub const fn with_run_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    #[must_use]
    pub fn map_topology(mut self, f: impl FnOnce(TopologyBuilder) -> TopologyBuilder) -> Self {
        self.topology = f(self.topology);
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.topology = self.topology.with_seed(seed);
        self
    }

    #[must_use]
    pub fn with_wallet_params(mut self, wallet: WalletParams) -> Self {
        self.topology = self.topology.with_wallet_params(wallet);
        self
    }

    /// Funds `users` genesis wallets with a uniform default balance.
    #[must_use]
    pub fn wallets(self, users: usize) -> Self {
        self.with_wallet_params(WalletParams::uniform(users, DEFAULT_FUNDS_PER_WALLET))
    }

    /// Resolves the topology and freezes the scenario. Workload prerequisite
    /// checks do not run here; the runner performs them at deploy time, after
    /// run metrics are known.
    pub fn build(self) -> Result<Scenario<Caps>, ScenarioBuildError> {
        let Self {
            topology,
            workloads,
            expectations,
            duration,
            ..
        } = self;

        let generated = topology.build()?;
        let duration = enforce_min_duration(&generated, duration);

        Ok(Scenario::new(generated, workloads, expectations, duration))
    }
}

impl Builder<()> {
    /// Grants the scenario node-control access. Control-hungry workloads
    /// (restarts, pauses) only compose onto builders that took this step, and
    /// deployment backends without lifecycle control refuse the scenario.
    #[must_use]
    pub fn enable_node_control(self) -> Builder<NodeControlCapability> {
        let Self {
            topology,
            workloads,
            expectations,
            duration,
            ..
        } = self;

        Builder {
            topology,
            workloads,
            expectations,
            duration,
            _caps: PhantomData,
        }
    }
}

/// Scenarios always run long enough for a couple of block opportunities even
/// if the caller requested an extremely short window.
fn enforce_min_duration(descriptors: &GeneratedTopology, requested: Duration) -> Duration {
    const MIN_BLOCKS: u32 = 2;
    const FALLBACK_SECS: u64 = 10;

    let slot_duration = descriptors.slot_duration();
    let min_duration = if slot_duration.is_zero() {
        Duration::from_secs(FALLBACK_SECS)
    } else {
        slot_duration * MIN_BLOCKS
    };

    requested.max(min_duration)
}
