use std::{
    num::{NonZeroU64, NonZeroUsize},
    time::Duration,
};

use testbed_core::{
    scenario::{Builder as CoreScenarioBuilder, NodeControlCapability},
    topology::configs::NetworkLayout,
};

use crate::{
    expectations::ConsensusLiveness,
    workloads::{chaos::RandomRestartWorkload, transaction},
};

const fn transaction_rate_checked(rate: u64) -> NonZeroU64 {
    match NonZeroU64::new(rate) {
        Some(value) => value,
        None => panic!("transaction rate must be non-zero"),
    }
}

const fn transaction_users_checked(users: usize) -> NonZeroUsize {
    match NonZeroUsize::new(users) {
        Some(value) => value,
        None => panic!("transaction user count must be non-zero"),
    }
}

pub trait ScenarioBuilderExt<Caps>: Sized {
    fn topology(self) -> TopologyConfigurator<Caps>;
    fn transactions(self) -> TransactionFlowBuilder<Caps>;
    #[must_use]
    fn expect_consensus_liveness(self) -> Self;
}

impl<Caps> ScenarioBuilderExt<Caps> for CoreScenarioBuilder<Caps> {
    fn topology(self) -> TopologyConfigurator<Caps> {
        TopologyConfigurator { builder: self }
    }

    fn transactions(self) -> TransactionFlowBuilder<Caps> {
        TransactionFlowBuilder::new(self)
    }

    fn expect_consensus_liveness(self) -> Self {
        self.with_expectation(ConsensusLiveness::default())
    }
}

pub struct TopologyConfigurator<Caps> {
    builder: CoreScenarioBuilder<Caps>,
}

impl<Caps> TopologyConfigurator<Caps> {
    #[must_use]
    pub fn validators(mut self, count: usize) -> Self {
        self.builder = self
            .builder
            .map_topology(|topology| topology.with_validator_count(count));
        self
    }

    #[must_use]
    pub fn executors(mut self, count: usize) -> Self {
        self.builder = self
            .builder
            .map_topology(|topology| topology.with_executor_count(count));
        self
    }

    #[must_use]
    pub fn network_layout(mut self, layout: NetworkLayout) -> Self {
        self.builder = self
            .builder
            .map_topology(|topology| topology.with_network_layout(layout));
        self
    }

    #[must_use]
    pub fn apply(self) -> CoreScenarioBuilder<Caps> {
        self.builder
    }
}

pub struct TransactionFlowBuilder<Caps> {
    builder: CoreScenarioBuilder<Caps>,
    rate: NonZeroU64,
    users: NonZeroUsize,
}

impl<Caps> TransactionFlowBuilder<Caps> {
    const fn default_rate() -> NonZeroU64 {
        transaction_rate_checked(1)
    }

    const fn default_users() -> NonZeroUsize {
        transaction_users_checked(1)
    }

    const fn new(builder: CoreScenarioBuilder<Caps>) -> Self {
        Self {
            builder,
            rate: Self::default_rate(),
            users: Self::default_users(),
        }
    }

    #[must_use]
    pub const fn rate(mut self, rate: u64) -> Self {
        self.rate = transaction_rate_checked(rate);
        self
    }

    #[must_use]
    pub const fn rate_per_block(mut self, rate: NonZeroU64) -> Self {
        self.rate = rate;
        self
    }

    #[must_use]
    pub const fn users(mut self, users: usize) -> Self {
        self.users = transaction_users_checked(users);
        self
    }

    #[must_use]
    pub fn apply(mut self) -> CoreScenarioBuilder<Caps> {
        let workload = transaction::Workload::new(self.rate, self.users);
        self.builder = self.builder.with_workload(workload);
        self.builder
    }
}

pub trait ChaosBuilderExt: Sized {
    fn chaos_random_restart(self) -> ChaosRestartBuilder;
}

impl ChaosBuilderExt for CoreScenarioBuilder<NodeControlCapability> {
    fn chaos_random_restart(self) -> ChaosRestartBuilder {
        ChaosRestartBuilder::new(self)
    }
}

pub struct ChaosRestartBuilder {
    builder: CoreScenarioBuilder<NodeControlCapability>,
    min_delay: Duration,
    max_delay: Duration,
    include_validators: bool,
    include_executors: bool,
}

impl ChaosRestartBuilder {
    #[expect(
        clippy::missing_const_for_fn,
        reason = "Scenario builder contains runtime-only structures"
    )]
    fn new(builder: CoreScenarioBuilder<NodeControlCapability>) -> Self {
        Self {
            builder,
            min_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            include_validators: true,
            include_executors: true,
        }
    }

    #[must_use]
    pub fn min_delay(mut self, delay: Duration) -> Self {
        assert!(!delay.is_zero(), "chaos restart min delay must be non-zero");
        self.min_delay = delay;
        self
    }

    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        assert!(!delay.is_zero(), "chaos restart max delay must be non-zero");
        self.max_delay = delay;
        self
    }

    #[must_use]
    #[expect(
        clippy::missing_const_for_fn,
        reason = "builder mutates runtime-only configuration"
    )]
    pub fn include_validators(mut self, enabled: bool) -> Self {
        self.include_validators = enabled;
        self
    }

    #[must_use]
    #[expect(
        clippy::missing_const_for_fn,
        reason = "builder mutates runtime-only configuration"
    )]
    pub fn include_executors(mut self, enabled: bool) -> Self {
        self.include_executors = enabled;
        self
    }

    #[must_use]
    pub fn apply(mut self) -> CoreScenarioBuilder<NodeControlCapability> {
        assert!(
            self.min_delay <= self.max_delay,
            "chaos restart min delay must not exceed max delay"
        );
        assert!(
            self.include_validators || self.include_executors,
            "chaos restart requires at least one node group"
        );

        let workload = RandomRestartWorkload::new(
            self.min_delay,
            self.max_delay,
            self.include_validators,
            self.include_executors,
        );
        self.builder = self.builder.with_workload(workload);
        self.builder
    }
}

#[cfg(test)]
mod tests {
    use testbed_core::scenario::ScenarioBuilder;

    use super::*;

    #[test]
    fn dsl_composes_topology_workloads_and_expectations() {
        let scenario = ScenarioBuilder::with_node_counts(1, 0)
            .topology()
            .validators(3)
            .network_layout(NetworkLayout::Star)
            .apply()
            .transactions()
            .rate(2)
            .users(2)
            .apply()
            .expect_consensus_liveness()
            .wallets(2)
            .with_run_duration(Duration::from_secs(30))
            .build()
            .unwrap();

        assert_eq!(scenario.topology().validators().len(), 3);
        assert_eq!(scenario.workloads().len(), 1);
        assert_eq!(scenario.workloads()[0].name(), "tx_flow");

        let expectations: Vec<&str> = scenario
            .expectations()
            .iter()
            .map(|expectation| expectation.name())
            .collect();
        assert_eq!(expectations, vec!["tx_acceptance", "consensus_liveness"]);
    }

    #[test]
    fn chaos_flow_composes_on_node_control_builders() {
        let scenario = ScenarioBuilder::with_node_counts(2, 0)
            .enable_node_control()
            .chaos_random_restart()
            .min_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(2))
            .include_executors(false)
            .apply()
            .with_run_duration(Duration::from_secs(30))
            .build()
            .unwrap();

        assert!(scenario.requires_node_control());
        assert_eq!(scenario.workloads()[0].name(), "chaos_random_restart");
    }

    #[test]
    #[should_panic(expected = "transaction rate must be non-zero")]
    fn zero_transaction_rate_panics() {
        let _ = ScenarioBuilder::with_node_counts(1, 0).transactions().rate(0);
    }

    #[test]
    #[should_panic(expected = "chaos restart min delay must not exceed max delay")]
    fn inverted_chaos_delays_panic() {
        let _ = ScenarioBuilder::with_node_counts(1, 0)
            .enable_node_control()
            .chaos_random_restart()
            .min_delay(Duration::from_secs(5))
            .max_delay(Duration::from_secs(1))
            .apply();
    }

    #[test]
    #[should_panic(expected = "chaos restart requires at least one node group")]
    fn chaos_without_any_node_group_panics() {
        let _ = ScenarioBuilder::with_node_counts(1, 0)
            .enable_node_control()
            .chaos_random_restart()
            .include_validators(false)
            .include_executors(false)
            .apply();
    }
}
