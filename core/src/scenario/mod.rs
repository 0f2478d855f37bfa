//! Scenario orchestration primitives shared by workloads, expectations, and
//! deployment backends.

mod capabilities;
mod definition;
mod expectation;
pub mod http_probe;
mod runtime;
mod workload;

pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub use capabilities::{
    ControlOperation, NodeControlCapability, NodeControlError, NodeControlHandle,
    RequiresNodeControl,
};
pub use definition::{Builder, Scenario, ScenarioBuildError, ScenarioBuilder};
pub use expectation::Expectation;
pub use runtime::{
    BlockFeed, BlockFeedError, BlockFeedTask, BlockSnapshot, BlockSource, CleanupGuard,
    ClusterClient, Deployer, FailureReport, Metrics, MetricsError, NamedFailure, NodeClients,
    PrometheusEndpoint, PrometheusInstantSample, RunContext, RunHandle, RunMetrics, Runner,
    ScenarioError,
    metrics::{CONSENSUS_PROCESSED_BLOCKS, CONSENSUS_TRANSACTIONS_TOTAL},
    spawn_block_feed, spawn_block_feed_with_interval,
};
pub use workload::Workload;
