pub mod block_feed;
pub mod context;
mod deployer;
pub mod metrics;
mod node_clients;
mod runner;

pub use block_feed::{
    BlockFeed, BlockFeedError, BlockFeedTask, BlockSnapshot, BlockSource, spawn_block_feed,
    spawn_block_feed_with_interval,
};
pub use context::{CleanupGuard, RunContext, RunHandle, RunMetrics};
pub use deployer::{Deployer, FailureReport, NamedFailure, ScenarioError};
pub use metrics::{Metrics, MetricsError, PrometheusEndpoint, PrometheusInstantSample};
pub use node_clients::{ClusterClient, NodeClients};
pub use runner::Runner;
