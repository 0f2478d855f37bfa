use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tempfile::TempDir;
use testbed_core::{
    adjust_timeout,
    scenario::{
        BlockFeed, BlockFeedError, BlockFeedTask, CleanupGuard, Deployer, Metrics, NodeClients,
        NodeControlHandle, RequiresNodeControl, RunContext, Runner, Scenario,
        http_probe::{self, HttpReadinessError},
        spawn_block_feed,
    },
    topology::{
        GeneratedNodeConfig, GeneratedTopology, NodeRole,
        readiness::{self, ReadinessError},
    },
};
use tracing::{error, info};

use crate::{
    control::LocalNodeControl,
    process::{ProcessSupervisor, ProvisionError, prepare_launches, spawn_all},
};

const HTTP_READY_TIMEOUT: Duration = Duration::from_secs(60);
const HTTP_POLL_INTERVAL: Duration = Duration::from_millis(250);
const NETWORK_READY_TIMEOUT: Duration = Duration::from_secs(60);
const MEMBERSHIP_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings for [`LocalDeployer`]. The node binary is the only mandatory
/// input; everything else about the stack is derived from the scenario
/// topology.
#[derive(Clone, Debug)]
pub struct LocalDeployerConfig {
    pub node_binary: PathBuf,
}

impl LocalDeployerConfig {
    #[must_use]
    pub fn new(node_binary: impl Into<PathBuf>) -> Self {
        Self {
            node_binary: node_binary.into(),
        }
    }
}

/// Runs every node as a host process under a temporary workspace, one
/// directory per node holding its config file and log captures.
pub struct LocalDeployer {
    config: LocalDeployerConfig,
    membership_check: bool,
}

impl LocalDeployer {
    #[must_use]
    pub const fn new(config: LocalDeployerConfig) -> Self {
        Self {
            config,
            membership_check: true,
        }
    }

    /// Skip the DA membership readiness probe after startup.
    #[must_use]
    pub const fn with_membership_check(mut self, enabled: bool) -> Self {
        self.membership_check = enabled;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LocalDeployerError {
    #[error(
        "local deployment requires at least one validator, got {validators} validators and {executors} executors"
    )]
    MissingValidator { validators: usize, executors: usize },
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Readiness(#[from] StackReadinessError),
    #[error("block feed requires at least one validator client")]
    BlockFeedUnavailable,
    #[error("failed to start block feed: {source}")]
    BlockFeed {
        #[source]
        source: BlockFeedError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StackReadinessError {
    #[error(transparent)]
    Http(#[from] HttpReadinessError),
    #[error("cluster readiness probe failed: {source}")]
    Cluster {
        #[source]
        source: ReadinessError,
    },
}

#[async_trait]
impl<Caps> Deployer<Caps> for LocalDeployer
where
    Caps: RequiresNodeControl + Send + Sync,
{
    type Error = LocalDeployerError;

    async fn deploy(&self, scenario: &Scenario<Caps>) -> Result<Runner, Self::Error> {
        let descriptors = scenario.topology().clone();
        ensure_supported_topology(&descriptors)?;

        info!(
            validators = descriptors.validators().len(),
            executors = descriptors.executors().len(),
            binary = %self.config.node_binary.display(),
            "starting local deployment"
        );

        let mut stack = provision_stack(&self.config.node_binary, &descriptors)?;

        info!("waiting for node HTTP endpoints");
        if let Err(err) = wait_for_http_endpoints(&descriptors).await {
            stack.fail("node HTTP readiness failed");
            return Err(err.into());
        }

        let node_clients = NodeClients::from_topology(&descriptors);

        info!("waiting for cluster readiness");
        if let Err(err) =
            wait_for_cluster_ready(&descriptors, &node_clients, self.membership_check).await
        {
            stack.fail("cluster readiness probe failed");
            return Err(err.into());
        }

        let (block_feed, block_feed_guard) = match start_block_feed(&node_clients).await {
            Ok(feed) => feed,
            Err(err) => {
                stack.fail("failed to initialize block feed");
                return Err(err);
            }
        };

        let node_control: Option<Arc<dyn NodeControlHandle>> = if Caps::REQUIRED {
            Some(Arc::new(LocalNodeControl::new(
                Arc::clone(stack.supervisor()),
                descriptors.validators().len(),
                descriptors.executors().len(),
            )))
        } else {
            None
        };

        info!(nodes = stack.supervisor().node_count(), "local stack ready");
        let context = RunContext::new(
            descriptors,
            node_clients,
            scenario.duration(),
            Metrics::empty(),
            block_feed,
            node_control,
        );
        Ok(Runner::new(
            context,
            Some(Box::new(stack.into_guard(block_feed_guard))),
        ))
    }
}

fn ensure_supported_topology(descriptors: &GeneratedTopology) -> Result<(), LocalDeployerError> {
    if descriptors.validators().is_empty() {
        return Err(LocalDeployerError::MissingValidator {
            validators: descriptors.validators().len(),
            executors: descriptors.executors().len(),
        });
    }
    Ok(())
}

fn provision_stack(
    binary: &Path,
    descriptors: &GeneratedTopology,
) -> Result<LocalStack, ProvisionError> {
    let workspace = tempfile::Builder::new()
        .prefix("testbed-local-")
        .tempdir()
        .map_err(|source| ProvisionError::Workspace { source })?;
    let launches = prepare_launches(descriptors, workspace.path())?;
    let slots = spawn_all(binary, launches)?;
    Ok(LocalStack {
        supervisor: Arc::new(ProcessSupervisor::new(binary.to_path_buf(), slots)),
        workspace: Some(workspace),
    })
}

async fn wait_for_http_endpoints(
    descriptors: &GeneratedTopology,
) -> Result<(), StackReadinessError> {
    let validator_ports: Vec<u16> = descriptors
        .validators()
        .iter()
        .map(GeneratedNodeConfig::api_port)
        .collect();
    http_probe::wait_for_http_ports(
        &validator_ports,
        NodeRole::Validator,
        adjust_timeout(HTTP_READY_TIMEOUT),
        HTTP_POLL_INTERVAL,
    )
    .await?;

    let executor_ports: Vec<u16> = descriptors
        .executors()
        .iter()
        .map(GeneratedNodeConfig::api_port)
        .collect();
    http_probe::wait_for_http_ports(
        &executor_ports,
        NodeRole::Executor,
        adjust_timeout(HTTP_READY_TIMEOUT),
        HTTP_POLL_INTERVAL,
    )
    .await?;
    Ok(())
}

async fn wait_for_cluster_ready(
    descriptors: &GeneratedTopology,
    clients: &NodeClients,
    membership_check: bool,
) -> Result<(), StackReadinessError> {
    readiness::wait_network_ready(descriptors, clients, NETWORK_READY_TIMEOUT)
        .await
        .map_err(|source| StackReadinessError::Cluster { source })?;
    if membership_check {
        readiness::wait_da_membership_ready(descriptors, clients, MEMBERSHIP_READY_TIMEOUT)
            .await
            .map_err(|source| StackReadinessError::Cluster { source })?;
    }
    Ok(())
}

async fn start_block_feed(
    node_clients: &NodeClients,
) -> Result<(BlockFeed, BlockFeedTask), LocalDeployerError> {
    let block_source_client = node_clients
        .random_validator()
        .cloned()
        .ok_or(LocalDeployerError::BlockFeedUnavailable)?;
    spawn_block_feed(block_source_client)
        .await
        .map_err(|source| LocalDeployerError::BlockFeed { source })
}

/// Everything created by provisioning, prior to being handed over to the
/// run as a cleanup guard.
struct LocalStack {
    supervisor: Arc<ProcessSupervisor>,
    workspace: Option<TempDir>,
}

impl LocalStack {
    const fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Tears the stack down after a failed deployment, dumping node log
    /// tails first.
    fn fail(&mut self, reason: &str) {
        error!(reason, "local deployment failed; dumping node logs");
        self.supervisor.dump_logs();
        self.supervisor.kill_all();
        drop(self.workspace.take());
    }

    fn into_guard(self, block_feed: BlockFeedTask) -> LocalCleanupGuard {
        LocalCleanupGuard {
            block_feed: Some(block_feed),
            supervisor: self.supervisor,
            workspace: self.workspace,
        }
    }
}

/// Stops the block feed before killing node processes so the feed never
/// observes a half-dead cluster.
struct LocalCleanupGuard {
    block_feed: Option<BlockFeedTask>,
    supervisor: Arc<ProcessSupervisor>,
    workspace: Option<TempDir>,
}

impl CleanupGuard for LocalCleanupGuard {
    fn cleanup(mut self: Box<Self>) {
        if let Some(block_feed) = self.block_feed.take() {
            CleanupGuard::cleanup(Box::new(block_feed));
        }
        self.supervisor.kill_all();
        drop(self.workspace.take());
    }
}

#[cfg(test)]
mod tests {
    use testbed_core::topology::{TopologyBuilder, TopologyConfig};

    use super::*;

    #[test]
    fn rejects_validatorless_topologies() {
        let descriptors = TopologyBuilder::new(TopologyConfig::with_node_numbers(0, 2))
            .build()
            .expect("topology builds");

        let err = ensure_supported_topology(&descriptors).expect_err("must be rejected");
        assert!(matches!(
            err,
            LocalDeployerError::MissingValidator {
                validators: 0,
                executors: 2,
            }
        ));
        assert!(err.to_string().contains("at least one validator"));
    }

    #[test]
    fn accepts_validator_only_topologies() {
        let descriptors = TopologyBuilder::new(TopologyConfig::two_validators())
            .build()
            .expect("topology builds");
        assert!(ensure_supported_topology(&descriptors).is_ok());
    }

    #[test]
    fn membership_check_toggle_is_preserved() {
        let deployer = LocalDeployer::new(LocalDeployerConfig::new("target/debug/testbed-node"))
            .with_membership_check(false);
        assert!(!deployer.membership_check);
    }
}
