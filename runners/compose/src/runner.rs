use std::{
    io,
    net::{Ipv4Addr, TcpListener as StdTcpListener},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use testbed_core::{
    adjust_timeout,
    scenario::{
        BlockFeed, BlockFeedError, BlockFeedTask, CleanupGuard, Deployer, Metrics, MetricsError,
        NodeClients, NodeControlHandle, RequiresNodeControl, RunContext, Runner, Scenario,
        http_probe::HttpReadinessError,
        spawn_block_feed,
    },
    topology::{
        GeneratedNodeConfig, GeneratedTopology,
        readiness::{self, ReadinessError},
    },
};
use tokio::time::sleep;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    cleanup::RunnerCleanup,
    compose::{
        ComposeCommandError, ComposeDescriptor, DEFAULT_NODE_IMAGE, TemplateError, compose_up,
        dump_compose_logs, write_compose_file,
    },
    control::ComposeNodeControl,
    wait,
    workspace::{ComposeWorkspace, WorkspaceError},
};

const STARTUP_GRACE: Duration = Duration::from_secs(5);
const NETWORK_READY_TIMEOUT: Duration = Duration::from_secs(60);
const MEMBERSHIP_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings for [`ComposeRunner`]: the node image to run, an optional
/// platform pin for emulated hosts, and whether to deploy a Prometheus
/// sidecar for telemetry queries.
#[derive(Clone, Debug)]
pub struct ComposeRunnerConfig {
    pub image: String,
    pub platform: Option<String>,
    pub prometheus: bool,
}

impl Default for ComposeRunnerConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_NODE_IMAGE.to_owned(),
            platform: None,
            prometheus: false,
        }
    }
}

/// Deploys the cluster as a docker compose project under a random project
/// name, publishing node API ports on the host loopback.
pub struct ComposeRunner {
    config: ComposeRunnerConfig,
    readiness_checks: bool,
}

impl Default for ComposeRunner {
    fn default() -> Self {
        Self::new(ComposeRunnerConfig::default())
    }
}

impl ComposeRunner {
    #[must_use]
    pub const fn new(config: ComposeRunnerConfig) -> Self {
        Self {
            config,
            readiness_checks: true,
        }
    }

    /// Replace startup readiness probing with a fixed grace period.
    #[must_use]
    pub const fn with_readiness(mut self, enabled: bool) -> Self {
        self.readiness_checks = enabled;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComposeRunnerError {
    #[error(
        "compose deployment requires at least one validator, got {validators} validators and {executors} executors"
    )]
    MissingValidator { validators: usize, executors: usize },
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Command(#[from] ComposeCommandError),
    #[error("failed to allocate a host port for prometheus: {source}")]
    PrometheusPort {
        #[source]
        source: io::Error,
    },
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        #[source]
        source: MetricsError,
    },
    #[error(transparent)]
    Http(#[from] HttpReadinessError),
    #[error("cluster readiness probe failed: {source}")]
    Cluster {
        #[source]
        source: ReadinessError,
    },
    #[error("block feed requires at least one validator client")]
    BlockFeedUnavailable,
    #[error("failed to start block feed: {source}")]
    BlockFeed {
        #[source]
        source: BlockFeedError,
    },
}

#[async_trait]
impl<Caps> Deployer<Caps> for ComposeRunner
where
    Caps: RequiresNodeControl + Send + Sync,
{
    type Error = ComposeRunnerError;

    async fn deploy(&self, scenario: &Scenario<Caps>) -> Result<Runner, Self::Error> {
        let descriptors = scenario.topology().clone();
        ensure_supported_topology(&descriptors)?;

        let project_name = format!("testbed-compose-{}", Uuid::new_v4());
        info!(
            project = %project_name,
            validators = descriptors.validators().len(),
            executors = descriptors.executors().len(),
            image = %self.config.image,
            "starting compose deployment"
        );

        let workspace = ComposeWorkspace::create(&descriptors)?;

        let prometheus_port = if self.config.prometheus {
            let port = allocate_prometheus_port()?;
            workspace.write_prometheus_config(&descriptors)?;
            Some(port)
        } else {
            None
        };

        let compose_path = workspace.compose_path();
        render_compose_stack(&descriptors, &self.config, prometheus_port, &compose_path)?;

        let mut environment = StackEnvironment {
            compose_path,
            project_name,
            root: workspace.path().to_path_buf(),
            workspace: Some(workspace),
        };

        info!("bringing compose stack up");
        if let Err(err) = compose_up(
            &environment.compose_path,
            &environment.project_name,
            &environment.root,
        )
        .await
        {
            environment.fail("docker compose up failed").await;
            return Err(err.into());
        }

        let node_clients = NodeClients::from_topology(&descriptors);

        if self.readiness_checks {
            info!("waiting for node HTTP endpoints");
            let validator_ports: Vec<u16> = descriptors
                .validators()
                .iter()
                .map(GeneratedNodeConfig::api_port)
                .collect();
            if let Err(err) = wait::wait_for_validators(&validator_ports).await {
                environment.fail("validator HTTP readiness failed").await;
                return Err(err.into());
            }

            let executor_ports: Vec<u16> = descriptors
                .executors()
                .iter()
                .map(GeneratedNodeConfig::api_port)
                .collect();
            if let Err(err) = wait::wait_for_executors(&executor_ports).await {
                environment.fail("executor HTTP readiness failed").await;
                return Err(err.into());
            }

            info!("waiting for cluster readiness");
            if let Err(err) =
                readiness::wait_network_ready(&descriptors, &node_clients, NETWORK_READY_TIMEOUT)
                    .await
            {
                environment.fail("network readiness probe failed").await;
                return Err(ComposeRunnerError::Cluster { source: err });
            }
            if let Err(err) = readiness::wait_da_membership_ready(
                &descriptors,
                &node_clients,
                MEMBERSHIP_READY_TIMEOUT,
            )
            .await
            {
                environment.fail("da membership probe failed").await;
                return Err(ComposeRunnerError::Cluster { source: err });
            }
        } else {
            sleep(adjust_timeout(STARTUP_GRACE)).await;
        }

        let telemetry = match prometheus_port {
            Some(port) => {
                match Metrics::from_prometheus_str(&format!("http://127.0.0.1:{port}/")) {
                    Ok(metrics) => metrics,
                    Err(err) => {
                        environment.fail("telemetry endpoint rejected").await;
                        return Err(ComposeRunnerError::Telemetry { source: err });
                    }
                }
            }
            None => Metrics::empty(),
        };

        let (block_feed, block_feed_task) = match start_block_feed(&node_clients).await {
            Ok(feed) => feed,
            Err(err) => {
                environment.fail("failed to initialize block feed").await;
                return Err(err);
            }
        };

        let node_control: Option<Arc<dyn NodeControlHandle>> = if Caps::REQUIRED {
            Some(Arc::new(ComposeNodeControl::new(
                environment.compose_path.clone(),
                environment.project_name.clone(),
                environment.root.clone(),
                descriptors
                    .validators()
                    .iter()
                    .map(GeneratedNodeConfig::api_port)
                    .collect(),
                descriptors
                    .executors()
                    .iter()
                    .map(GeneratedNodeConfig::api_port)
                    .collect(),
            )))
        } else {
            None
        };

        info!(project = %environment.project_name, "compose stack ready");
        let context = RunContext::new(
            descriptors,
            node_clients,
            scenario.duration(),
            telemetry,
            block_feed,
            node_control,
        );
        Ok(Runner::new(
            context,
            Some(Box::new(ComposeCleanupGuard {
                environment: environment.into_cleanup(),
                block_feed: Some(block_feed_task),
            })),
        ))
    }
}

fn ensure_supported_topology(descriptors: &GeneratedTopology) -> Result<(), ComposeRunnerError> {
    if descriptors.validators().is_empty() {
        return Err(ComposeRunnerError::MissingValidator {
            validators: descriptors.validators().len(),
            executors: descriptors.executors().len(),
        });
    }
    Ok(())
}

fn render_compose_stack(
    descriptors: &GeneratedTopology,
    config: &ComposeRunnerConfig,
    prometheus_port: Option<u16>,
    compose_path: &Path,
) -> Result<(), TemplateError> {
    let mut builder = ComposeDescriptor::builder(descriptors)
        .with_image(config.image.clone())
        .with_platform(config.platform.clone());
    if let Some(port) = prometheus_port {
        builder = builder.with_prometheus_port(port);
    }
    write_compose_file(&builder.build(), compose_path)
}

fn allocate_prometheus_port() -> Result<u16, ComposeRunnerError> {
    let listener = StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(|source| ComposeRunnerError::PrometheusPort { source })?;
    let port = listener
        .local_addr()
        .map_err(|source| ComposeRunnerError::PrometheusPort { source })?
        .port();
    drop(listener);
    Ok(port)
}

async fn start_block_feed(
    node_clients: &NodeClients,
) -> Result<(BlockFeed, BlockFeedTask), ComposeRunnerError> {
    let block_source_client = node_clients
        .random_validator()
        .cloned()
        .ok_or(ComposeRunnerError::BlockFeedUnavailable)?;
    spawn_block_feed(block_source_client)
        .await
        .map_err(|source| ComposeRunnerError::BlockFeed { source })
}

/// Compose project state while readiness is still being established. A
/// failed stage dumps service logs and releases everything created so far.
struct StackEnvironment {
    compose_path: PathBuf,
    project_name: String,
    root: PathBuf,
    workspace: Option<ComposeWorkspace>,
}

impl StackEnvironment {
    async fn fail(&mut self, reason: &str) {
        error!(
            reason,
            project = %self.project_name,
            "compose deployment failed; dumping service logs"
        );
        dump_compose_logs(&self.compose_path, &self.project_name, &self.root).await;
        Box::new(self.take_cleanup()).cleanup();
    }

    fn take_cleanup(&mut self) -> RunnerCleanup {
        RunnerCleanup::new(
            self.compose_path.clone(),
            self.project_name.clone(),
            self.root.clone(),
            self.workspace.take(),
        )
    }

    fn into_cleanup(mut self) -> RunnerCleanup {
        self.take_cleanup()
    }
}

/// Stops the block feed before tearing the compose project down.
struct ComposeCleanupGuard {
    environment: RunnerCleanup,
    block_feed: Option<BlockFeedTask>,
}

impl CleanupGuard for ComposeCleanupGuard {
    fn cleanup(mut self: Box<Self>) {
        if let Some(block_feed) = self.block_feed.take() {
            CleanupGuard::cleanup(Box::new(block_feed));
        }
        CleanupGuard::cleanup(Box::new(self.environment));
    }
}

#[cfg(test)]
mod tests {
    use testbed_core::topology::{TopologyBuilder, TopologyConfig};

    use super::*;

    #[test]
    fn rejects_validatorless_topologies() {
        let descriptors = TopologyBuilder::new(TopologyConfig::with_node_numbers(0, 1))
            .build()
            .expect("topology builds");

        let err = ensure_supported_topology(&descriptors).expect_err("must be rejected");
        assert!(matches!(
            err,
            ComposeRunnerError::MissingValidator {
                validators: 0,
                executors: 1,
            }
        ));
    }

    #[test]
    fn default_config_uses_local_image_without_prometheus() {
        let config = ComposeRunnerConfig::default();
        assert_eq!(config.image, DEFAULT_NODE_IMAGE);
        assert!(config.platform.is_none());
        assert!(!config.prometheus);
    }

    #[test]
    fn readiness_toggle_is_preserved() {
        let runner = ComposeRunner::default().with_readiness(false);
        assert!(!runner.readiness_checks);
    }

    #[test]
    fn prometheus_port_allocation_yields_a_bindable_port() {
        let port = allocate_prometheus_port().expect("port allocates");
        assert_ne!(port, 0);
    }
}
