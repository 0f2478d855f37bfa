use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use kube::Client;
use testbed_core::{
    nodes::ApiClient,
    scenario::{
        BlockFeed, BlockFeedError, BlockFeedTask, CleanupGuard, Deployer, Metrics, MetricsError,
        NodeClients, NodeControlHandle, RequiresNodeControl, RunContext, Runner, Scenario,
        spawn_block_feed,
    },
    topology::{
        GeneratedNodeConfig, GeneratedTopology,
        readiness::{self, ReadinessError},
    },
};
use tracing::{error, info};
use url::Url;
use uuid::Uuid;

use crate::{
    cleanup::RunnerCleanup,
    control::K8sNodeControl,
    helm::{self, HelmError},
    logs::dump_pod_logs,
    values::{ValuesError, prepare_values},
    wait::{self, ClusterPorts, ClusterWaitError},
};

const NETWORK_READY_TIMEOUT: Duration = Duration::from_secs(120);
const MEMBERSHIP_READY_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_NODE_IMAGE: &str = "testbed-node:local";
const DEFAULT_NODE_HOST: &str = "127.0.0.1";

/// Settings for [`K8sRunner`]: where the node chart lives, the image the
/// chart runs, the host node ports are reachable on, and whether the chart
/// deploys a Prometheus instance for telemetry queries.
#[derive(Clone, Debug)]
pub struct K8sRunnerConfig {
    pub chart_path: PathBuf,
    pub image: String,
    /// Host the service node ports are reachable on. Loopback works for
    /// kind and minikube with port forwarding; remote clusters need the
    /// address of a reachable worker node.
    pub node_host: String,
    pub prometheus: bool,
    /// Skip teardown so the namespace can be inspected after the run.
    pub preserve: bool,
}

impl K8sRunnerConfig {
    #[must_use]
    pub fn new(chart_path: impl Into<PathBuf>) -> Self {
        Self {
            chart_path: chart_path.into(),
            image: DEFAULT_NODE_IMAGE.to_owned(),
            node_host: DEFAULT_NODE_HOST.to_owned(),
            prometheus: false,
            preserve: false,
        }
    }
}

/// Deploys the cluster as a helm release into a freshly named namespace,
/// reaching nodes through the node ports their services expose.
pub struct K8sRunner {
    config: K8sRunnerConfig,
    readiness_checks: bool,
}

impl K8sRunner {
    #[must_use]
    pub const fn new(config: K8sRunnerConfig) -> Self {
        Self {
            config,
            readiness_checks: true,
        }
    }

    /// Skip the network and DA membership probes after the HTTP endpoints
    /// come up.
    #[must_use]
    pub const fn with_readiness(mut self, enabled: bool) -> Self {
        self.readiness_checks = enabled;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum K8sRunnerError {
    #[error(
        "k8s deployment requires at least one validator, got {validators} validators and {executors} executors"
    )]
    MissingValidator { validators: usize, executors: usize },
    #[error("failed to initialise kubernetes client: {source}")]
    ClientInit {
        #[source]
        source: kube::Error,
    },
    #[error(transparent)]
    Values(#[from] ValuesError),
    #[error(transparent)]
    Helm(#[from] HelmError),
    #[error(transparent)]
    Cluster(Box<ClusterWaitError>),
    #[error("failed to build node endpoint {endpoint}: {source}")]
    Endpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("cluster readiness probe failed: {source}")]
    Readiness {
        #[source]
        source: ReadinessError,
    },
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        #[source]
        source: MetricsError,
    },
    #[error("block feed requires at least one validator client")]
    BlockFeedUnavailable,
    #[error("failed to start block feed: {source}")]
    BlockFeed {
        #[source]
        source: BlockFeedError,
    },
}

impl From<ClusterWaitError> for K8sRunnerError {
    fn from(err: ClusterWaitError) -> Self {
        Self::Cluster(Box::new(err))
    }
}

#[async_trait]
impl<Caps> Deployer<Caps> for K8sRunner
where
    Caps: RequiresNodeControl + Send + Sync,
{
    type Error = K8sRunnerError;

    async fn deploy(&self, scenario: &Scenario<Caps>) -> Result<Runner, Self::Error> {
        let descriptors = scenario.topology().clone();
        ensure_supported_topology(&descriptors)?;

        let client = Client::try_default()
            .await
            .map_err(|source| K8sRunnerError::ClientInit { source })?;
        let (namespace, release) = cluster_identifiers();
        info!(
            %namespace,
            validators = descriptors.validators().len(),
            executors = descriptors.executors().len(),
            image = %self.config.image,
            "starting k8s deployment"
        );

        let values = prepare_values(
            &descriptors,
            &self.config.image,
            &release,
            self.config.prometheus,
        )?;
        let mut cluster = setup_cluster(
            &client,
            &self.config,
            &descriptors,
            &namespace,
            &release,
            values.values_file(),
        )
        .await?;

        let node_clients = match build_node_clients(&self.config.node_host, &cluster.ports) {
            Ok(node_clients) => node_clients,
            Err(err) => {
                cluster.fail("node endpoints rejected").await;
                return Err(err);
            }
        };

        if self.readiness_checks {
            info!("waiting for cluster readiness");
            if let Err(err) =
                readiness::wait_network_ready(&descriptors, &node_clients, NETWORK_READY_TIMEOUT)
                    .await
            {
                cluster.fail("network readiness probe failed").await;
                return Err(K8sRunnerError::Readiness { source: err });
            }
            if let Err(err) = readiness::wait_da_membership_ready(
                &descriptors,
                &node_clients,
                MEMBERSHIP_READY_TIMEOUT,
            )
            .await
            {
                cluster.fail("da membership probe failed").await;
                return Err(K8sRunnerError::Readiness { source: err });
            }
        }

        let telemetry = match cluster.ports.prometheus {
            Some(port) => {
                let endpoint = format!("http://{}:{port}/", self.config.node_host);
                match Metrics::from_prometheus_str(&endpoint) {
                    Ok(metrics) => metrics,
                    Err(err) => {
                        cluster.fail("telemetry endpoint rejected").await;
                        return Err(K8sRunnerError::Telemetry { source: err });
                    }
                }
            }
            None => Metrics::empty(),
        };

        let (block_feed, block_feed_task) = match start_block_feed(&node_clients).await {
            Ok(feed) => feed,
            Err(err) => {
                cluster.fail("failed to initialize block feed").await;
                return Err(err);
            }
        };

        let node_control: Option<Arc<dyn NodeControlHandle>> = if Caps::REQUIRED {
            Some(Arc::new(K8sNodeControl::new(
                cluster.client.clone(),
                cluster.namespace.clone(),
                cluster.release.clone(),
                descriptors.validators().len(),
                descriptors.executors().len(),
            )))
        } else {
            None
        };

        info!(namespace = %cluster.namespace, "k8s cluster ready");
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
            Some(Box::new(K8sCleanupGuard {
                environment: cluster.into_cleanup(),
                block_feed: Some(block_feed_task),
            })),
        ))
    }
}

fn ensure_supported_topology(descriptors: &GeneratedTopology) -> Result<(), K8sRunnerError> {
    if descriptors.validators().is_empty() {
        return Err(K8sRunnerError::MissingValidator {
            validators: descriptors.validators().len(),
            executors: descriptors.executors().len(),
        });
    }
    Ok(())
}

/// Namespace and release share one run id so everything a run creates is
/// identifiable from either side.
fn cluster_identifiers() -> (String, String) {
    let name = format!("testbed-k8s-{}", Uuid::new_v4().simple());
    (name.clone(), name)
}

async fn setup_cluster(
    client: &Client,
    config: &K8sRunnerConfig,
    descriptors: &GeneratedTopology,
    namespace: &str,
    release: &str,
    values_file: &Path,
) -> Result<ClusterEnvironment, K8sRunnerError> {
    if let Err(err) =
        helm::install_release(&config.chart_path, values_file, release, namespace).await
    {
        // A failed install can still have created the namespace.
        error!(error = %err, "helm install failed; dumping pod logs");
        cleanup_pending(client, namespace, release, config.preserve).await;
        return Err(err.into());
    }
    info!(release, "helm release installed");
    let cleanup = RunnerCleanup::new(
        client.clone(),
        namespace.to_owned(),
        release.to_owned(),
        config.preserve,
    );

    let validator_ports: Vec<u16> = descriptors
        .validators()
        .iter()
        .map(GeneratedNodeConfig::api_port)
        .collect();
    let executor_ports: Vec<u16> = descriptors
        .executors()
        .iter()
        .map(GeneratedNodeConfig::api_port)
        .collect();

    match wait::wait_for_cluster_ready(
        client,
        namespace,
        release,
        &validator_ports,
        &executor_ports,
        &config.node_host,
        config.prometheus,
    )
    .await
    {
        Ok(ports) => Ok(ClusterEnvironment {
            client: client.clone(),
            namespace: namespace.to_owned(),
            release: release.to_owned(),
            ports,
            cleanup: Some(cleanup),
        }),
        Err(err) => {
            error!(error = %err, "cluster never became ready; dumping pod logs");
            dump_pod_logs(client, namespace).await;
            CleanupGuard::cleanup(Box::new(cleanup));
            Err(err.into())
        }
    }
}

async fn cleanup_pending(client: &Client, namespace: &str, release: &str, preserve: bool) {
    dump_pod_logs(client, namespace).await;
    let cleanup = RunnerCleanup::new(
        client.clone(),
        namespace.to_owned(),
        release.to_owned(),
        preserve,
    );
    CleanupGuard::cleanup(Box::new(cleanup));
}

fn build_node_clients(node_host: &str, ports: &ClusterPorts) -> Result<NodeClients, K8sRunnerError> {
    let client_for = |port: u16| -> Result<ApiClient, K8sRunnerError> {
        let endpoint = format!("http://{node_host}:{port}/");
        let url = Url::parse(&endpoint)
            .map_err(|source| K8sRunnerError::Endpoint { endpoint, source })?;
        Ok(ApiClient::from_url(url))
    };
    let validators = ports
        .validators
        .iter()
        .copied()
        .map(client_for)
        .collect::<Result<Vec<_>, _>>()?;
    let executors = ports
        .executors
        .iter()
        .copied()
        .map(client_for)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(NodeClients::new(validators, executors))
}

async fn start_block_feed(
    node_clients: &NodeClients,
) -> Result<(BlockFeed, BlockFeedTask), K8sRunnerError> {
    let block_source_client = node_clients
        .random_validator()
        .cloned()
        .ok_or(K8sRunnerError::BlockFeedUnavailable)?;
    spawn_block_feed(block_source_client)
        .await
        .map_err(|source| K8sRunnerError::BlockFeed { source })
}

/// Cluster state between helm install and handoff to the [`Runner`]. A
/// failed later stage dumps pod logs and fires the cleanup guard before the
/// error surfaces.
struct ClusterEnvironment {
    client: Client,
    namespace: String,
    release: String,
    ports: ClusterPorts,
    cleanup: Option<RunnerCleanup>,
}

impl ClusterEnvironment {
    async fn fail(&mut self, reason: &str) {
        error!(
            reason,
            namespace = %self.namespace,
            "k8s deployment failed; dumping pod logs"
        );
        dump_pod_logs(&self.client, &self.namespace).await;
        if let Some(cleanup) = self.cleanup.take() {
            CleanupGuard::cleanup(Box::new(cleanup));
        }
    }

    fn into_cleanup(mut self) -> RunnerCleanup {
        self.cleanup
            .take()
            .expect("cleanup guard should be available")
    }
}

/// Stops the block feed before uninstalling the release.
struct K8sCleanupGuard {
    environment: RunnerCleanup,
    block_feed: Option<BlockFeedTask>,
}

impl CleanupGuard for K8sCleanupGuard {
    fn cleanup(mut self: Box<Self>) {
        if let Some(block_feed) = self.block_feed.take() {
            CleanupGuard::cleanup(Box::new(block_feed));
        }
        CleanupGuard::cleanup(Box::new(self.environment));
    }
}
