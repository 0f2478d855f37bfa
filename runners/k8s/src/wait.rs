use std::time::Duration;

use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use kube::{Api, Client};
use testbed_core::{
    adjust_timeout,
    scenario::http_probe::{self, HttpReadinessError},
    topology::NodeRole,
};
use tokio::time::sleep;
use tracing::info;

pub(crate) const DEPLOYMENT_READY_TIMEOUT: Duration = Duration::from_secs(180);
const DEPLOYMENT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const NODE_PORT_ATTEMPTS: u32 = 120;
const NODE_PORT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const NODE_HTTP_TIMEOUT: Duration = Duration::from_secs(240);
const NODE_HTTP_POLL_INTERVAL: Duration = Duration::from_secs(1);
const PROMETHEUS_SERVICE: &str = "prometheus";
const PROMETHEUS_PORT: u16 = 9090;
const PROMETHEUS_READY_ATTEMPTS: u32 = 240;
const PROMETHEUS_READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ClusterWaitError {
    #[error("failed to query {resource} {name}: {source}")]
    Api {
        resource: &'static str,
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("deployment {name} did not become ready within {timeout:?}")]
    DeploymentTimeout { name: String, timeout: Duration },
    #[error("service {name} did not expose a node port for port {port}")]
    NodePortMissing { name: String, port: u16 },
    #[error("timeout waiting for {role} HTTP endpoints: {source}")]
    NodeHttp {
        role: NodeRole,
        #[source]
        source: HttpReadinessError,
    },
    #[error("prometheus at {url} did not become ready")]
    PrometheusTimeout { url: String },
}

/// Host-side ports the cluster exposes once every chart resource is up.
pub(crate) struct ClusterPorts {
    pub validators: Vec<u16>,
    pub executors: Vec<u16>,
    pub prometheus: Option<u16>,
}

/// Waits for every node deployment to report ready, resolves the node port
/// assigned to each service and probes the node HTTP endpoints through them.
pub(crate) async fn wait_for_cluster_ready(
    client: &Client,
    namespace: &str,
    release: &str,
    validator_ports: &[u16],
    executor_ports: &[u16],
    node_host: &str,
    expect_prometheus: bool,
) -> Result<ClusterPorts, ClusterWaitError> {
    let validators = wait_for_role(
        client,
        namespace,
        release,
        NodeRole::Validator,
        validator_ports,
        node_host,
    )
    .await?;
    let executors = wait_for_role(
        client,
        namespace,
        release,
        NodeRole::Executor,
        executor_ports,
        node_host,
    )
    .await?;
    let prometheus = if expect_prometheus {
        Some(wait_for_prometheus(client, namespace, node_host).await?)
    } else {
        None
    };

    Ok(ClusterPorts {
        validators,
        executors,
        prometheus,
    })
}

pub(crate) fn deployment_name(release: &str, role: NodeRole, index: usize) -> String {
    format!("{release}-{role}-{index}")
}

async fn wait_for_role(
    client: &Client,
    namespace: &str,
    release: &str,
    role: NodeRole,
    service_ports: &[u16],
    node_host: &str,
) -> Result<Vec<u16>, ClusterWaitError> {
    let mut node_ports = Vec::with_capacity(service_ports.len());
    for (index, service_port) in service_ports.iter().enumerate() {
        let name = deployment_name(release, role, index);
        wait_for_deployment_ready(client, namespace, &name, DEPLOYMENT_READY_TIMEOUT).await?;
        node_ports.push(find_node_port(client, namespace, &name, *service_port).await?);
    }

    if !node_ports.is_empty() {
        info!(role = %role, ports = ?node_ports, "waiting for node HTTP endpoints");
        http_probe::wait_for_http_ports_with_host(
            &node_ports,
            role,
            node_host,
            adjust_timeout(NODE_HTTP_TIMEOUT),
            NODE_HTTP_POLL_INTERVAL,
        )
        .await
        .map_err(|source| ClusterWaitError::NodeHttp { role, source })?;
    }

    Ok(node_ports)
}

pub(crate) async fn wait_for_deployment_ready(
    client: &Client,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<(), ClusterWaitError> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let timeout = adjust_timeout(timeout);
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        let deployment =
            deployments
                .get(name)
                .await
                .map_err(|source| ClusterWaitError::Api {
                    resource: "deployment",
                    name: name.to_owned(),
                    source,
                })?;
        let desired = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(1);
        let ready = deployment
            .status
            .as_ref()
            .and_then(|status| status.ready_replicas)
            .unwrap_or(0);
        if ready >= desired {
            return Ok(());
        }
        sleep(DEPLOYMENT_POLL_INTERVAL).await;
    }

    Err(ClusterWaitError::DeploymentTimeout {
        name: name.to_owned(),
        timeout,
    })
}

/// Polls the service until the cloud provider assigns a node port for
/// `service_port`. Freshly created NodePort services can take a few seconds
/// to show the allocation in their spec.
async fn find_node_port(
    client: &Client,
    namespace: &str,
    service: &str,
    service_port: u16,
) -> Result<u16, ClusterWaitError> {
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    for _ in 0..NODE_PORT_ATTEMPTS {
        let found = services
            .get(service)
            .await
            .map_err(|source| ClusterWaitError::Api {
                resource: "service",
                name: service.to_owned(),
                source,
            })?;
        if let Some(spec) = found.spec {
            if let Some(ports) = spec.ports {
                for port in ports {
                    if port.port == i32::from(service_port) {
                        if let Some(node_port) = port.node_port {
                            if let Ok(node_port) = u16::try_from(node_port) {
                                return Ok(node_port);
                            }
                        }
                    }
                }
            }
        }
        sleep(NODE_PORT_POLL_INTERVAL).await;
    }

    Err(ClusterWaitError::NodePortMissing {
        name: service.to_owned(),
        port: service_port,
    })
}

async fn wait_for_prometheus(
    client: &Client,
    namespace: &str,
    node_host: &str,
) -> Result<u16, ClusterWaitError> {
    let node_port = find_node_port(client, namespace, PROMETHEUS_SERVICE, PROMETHEUS_PORT).await?;
    let url = format!("http://{node_host}:{node_port}/-/ready");
    let http = reqwest::Client::new();
    for _ in 0..PROMETHEUS_READY_ATTEMPTS {
        if let Ok(response) = http.get(&url).send().await {
            if response.status().is_success() {
                info!(%url, "prometheus is ready");
                return Ok(node_port);
            }
        }
        sleep(PROMETHEUS_READY_POLL_INTERVAL).await;
    }

    Err(ClusterWaitError::PrometheusTimeout { url })
}
