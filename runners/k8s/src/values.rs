use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::Serialize;
use tempfile::TempDir;
use testbed_core::topology::{GeneratedTopology, configs::NodeConfigFile};

const VALUES_FILE: &str = "values.yaml";
const WORKSPACE_PREFIX: &str = "testbed-k8s-";

#[derive(Debug, thiserror::Error)]
pub enum ValuesError {
    #[error("failed to create helm values workspace: {source}")]
    Workspace {
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize helm values: {source}")]
    Serialize {
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to write helm values at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Values document rendered for the node chart.
///
/// The chart instantiates one deployment and one service per entry in
/// `nodes`, names them `{release}-{name}` and mounts the embedded node
/// config. Peer addresses inside each config already point at the service
/// names of the release, so the chart itself stays topology-agnostic.
#[derive(Debug, Serialize)]
pub struct HelmValues {
    image: String,
    prometheus: PrometheusValues,
    nodes: Vec<NodeValues>,
}

#[derive(Debug, Serialize)]
struct PrometheusValues {
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct NodeValues {
    name: String,
    role: String,
    api_port: u16,
    network_port: u16,
    config: NodeConfigFile,
}

impl HelmValues {
    pub fn from_topology(
        descriptors: &GeneratedTopology,
        image: &str,
        release: &str,
        prometheus: bool,
    ) -> Self {
        let service_names: Vec<String> = descriptors
            .nodes()
            .map(|node| format!("{release}-{}", node.label()))
            .collect();
        let nodes = descriptors
            .nodes()
            .enumerate()
            .map(|(flat, node)| {
                let config = descriptors
                    .node_config_file(flat, |peer| {
                        service_names.get(peer).cloned().unwrap_or_default()
                    })
                    .expect("flat index enumerates the generated topology");
                NodeValues {
                    name: node.label(),
                    role: node.role().label().to_owned(),
                    api_port: node.api_port(),
                    network_port: node.network_port(),
                    config,
                }
            })
            .collect();

        Self {
            image: image.to_owned(),
            prometheus: PrometheusValues {
                enabled: prometheus,
            },
            nodes,
        }
    }

    pub fn to_yaml(&self) -> Result<String, ValuesError> {
        serde_yaml::to_string(self).map_err(|source| ValuesError::Serialize { source })
    }

    #[cfg(test)]
    pub(crate) fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.name.as_str()).collect()
    }

    #[cfg(test)]
    pub(crate) fn node_peers(&self, index: usize) -> &[String] {
        &self.nodes[index].config.initial_peers
    }
}

/// Rendered values file kept alive for the duration of `helm install`.
pub struct RunnerValues {
    values_file: PathBuf,
    _workspace: TempDir,
}

impl RunnerValues {
    pub fn values_file(&self) -> &Path {
        &self.values_file
    }
}

pub fn prepare_values(
    descriptors: &GeneratedTopology,
    image: &str,
    release: &str,
    prometheus: bool,
) -> Result<RunnerValues, ValuesError> {
    let workspace = tempfile::Builder::new()
        .prefix(WORKSPACE_PREFIX)
        .tempdir()
        .map_err(|source| ValuesError::Workspace { source })?;
    let values = HelmValues::from_topology(descriptors, image, release, prometheus);
    let rendered = values.to_yaml()?;
    let path = workspace.path().join(VALUES_FILE);
    fs::write(&path, rendered).map_err(|source| ValuesError::Write {
        path: path.clone(),
        source,
    })?;

    Ok(RunnerValues {
        values_file: path,
        _workspace: workspace,
    })
}

#[cfg(test)]
mod tests {
    use testbed_core::topology::{TopologyBuilder, TopologyConfig};

    use super::*;

    fn topology(validators: usize, executors: usize) -> GeneratedTopology {
        TopologyBuilder::new(TopologyConfig::with_node_numbers(validators, executors))
            .build()
            .unwrap()
    }

    #[test]
    fn values_enumerate_every_node() {
        let descriptors = topology(2, 1);
        let values = HelmValues::from_topology(&descriptors, "testbed-node:local", "rel", false);

        assert_eq!(
            values.node_names(),
            vec!["validator-0", "validator-1", "executor-0"]
        );
    }

    #[test]
    fn peer_addresses_use_release_scoped_service_names() {
        let descriptors = topology(2, 0);
        let values =
            HelmValues::from_topology(&descriptors, "testbed-node:local", "testbed-k8s-abc", false);

        let network_port = descriptors.validators()[0].network_port();
        assert_eq!(
            values.node_peers(1),
            &[format!("testbed-k8s-abc-validator-0:{network_port}")]
        );
    }

    #[test]
    fn rendered_values_are_valid_yaml() {
        let descriptors = topology(1, 1);
        let values = HelmValues::from_topology(&descriptors, "testbed-node:v1", "rel", true);

        let rendered = values.to_yaml().unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed["image"].as_str(), Some("testbed-node:v1"));
        assert_eq!(parsed["prometheus"]["enabled"].as_bool(), Some(true));
        assert_eq!(parsed["nodes"].as_sequence().map(Vec::len), Some(2));
        assert!(parsed["nodes"][0]["config"]["consensus"]["slot_duration_ms"].is_u64());
    }

    #[test]
    fn prepare_values_writes_the_values_file() {
        let descriptors = topology(1, 0);
        let rendered = prepare_values(&descriptors, "testbed-node:local", "rel", false).unwrap();

        let contents = fs::read_to_string(rendered.values_file()).unwrap();
        assert!(contents.contains("validator-0"));
    }
}
