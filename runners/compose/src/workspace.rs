use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use testbed_core::topology::{GeneratedNodeConfig, GeneratedTopology};

use crate::compose::CONFIG_DIR_NAME;

const COMPOSE_FILE: &str = "docker-compose.yml";
const PROMETHEUS_FILE: &str = "prometheus.yml";
const PROMETHEUS_SCRAPE_INTERVAL: &str = "5s";

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("failed to create compose workspace: {source}")]
    Create {
        #[source]
        source: io::Error,
    },
    #[error("failed to create config directory {path}: {source}")]
    ConfigDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialise node config for {label}: {source}")]
    ConfigSerialize {
        label: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Temporary directory holding the rendered compose file plus one config
/// file per node, mounted read-only into the node containers. Removing the
/// workspace removes every artifact of the deployment.
pub struct ComposeWorkspace {
    root: TempDir,
}

impl ComposeWorkspace {
    /// Creates the workspace and writes the per-node config files. Peers are
    /// addressed by compose service name, resolved by Docker's embedded DNS
    /// on the project network.
    pub fn create(descriptors: &GeneratedTopology) -> Result<Self, WorkspaceError> {
        let root = tempfile::Builder::new()
            .prefix("testbed-compose-")
            .tempdir()
            .map_err(|source| WorkspaceError::Create { source })?;

        let config_dir = root.path().join(CONFIG_DIR_NAME);
        fs::create_dir_all(&config_dir).map_err(|source| WorkspaceError::ConfigDir {
            path: config_dir.clone(),
            source,
        })?;

        for (flat, node) in descriptors.nodes().enumerate() {
            let config = descriptors
                .node_config_file(flat, |peer| service_host(descriptors, peer))
                .expect("flat index enumerates the generated topology");
            let rendered = serde_yaml::to_string(&config).map_err(|source| {
                WorkspaceError::ConfigSerialize {
                    label: node.label(),
                    source,
                }
            })?;
            let path = config_dir.join(format!("{}.yaml", node.label()));
            fs::write(&path, rendered).map_err(|source| WorkspaceError::Write {
                path: path.clone(),
                source,
            })?;
        }

        Ok(Self { root })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.root.path()
    }

    #[must_use]
    pub fn compose_path(&self) -> PathBuf {
        self.root.path().join(COMPOSE_FILE)
    }

    /// Writes a Prometheus scrape config covering every node API port.
    pub fn write_prometheus_config(
        &self,
        descriptors: &GeneratedTopology,
    ) -> Result<(), WorkspaceError> {
        let path = self.root.path().join(PROMETHEUS_FILE);
        fs::write(&path, render_prometheus_config(descriptors)).map_err(|source| {
            WorkspaceError::Write {
                path: path.clone(),
                source,
            }
        })
    }
}

fn service_host(descriptors: &GeneratedTopology, peer: usize) -> String {
    descriptors
        .node_at(peer)
        .map(GeneratedNodeConfig::label)
        .unwrap_or_default()
}

fn render_prometheus_config(descriptors: &GeneratedTopology) -> String {
    let targets = descriptors
        .nodes()
        .map(|node| format!("\"{}:{}\"", node.label(), node.api_port()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "global:\n  scrape_interval: {PROMETHEUS_SCRAPE_INTERVAL}\n\nscrape_configs:\n  - job_name: testbed-nodes\n    static_configs:\n      - targets: [{targets}]\n"
    )
}
