use std::{
    fs, io,
    path::{Path, PathBuf},
    process,
    time::Duration,
};

use serde::Serialize;
use tera::Context as TeraContext;
use testbed_core::{
    adjust_timeout,
    topology::{GeneratedNodeConfig, GeneratedTopology},
};
use tokio::{process::Command, time::timeout};

const COMPOSE_UP_TIMEOUT: Duration = Duration::from_secs(120);
const COMPOSE_TEMPLATE: &str = include_str!("../assets/docker-compose.yml.tera");

pub(crate) const DEFAULT_NODE_IMAGE: &str = "testbed-node:local";
pub(crate) const NODE_BINARY: &str = "testbed-node";
pub(crate) const CONFIG_DIR_NAME: &str = "configs";
const CONFIG_MOUNT_DIR: &str = "/etc/testbed";

#[derive(Debug, thiserror::Error)]
pub enum ComposeCommandError {
    #[error("{command} exited with status {status}")]
    Failed {
        command: String,
        status: process::ExitStatus,
    },
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

pub async fn compose_up(
    compose_path: &Path,
    project_name: &str,
    root: &Path,
) -> Result<(), ComposeCommandError> {
    let mut cmd = Command::new("docker");
    cmd.arg("compose")
        .arg("-f")
        .arg(compose_path)
        .arg("-p")
        .arg(project_name)
        .arg("up")
        .arg("-d")
        .current_dir(root);

    run_compose_command(cmd, adjust_timeout(COMPOSE_UP_TIMEOUT), "docker compose up").await
}

pub fn compose_down(
    compose_path: &Path,
    project_name: &str,
    root: &Path,
) -> Result<(), ComposeCommandError> {
    let description = "docker compose down".to_owned();
    let status = process::Command::new("docker")
        .arg("compose")
        .arg("-f")
        .arg(compose_path)
        .arg("-p")
        .arg(project_name)
        .arg("down")
        .arg("--volumes")
        .current_dir(root)
        .status()
        .map_err(|source| ComposeCommandError::Spawn {
            command: description.clone(),
            source,
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(ComposeCommandError::Failed {
            command: description,
            status,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to serialise compose descriptor for templating: {source}")]
    Serialize {
        #[source]
        source: tera::Error,
    },
    #[error("failed to render compose template: {source}")]
    Render {
        #[source]
        source: tera::Error,
    },
    #[error("failed to write compose file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Service graph rendered into the docker compose file: one service per node
/// plus an optional Prometheus scraper.
#[derive(Clone, Debug, Serialize)]
pub struct ComposeDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    prometheus: Option<PrometheusTemplate>,
    validators: Vec<NodeDescriptor>,
    executors: Vec<NodeDescriptor>,
}

impl ComposeDescriptor {
    #[must_use]
    pub const fn builder(topology: &GeneratedTopology) -> ComposeDescriptorBuilder<'_> {
        ComposeDescriptorBuilder::new(topology)
    }

    #[cfg(test)]
    fn validators(&self) -> &[NodeDescriptor] {
        &self.validators
    }

    #[cfg(test)]
    fn executors(&self) -> &[NodeDescriptor] {
        &self.executors
    }
}

pub struct ComposeDescriptorBuilder<'a> {
    topology: &'a GeneratedTopology,
    image: Option<String>,
    platform: Option<String>,
    prometheus_port: Option<u16>,
}

impl<'a> ComposeDescriptorBuilder<'a> {
    const fn new(topology: &'a GeneratedTopology) -> Self {
        Self {
            topology,
            image: None,
            platform: None,
            prometheus_port: None,
        }
    }

    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    #[must_use]
    pub fn with_platform(mut self, platform: Option<String>) -> Self {
        self.platform = platform;
        self
    }

    #[must_use]
    pub const fn with_prometheus_port(mut self, port: u16) -> Self {
        self.prometheus_port = Some(port);
        self
    }

    #[must_use]
    pub fn build(self) -> ComposeDescriptor {
        let image = self
            .image
            .unwrap_or_else(|| DEFAULT_NODE_IMAGE.to_owned());

        let validators = build_nodes(
            self.topology.validators(),
            &image,
            self.platform.as_deref(),
        );
        let executors = build_nodes(self.topology.executors(), &image, self.platform.as_deref());

        ComposeDescriptor {
            prometheus: self.prometheus_port.map(PrometheusTemplate::new),
            validators,
            executors,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PrometheusTemplate {
    host_port: String,
}

impl PrometheusTemplate {
    fn new(port: u16) -> Self {
        Self {
            host_port: format!("127.0.0.1:{port}:9090"),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct EnvEntry {
    key: String,
    value: String,
}

impl EnvEntry {
    fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    #[cfg(test)]
    fn key(&self) -> &str {
        &self.key
    }

    #[cfg(test)]
    fn value(&self) -> &str {
        &self.value
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeDescriptor {
    name: String,
    image: String,
    command: String,
    volumes: Vec<String>,
    ports: Vec<String>,
    environment: Vec<EnvEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    platform: Option<String>,
}

impl NodeDescriptor {
    fn from_node(node: &GeneratedNodeConfig, image: &str, platform: Option<&str>) -> Self {
        let name = node.label();
        Self {
            command: format!("{NODE_BINARY} {CONFIG_MOUNT_DIR}/{name}.yaml"),
            name,
            image: image.to_owned(),
            volumes: vec![format!("./{CONFIG_DIR_NAME}:{CONFIG_MOUNT_DIR}:ro")],
            ports: vec![loopback_mapping(node.api_port())],
            environment: base_environment(),
            platform: platform.map(ToOwned::to_owned),
        }
    }

    #[cfg(test)]
    fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    fn ports(&self) -> &[String] {
        &self.ports
    }

    #[cfg(test)]
    fn environment(&self) -> &[EnvEntry] {
        &self.environment
    }
}

fn build_nodes(
    nodes: &[GeneratedNodeConfig],
    image: &str,
    platform: Option<&str>,
) -> Vec<NodeDescriptor> {
    nodes
        .iter()
        .map(|node| NodeDescriptor::from_node(node, image, platform))
        .collect()
}

fn base_environment() -> Vec<EnvEntry> {
    vec![EnvEntry::new("RUST_LOG", "info")]
}

/// Publishes a container port on the host loopback under the same number so
/// host-side clients can reuse the generated topology ports directly.
fn loopback_mapping(port: u16) -> String {
    format!("127.0.0.1:{port}:{port}")
}

pub(crate) fn render_compose_file(descriptor: &ComposeDescriptor) -> Result<String, TemplateError> {
    let context = TeraContext::from_serialize(descriptor)
        .map_err(|source| TemplateError::Serialize { source })?;
    tera::Tera::one_off(COMPOSE_TEMPLATE, &context, false)
        .map_err(|source| TemplateError::Render { source })
}

pub fn write_compose_file(
    descriptor: &ComposeDescriptor,
    compose_path: &Path,
) -> Result<(), TemplateError> {
    let rendered = render_compose_file(descriptor)?;
    fs::write(compose_path, rendered).map_err(|source| TemplateError::Write {
        path: compose_path.to_path_buf(),
        source,
    })
}

pub async fn dump_compose_logs(compose_file: &Path, project: &str, root: &Path) {
    let mut cmd = Command::new("docker");
    cmd.arg("compose")
        .arg("-f")
        .arg(compose_file)
        .arg("-p")
        .arg(project)
        .arg("logs")
        .arg("--no-color")
        .current_dir(root);

    match cmd.output().await {
        Ok(output) => {
            if !output.stdout.is_empty() {
                eprintln!(
                    "[compose-runner] docker compose logs:\n{}",
                    String::from_utf8_lossy(&output.stdout)
                );
            }
            if !output.stderr.is_empty() {
                eprintln!(
                    "[compose-runner] docker compose errors:\n{}",
                    String::from_utf8_lossy(&output.stderr)
                );
            }
        }
        Err(err) => {
            eprintln!("[compose-runner] failed to collect docker compose logs: {err}");
        }
    }
}

pub(crate) async fn run_compose_command(
    mut command: Command,
    timeout_duration: Duration,
    description: &str,
) -> Result<(), ComposeCommandError> {
    match timeout(timeout_duration, command.status()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(ComposeCommandError::Failed {
            command: description.to_owned(),
            status,
        }),
        Ok(Err(err)) => Err(ComposeCommandError::Spawn {
            command: description.to_owned(),
            source: err,
        }),
        Err(_) => Err(ComposeCommandError::Timeout {
            command: description.to_owned(),
            timeout: timeout_duration,
        }),
    }
}
