use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use testbed_core::{
    adjust_timeout,
    scenario::{ControlOperation, NodeControlError, NodeControlHandle, http_probe},
    topology::NodeRole,
};
use tokio::process::Command;
use tracing::info;

use crate::compose::run_compose_command;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const RESTART_READY_TIMEOUT: Duration = Duration::from_secs(30);
const RESTART_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Drives restart/pause/resume through `docker compose` against the
/// services of one project. Services are addressed by their topology label.
pub(crate) struct ComposeNodeControl {
    compose_path: PathBuf,
    project_name: String,
    root: PathBuf,
    validator_ports: Vec<u16>,
    executor_ports: Vec<u16>,
}

impl ComposeNodeControl {
    pub(crate) const fn new(
        compose_path: PathBuf,
        project_name: String,
        root: PathBuf,
        validator_ports: Vec<u16>,
        executor_ports: Vec<u16>,
    ) -> Self {
        Self {
            compose_path,
            project_name,
            root,
            validator_ports,
            executor_ports,
        }
    }

    fn api_port(&self, role: NodeRole, index: usize) -> Result<u16, NodeControlError> {
        let ports = match role {
            NodeRole::Validator => &self.validator_ports,
            NodeRole::Executor => &self.executor_ports,
        };
        ports
            .get(index)
            .copied()
            .ok_or(NodeControlError::UnknownNode { role, index })
    }

    async fn run_service_command(
        &self,
        operation: ControlOperation,
        subcommand: &str,
        role: NodeRole,
        index: usize,
    ) -> Result<(), NodeControlError> {
        let service = format!("{role}-{index}");
        info!(%operation, service = %service, "running docker compose service command");

        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .arg("-f")
            .arg(&self.compose_path)
            .arg("-p")
            .arg(&self.project_name)
            .arg(subcommand)
            .arg(&service)
            .current_dir(&self.root);

        run_compose_command(
            cmd,
            adjust_timeout(COMMAND_TIMEOUT),
            &format!("docker compose {subcommand} {service}"),
        )
        .await
        .map_err(|err| NodeControlError::Failed {
            operation,
            role,
            index,
            reason: err.to_string(),
        })
    }
}

#[async_trait]
impl NodeControlHandle for ComposeNodeControl {
    fn backend(&self) -> &'static str {
        "compose"
    }

    async fn restart(&self, role: NodeRole, index: usize) -> Result<(), NodeControlError> {
        let port = self.api_port(role, index)?;
        self.run_service_command(ControlOperation::Restart, "restart", role, index)
            .await?;
        http_probe::wait_for_http_ports(
            &[port],
            role,
            adjust_timeout(RESTART_READY_TIMEOUT),
            RESTART_POLL_INTERVAL,
        )
        .await
        .map_err(|err| NodeControlError::Failed {
            operation: ControlOperation::Restart,
            role,
            index,
            reason: err.to_string(),
        })
    }

    async fn pause(&self, role: NodeRole, index: usize) -> Result<(), NodeControlError> {
        self.api_port(role, index)?;
        self.run_service_command(ControlOperation::Pause, "pause", role, index)
            .await
    }

    async fn resume(&self, role: NodeRole, index: usize) -> Result<(), NodeControlError> {
        self.api_port(role, index)?;
        self.run_service_command(ControlOperation::Resume, "unpause", role, index)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_control() -> ComposeNodeControl {
        ComposeNodeControl::new(
            PathBuf::from("docker-compose.yml"),
            "testbed-compose-test".to_owned(),
            PathBuf::from("."),
            vec![18080],
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn unknown_nodes_are_rejected_before_any_command_runs() {
        let control = sample_control();

        let err = control
            .restart(NodeRole::Executor, 0)
            .await
            .expect_err("executor 0 does not exist");
        assert!(matches!(
            err,
            NodeControlError::UnknownNode {
                role: NodeRole::Executor,
                index: 0,
            }
        ));

        let err = control
            .pause(NodeRole::Validator, 5)
            .await
            .expect_err("validator 5 does not exist");
        assert!(matches!(
            err,
            NodeControlError::UnknownNode {
                role: NodeRole::Validator,
                index: 5,
            }
        ));
    }

    #[test]
    fn api_ports_follow_role_indices() {
        let control = sample_control();
        assert_eq!(control.api_port(NodeRole::Validator, 0).unwrap(), 18080);
        assert!(control.api_port(NodeRole::Validator, 1).is_err());
    }
}
