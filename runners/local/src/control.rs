use std::sync::Arc;

use async_trait::async_trait;
use testbed_core::{
    scenario::{ControlOperation, NodeControlError, NodeControlHandle},
    topology::NodeRole,
};
use tracing::info;

use crate::process::ProcessSupervisor;

const SIGSTOP: &str = "-STOP";
const SIGCONT: &str = "-CONT";

/// Drives restart/pause/resume against locally spawned node processes.
pub(crate) struct LocalNodeControl {
    supervisor: Arc<ProcessSupervisor>,
    validators: usize,
    executors: usize,
}

impl LocalNodeControl {
    pub(crate) const fn new(
        supervisor: Arc<ProcessSupervisor>,
        validators: usize,
        executors: usize,
    ) -> Self {
        Self {
            supervisor,
            validators,
            executors,
        }
    }

    fn flat_index(&self, role: NodeRole, index: usize) -> Result<usize, NodeControlError> {
        flat_index(self.validators, self.executors, role, index)
    }

    async fn signal(
        &self,
        operation: ControlOperation,
        signal: &str,
        role: NodeRole,
        index: usize,
    ) -> Result<(), NodeControlError> {
        let flat = self.flat_index(role, index)?;
        info!(%role, index, %operation, "signalling local node process");
        self.supervisor
            .signal_slot(flat, signal)
            .await
            .map_err(|err| NodeControlError::Failed {
                operation,
                role,
                index,
                reason: err.to_string(),
            })
    }
}

/// Maps a role-scoped node index onto the flat topology order used by the
/// process supervisor. Validators occupy the leading slots.
fn flat_index(
    validators: usize,
    executors: usize,
    role: NodeRole,
    index: usize,
) -> Result<usize, NodeControlError> {
    let (limit, offset) = match role {
        NodeRole::Validator => (validators, 0),
        NodeRole::Executor => (executors, validators),
    };
    if index >= limit {
        return Err(NodeControlError::UnknownNode { role, index });
    }
    Ok(offset + index)
}

#[async_trait]
impl NodeControlHandle for LocalNodeControl {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn restart(&self, role: NodeRole, index: usize) -> Result<(), NodeControlError> {
        let flat = self.flat_index(role, index)?;
        info!(%role, index, "restarting local node process");
        self.supervisor
            .restart_slot(flat)
            .await
            .map_err(|err| NodeControlError::Failed {
                operation: ControlOperation::Restart,
                role,
                index,
                reason: err.to_string(),
            })
    }

    async fn pause(&self, role: NodeRole, index: usize) -> Result<(), NodeControlError> {
        self.signal(ControlOperation::Pause, SIGSTOP, role, index)
            .await
    }

    async fn resume(&self, role: NodeRole, index: usize) -> Result<(), NodeControlError> {
        self.signal(ControlOperation::Resume, SIGCONT, role, index)
            .await
    }
}
