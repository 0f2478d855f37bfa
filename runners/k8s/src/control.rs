use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, Client,
    api::{DeleteParams, ListParams},
};
use testbed_core::{
    scenario::{ControlOperation, NodeControlError, NodeControlHandle},
    topology::NodeRole,
};
use tokio::time::sleep;
use tracing::info;

use crate::wait;

const RESTART_GRACE: Duration = Duration::from_secs(2);

/// Restarts nodes by deleting their pods and letting the deployment
/// controller reschedule them. Pause and resume stay unsupported: freezing a
/// container inside a remote pod has no kubectl-level equivalent.
pub(crate) struct K8sNodeControl {
    client: Client,
    namespace: String,
    release: String,
    validators: usize,
    executors: usize,
}

impl K8sNodeControl {
    pub(crate) const fn new(
        client: Client,
        namespace: String,
        release: String,
        validators: usize,
        executors: usize,
    ) -> Self {
        Self {
            client,
            namespace,
            release,
            validators,
            executors,
        }
    }
}

fn ensure_known(
    validators: usize,
    executors: usize,
    role: NodeRole,
    index: usize,
) -> Result<(), NodeControlError> {
    let count = match role {
        NodeRole::Validator => validators,
        NodeRole::Executor => executors,
    };
    if index >= count {
        return Err(NodeControlError::UnknownNode { role, index });
    }
    Ok(())
}

fn pod_selector(deployment: &str) -> String {
    format!("app={deployment}")
}

#[async_trait]
impl NodeControlHandle for K8sNodeControl {
    fn backend(&self) -> &'static str {
        "k8s"
    }

    async fn restart(&self, role: NodeRole, index: usize) -> Result<(), NodeControlError> {
        ensure_known(self.validators, self.executors, role, index)?;
        let failed = |reason: String| NodeControlError::Failed {
            operation: ControlOperation::Restart,
            role,
            index,
            reason,
        };

        let name = wait::deployment_name(&self.release, role, index);
        info!(deployment = %name, "restarting node by deleting its pods");
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let selector = pod_selector(&name);
        pods.delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels(&selector),
        )
        .await
        .map_err(|err| failed(err.to_string()))?;

        // Give the deployment controller a moment to observe the deleted
        // pods before trusting its ready count again.
        sleep(RESTART_GRACE).await;
        wait::wait_for_deployment_ready(
            &self.client,
            &self.namespace,
            &name,
            wait::DEPLOYMENT_READY_TIMEOUT,
        )
        .await
        .map_err(|err| failed(err.to_string()))
    }
}
