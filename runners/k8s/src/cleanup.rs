use std::{thread, time::Duration};

use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client, api::DeleteParams};
use testbed_core::scenario::CleanupGuard;
use tokio::{
    runtime::{Handle, Runtime},
    time::{sleep, timeout},
};
use tracing::warn;

use crate::helm;

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(120);
const API_DELETE_TIMEOUT: Duration = Duration::from_secs(10);
const TERMINATION_ATTEMPTS: u32 = 60;
const TERMINATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Uninstalls the helm release and deletes its namespace.
///
/// `cleanup` has to work from both sync and async callers: scenario runs end
/// with an explicit guard drop on a runtime thread, while panics can unwind
/// through a plain drop with no runtime at all. The guard therefore runs the
/// teardown on the current thread when possible and otherwise hands it to a
/// dedicated thread with its own runtime.
pub(crate) struct RunnerCleanup {
    client: Client,
    namespace: String,
    release: String,
    preserve: bool,
}

impl RunnerCleanup {
    pub(crate) const fn new(
        client: Client,
        namespace: String,
        release: String,
        preserve: bool,
    ) -> Self {
        Self {
            client,
            namespace,
            release,
            preserve,
        }
    }

    fn blocking_cleanup_success(&self) -> bool {
        match Runtime::new() {
            Ok(runtime) => {
                let finished = runtime.block_on(timeout(CLEANUP_TIMEOUT, self.cleanup_async()));
                if finished.is_err() {
                    warn!(
                        namespace = %self.namespace,
                        "k8s cleanup timed out after {CLEANUP_TIMEOUT:?}"
                    );
                }
                finished.is_ok()
            }
            Err(err) => {
                warn!(error = %err, "failed to build runtime for k8s cleanup");
                false
            }
        }
    }

    fn spawn_cleanup_thread(self) {
        let handle = thread::Builder::new()
            .name("k8s-runner-cleanup".into())
            .spawn(move || {
                if !self.blocking_cleanup_success() {
                    warn!("k8s cleanup thread did not finish cleanly");
                }
            });
        match handle {
            Ok(handle) => {
                if handle.join().is_err() {
                    warn!("k8s cleanup thread panicked");
                }
            }
            Err(err) => warn!(error = %err, "failed to spawn k8s cleanup thread"),
        }
    }

    async fn cleanup_async(&self) {
        println!(
            "[k8s-runner] tearing down release {} in namespace {}",
            self.release, self.namespace
        );
        if let Err(err) = helm::uninstall_release(&self.release, &self.namespace).await {
            warn!(release = %self.release, error = %err, "helm uninstall failed");
        }
        delete_namespace(&self.client, &self.namespace).await;
    }
}

impl CleanupGuard for RunnerCleanup {
    fn cleanup(self: Box<Self>) {
        if self.preserve {
            println!("[k8s-runner] preserving namespace {}", self.namespace);
            return;
        }
        if Handle::try_current().is_err() && self.blocking_cleanup_success() {
            return;
        }
        self.spawn_cleanup_thread();
    }
}

async fn delete_namespace(client: &Client, namespace: &str) {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let deleted = timeout(
        API_DELETE_TIMEOUT,
        namespaces.delete(namespace, &DeleteParams::default()),
    )
    .await;
    match deleted {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            warn!(namespace, error = %err, "api namespace delete failed; falling back to kubectl");
            kubectl_delete_namespace(namespace).await;
        }
        Err(_) => {
            warn!(namespace, "api namespace delete timed out; falling back to kubectl");
            kubectl_delete_namespace(namespace).await;
        }
    }
    wait_for_namespace_termination(&namespaces, namespace).await;
}

async fn kubectl_delete_namespace(namespace: &str) {
    let output = tokio::process::Command::new("kubectl")
        .args(["delete", "namespace", namespace, "--wait=true"])
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(namespace, %stderr, "kubectl namespace delete failed");
        }
        Err(err) => warn!(namespace, error = %err, "failed to spawn kubectl"),
    }
}

async fn wait_for_namespace_termination(namespaces: &Api<Namespace>, namespace: &str) {
    for _ in 0..TERMINATION_ATTEMPTS {
        match namespaces.get_opt(namespace).await {
            Ok(None) => return,
            Ok(Some(_)) => {}
            Err(err) => {
                warn!(namespace, error = %err, "failed to poll namespace termination");
                return;
            }
        }
        sleep(TERMINATION_POLL_INTERVAL).await;
    }
    warn!(namespace, "namespace still terminating after the cleanup window");
}
