use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, Client,
    api::{ListParams, LogParams},
};
use tracing::warn;

const LOG_TAIL_LINES: i64 = 500;

/// Dumps the tail of every pod log in the namespace to stderr. Used on
/// deployment failures before the namespace is torn down.
pub(crate) async fn dump_pod_logs(client: &Client, namespace: &str) {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let list = match pods.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(err) => {
            warn!(namespace, error = %err, "failed to list pods for log dump");
            return;
        }
    };

    for pod in list {
        let Some(name) = pod.metadata.name else {
            continue;
        };
        let params = LogParams {
            follow: false,
            tail_lines: Some(LOG_TAIL_LINES),
            ..Default::default()
        };
        match pods.logs(&name, &params).await {
            Ok(logs) => {
                eprintln!("[k8s-runner] logs for pod {name}:");
                eprintln!("{logs}");
            }
            Err(err) => warn!(pod = %name, error = %err, "failed to fetch logs"),
        }
    }
}
