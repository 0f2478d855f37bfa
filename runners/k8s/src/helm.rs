use std::path::Path;

use tokio::process::Command;
use tracing::info;

const INSTALL_TIMEOUT: &str = "5m";

#[derive(Debug, thiserror::Error)]
pub enum HelmError {
    #[error("failed to spawn helm {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("helm {command} exited with status {status:?}; stderr: {stderr}")]
    Failed {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

/// Installs the node chart into `namespace` and blocks until every chart
/// resource reports ready or the helm timeout expires.
pub async fn install_release(
    chart_path: &Path,
    values_file: &Path,
    release: &str,
    namespace: &str,
) -> Result<(), HelmError> {
    info!(release, namespace, "installing helm release");
    let chart = chart_path.display().to_string();
    let values = values_file.display().to_string();
    let args = [
        "install",
        release,
        chart.as_str(),
        "--namespace",
        namespace,
        "--create-namespace",
        "--wait",
        "--timeout",
        INSTALL_TIMEOUT,
        "-f",
        values.as_str(),
    ];
    run_helm_command("install", &args).await
}

pub async fn uninstall_release(release: &str, namespace: &str) -> Result<(), HelmError> {
    info!(release, namespace, "uninstalling helm release");
    let args = ["uninstall", release, "--namespace", namespace, "--wait"];
    run_helm_command("uninstall", &args).await
}

async fn run_helm_command(command: &str, args: &[&str]) -> Result<(), HelmError> {
    let output = Command::new("helm")
        .args(args)
        .output()
        .await
        .map_err(|source| HelmError::Spawn {
            command: command.to_owned(),
            source,
        })?;

    if output.status.success() {
        return Ok(());
    }

    Err(HelmError::Failed {
        command: command.to_owned(),
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
