use std::{fmt, time::Duration};

use futures::future::join_all;
use reqwest::Client as ReqwestClient;
use thiserror::Error;
use tokio::time::{sleep, timeout};

use crate::nodes::paths;
pub use crate::topology::NodeRole;

/// Last observed failure for a port that never became ready.
#[derive(Clone, Debug)]
pub struct ProbeFailure {
    role: NodeRole,
    port: u16,
    last_error: String,
}

impl ProbeFailure {
    #[must_use]
    pub const fn role(&self) -> NodeRole {
        self.role
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn last_error(&self) -> &str {
        &self.last_error
    }
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}: {}", self.role, self.port, self.last_error)
    }
}

/// Readiness timeout carrying every unready node and the last failure seen
/// while polling it.
#[derive(Debug, Error)]
#[error("timeout waiting for node HTTP endpoints after {timeout:?}: {}", summary(.failures))]
pub struct HttpReadinessError {
    timeout: Duration,
    failures: Vec<ProbeFailure>,
}

impl HttpReadinessError {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn failures(&self) -> &[ProbeFailure] {
        &self.failures
    }
}

fn summary(failures: &[ProbeFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub async fn wait_for_http_ports(
    ports: &[u16],
    role: NodeRole,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> Result<(), HttpReadinessError> {
    wait_for_http_ports_with_host(ports, role, "127.0.0.1", timeout_duration, poll_interval).await
}

/// Polls every port until it answers the health endpoint or the shared
/// timeout elapses. All ports keep polling to the deadline so the error can
/// name every unready node, not just the first.
pub async fn wait_for_http_ports_with_host(
    ports: &[u16],
    role: NodeRole,
    host: &str,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> Result<(), HttpReadinessError> {
    if ports.is_empty() {
        return Ok(());
    }

    let client = ReqwestClient::new();
    let probes = ports.iter().copied().map(|port| {
        wait_for_single_port(
            client.clone(),
            port,
            role,
            host,
            timeout_duration,
            poll_interval,
        )
    });

    let failures: Vec<ProbeFailure> = join_all(probes).await.into_iter().flatten().collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(HttpReadinessError {
            timeout: timeout_duration,
            failures,
        })
    }
}

async fn wait_for_single_port(
    client: ReqwestClient,
    port: u16,
    role: NodeRole,
    host: &str,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> Option<ProbeFailure> {
    let url = format!("http://{host}:{port}{}", paths::HEALTH);
    let mut last_error = String::from("no response observed");
    let ready = timeout(
        timeout_duration,
        probe_loop(&client, &url, &mut last_error, poll_interval),
    )
    .await;

    if ready.is_ok() {
        None
    } else {
        Some(ProbeFailure {
            role,
            port,
            last_error,
        })
    }
}

async fn probe_loop(
    client: &ReqwestClient,
    url: &str,
    last_error: &mut String,
    poll_interval: Duration,
) {
    loop {
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => return,
            Ok(response) => *last_error = format!("status {}", response.status()),
            Err(err) => *last_error = err.to_string(),
        }
        sleep(poll_interval).await;
    }
}
