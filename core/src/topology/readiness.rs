use std::time::Duration;

use futures::future::join_all;
use tokio::time::{sleep, timeout};

use crate::{
    adjust_timeout,
    scenario::NodeClients,
    topology::{GeneratedNodeConfig, GeneratedTopology},
};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("timed out after {timeout:?} waiting for network readiness: {pending}")]
    NetworkTimeout { timeout: Duration, pending: String },
    #[error("timed out after {timeout:?} waiting for DA membership assignations: {pending}")]
    MembershipTimeout { timeout: Duration, pending: String },
}

/// Waits until every node reports at least the peer count implied by the
/// topology's dial graph.
pub async fn wait_network_ready(
    descriptors: &GeneratedTopology,
    clients: &NodeClients,
    total_timeout: Duration,
) -> Result<(), ReadinessError> {
    if descriptors.node_count() <= 1 {
        return Ok(());
    }

    let expected = descriptors.expected_peer_counts();
    let ready = timeout(adjust_timeout(total_timeout), async {
        loop {
            let counts = observed_peer_counts(clients).await;
            let all_ready = counts
                .iter()
                .zip(&expected)
                .all(|(count, want)| count.is_some_and(|got| got >= *want));
            if all_ready {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }
    })
    .await;

    if ready.is_err() {
        let counts = observed_peer_counts(clients).await;
        let pending = network_summary(descriptors, &counts, &expected);
        return Err(ReadinessError::NetworkTimeout {
            timeout: total_timeout,
            pending,
        });
    }
    Ok(())
}

/// Waits until every node reports non-empty DA membership assignations.
pub async fn wait_da_membership_ready(
    descriptors: &GeneratedTopology,
    clients: &NodeClients,
    total_timeout: Duration,
) -> Result<(), ReadinessError> {
    if descriptors.node_count() == 0 {
        return Ok(());
    }

    let ready = timeout(adjust_timeout(total_timeout), async {
        loop {
            let statuses = membership_statuses(clients).await;
            if statuses.iter().all(|ready| *ready) {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }
    })
    .await;

    if ready.is_err() {
        let statuses = membership_statuses(clients).await;
        let pending = descriptors
            .nodes()
            .map(GeneratedNodeConfig::label)
            .zip(statuses)
            .filter(|(_, ready)| !*ready)
            .map(|(label, _)| label)
            .collect::<Vec<_>>()
            .join(", ");
        return Err(ReadinessError::MembershipTimeout {
            timeout: total_timeout,
            pending,
        });
    }
    Ok(())
}

async fn observed_peer_counts(clients: &NodeClients) -> Vec<Option<usize>> {
    join_all(clients.all_clients().map(|client| async move {
        client
            .network_info()
            .await
            .ok()
            .map(|info| info.peer_count)
    }))
    .await
}

async fn membership_statuses(clients: &NodeClients) -> Vec<bool> {
    join_all(clients.all_clients().map(|client| async move {
        client
            .da_membership()
            .await
            .is_ok_and(|resp| !resp.assignations.is_empty())
    }))
    .await
}

fn network_summary(
    descriptors: &GeneratedTopology,
    counts: &[Option<usize>],
    expected: &[usize],
) -> String {
    descriptors
        .nodes()
        .zip(counts)
        .zip(expected)
        .filter(|((_, count), want)| !count.is_some_and(|got| got >= **want))
        .map(|((node, count), want)| {
            let got = count.map_or_else(|| "unreachable".to_owned(), |got| got.to_string());
            format!("{}: peers={got}, expected={want}", node.label())
        })
        .collect::<Vec<_>>()
        .join(", ")
}
