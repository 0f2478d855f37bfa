use std::time::Duration;

use testbed_core::{
    adjust_timeout,
    scenario::http_probe::{self, HttpReadinessError},
    topology::NodeRole,
};

pub(crate) const DEFAULT_WAIT: Duration = Duration::from_secs(90);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub(crate) async fn wait_for_validators(ports: &[u16]) -> Result<(), HttpReadinessError> {
    http_probe::wait_for_http_ports(
        ports,
        NodeRole::Validator,
        adjust_timeout(DEFAULT_WAIT),
        POLL_INTERVAL,
    )
    .await
}

pub(crate) async fn wait_for_executors(ports: &[u16]) -> Result<(), HttpReadinessError> {
    http_probe::wait_for_http_ports(
        ports,
        NodeRole::Executor,
        adjust_timeout(DEFAULT_WAIT),
        POLL_INTERVAL,
    )
    .await
}
