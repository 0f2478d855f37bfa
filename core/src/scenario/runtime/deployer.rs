use std::fmt;

use async_trait::async_trait;

use super::runner::Runner;
use crate::scenario::{DynError, Scenario};

/// Error returned when preparing or executing a scenario run.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("workload {workload} failed its prerequisites: {source}")]
    Prerequisite {
        workload: String,
        #[source]
        source: DynError,
    },
    #[error("expectation {expectation} failed to start its capture: {source}")]
    Capture {
        expectation: String,
        #[source]
        source: DynError,
    },
    #[error("{report}")]
    Failed { report: FailureReport },
}

/// A single named workload or expectation failure.
#[derive(Clone, Debug)]
pub struct NamedFailure {
    name: String,
    message: String,
}

impl NamedFailure {
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Aggregated run verdict listing every workload and expectation that failed.
///
/// Workload failures are collected while siblings keep running, so a single
/// report can name several culprits at once.
#[derive(Debug, Default)]
pub struct FailureReport {
    workloads: Vec<NamedFailure>,
    expectations: Vec<NamedFailure>,
}

impl FailureReport {
    #[must_use]
    pub fn new(workloads: Vec<NamedFailure>, expectations: Vec<NamedFailure>) -> Self {
        Self {
            workloads,
            expectations,
        }
    }

    #[must_use]
    pub fn workloads(&self) -> &[NamedFailure] {
        &self.workloads
    }

    #[must_use]
    pub fn expectations(&self) -> &[NamedFailure] {
        &self.expectations
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty() && self.expectations.is_empty()
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines = Vec::with_capacity(1 + self.workloads.len() + self.expectations.len());
        lines.push(format!(
            "scenario failed ({} workload / {} expectation failures)",
            self.workloads.len(),
            self.expectations.len()
        ));
        for failure in &self.workloads {
            lines.push(format!("workload {}: {}", failure.name, failure.message));
        }
        for failure in &self.expectations {
            lines.push(format!("expectation {}: {}", failure.name, failure.message));
        }
        f.write_str(&lines.join("\n"))
    }
}

#[async_trait]
pub trait Deployer<Caps = ()>: Send + Sync {
    type Error;

    async fn deploy(&self, scenario: &Scenario<Caps>) -> Result<Runner, Self::Error>;
}
