use std::fmt;

use async_trait::async_trait;
use testbed_core::{
    nodes::ApiClient,
    scenario::{DynError, Expectation, RunContext},
};
use thiserror::Error;

/// How far an individual node may trail the observed tip before it counts as
/// a liveness violation.
const LAG_ALLOWANCE: u64 = 2;
/// Minimum height delta a run must produce even when the expected block count
/// is very small.
const MIN_PROGRESS_BLOCKS: u64 = 5;

/// Checks that the chain kept growing during the run and that no node fell
/// behind the tip by more than the allowance.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsensusLiveness {
    baseline: Option<u64>,
}

#[async_trait]
impl Expectation for ConsensusLiveness {
    fn name(&self) -> &'static str {
        "consensus_liveness"
    }

    async fn start_capture(&mut self, ctx: &RunContext) -> Result<(), DynError> {
        let snapshot = ctx.block_feed().latest();
        self.baseline = Some(snapshot.height);
        tracing::debug!(baseline = snapshot.height, "captured liveness baseline");
        Ok(())
    }

    async fn evaluate(&mut self, ctx: &RunContext) -> Result<(), DynError> {
        let baseline = self.baseline.ok_or(ConsensusLivenessError::NotCaptured)?;
        let target = required_progress(ctx.expected_blocks());
        let check = Self::collect_samples(ctx).await;
        Self::report(baseline, target, check)
    }
}

impl ConsensusLiveness {
    async fn collect_samples(ctx: &RunContext) -> LivenessCheck {
        let tip = ctx.block_feed().latest().height;
        let nodes: Vec<(String, &ApiClient)> = ctx
            .descriptors()
            .nodes()
            .map(|node| node.label())
            .zip(ctx.node_clients().all_clients())
            .collect();

        let mut samples = Vec::with_capacity(nodes.len());
        let mut issues = Vec::new();
        for (label, client) in nodes {
            match client.consensus_info().await {
                Ok(info) => samples.push(NodeSample {
                    label,
                    height: info.height,
                }),
                Err(err) => issues.push(LivenessIssue::RequestFailed {
                    node: label,
                    source: err.into(),
                }),
            }
        }

        LivenessCheck {
            tip,
            samples,
            issues,
        }
    }

    fn report(baseline: u64, target: u64, mut check: LivenessCheck) -> Result<(), DynError> {
        let observed = check.tip.saturating_sub(baseline);
        if observed < target {
            check.issues.push(LivenessIssue::InsufficientProgress {
                observed,
                required: target,
            });
        }

        for sample in &check.samples {
            if sample.height.saturating_add(LAG_ALLOWANCE) < check.tip {
                check.issues.push(LivenessIssue::NodeLagging {
                    node: sample.label.clone(),
                    height: sample.height,
                    tip: check.tip,
                });
            }
        }

        if check.issues.is_empty() {
            tracing::info!(
                observed,
                target,
                heights = ?check.samples.iter().map(|s| s.height).collect::<Vec<_>>(),
                "consensus liveness expectation satisfied"
            );
            Ok(())
        } else {
            Err(Box::new(ConsensusLivenessError::Violations {
                target,
                details: check.issues.into(),
            }))
        }
    }
}

/// Height delta the chain must gain over the run window.
const fn required_progress(expected_blocks: u64) -> u64 {
    let adjusted = expected_blocks.saturating_sub(LAG_ALLOWANCE);
    if adjusted < MIN_PROGRESS_BLOCKS {
        MIN_PROGRESS_BLOCKS
    } else {
        adjusted
    }
}

#[derive(Debug, Error)]
enum LivenessIssue {
    #[error("chain advanced {observed} blocks since capture, required {required}")]
    InsufficientProgress { observed: u64, required: u64 },
    #[error("{node} height {height} lags tip {tip}")]
    NodeLagging { node: String, height: u64, tip: u64 },
    #[error("{node} consensus_info failed: {source}")]
    RequestFailed {
        node: String,
        #[source]
        source: DynError,
    },
}

#[derive(Debug, Error)]
enum ConsensusLivenessError {
    #[error("liveness was evaluated before a baseline capture")]
    NotCaptured,
    #[error("consensus liveness violated (target={target}):\n{details}")]
    Violations {
        target: u64,
        #[source]
        details: ViolationIssues,
    },
}

#[derive(Debug)]
struct ViolationIssues(Vec<LivenessIssue>);

impl fmt::Display for ViolationIssues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, issue) in self.0.iter().enumerate() {
            if position > 0 {
                writeln!(f)?;
            }
            write!(f, "- {issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ViolationIssues {}

impl From<Vec<LivenessIssue>> for ViolationIssues {
    fn from(issues: Vec<LivenessIssue>) -> Self {
        Self(issues)
    }
}

struct NodeSample {
    label: String,
    height: u64,
}

struct LivenessCheck {
    tip: u64,
    samples: Vec<NodeSample>,
    issues: Vec<LivenessIssue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(tip: u64, heights: &[(&str, u64)]) -> LivenessCheck {
        LivenessCheck {
            tip,
            samples: heights
                .iter()
                .map(|(label, height)| NodeSample {
                    label: (*label).to_owned(),
                    height: *height,
                })
                .collect(),
            issues: Vec::new(),
        }
    }

    #[test]
    fn progress_target_is_floored_at_the_minimum() {
        assert_eq!(required_progress(10), 8);
        assert_eq!(required_progress(4), 5);
        assert_eq!(required_progress(0), 5);
    }

    #[test]
    fn healthy_chain_satisfies_the_expectation() {
        let check = check(10, &[("validator-0", 10), ("validator-1", 9)]);
        assert!(ConsensusLiveness::report(2, 8, check).is_ok());
    }

    #[test]
    fn stalled_chain_reports_the_observed_delta() {
        let check = check(10, &[("validator-0", 10)]);
        let err = ConsensusLiveness::report(8, 5, check).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("consensus liveness violated (target=5)"));
        assert!(
            err.source()
                .is_some_and(|details| details
                    .to_string()
                    .contains("chain advanced 2 blocks since capture, required 5"))
        );
    }

    #[test]
    fn lagging_nodes_are_named_individually() {
        let check = check(10, &[("validator-0", 10), ("validator-1", 6)]);
        let err = ConsensusLiveness::report(0, 5, check).unwrap_err();
        let details = err.source().map(ToString::to_string).unwrap_or_default();
        assert!(details.contains("- validator-1 height 6 lags tip 10"));
        assert!(!details.contains("validator-0 height"));
    }

    #[test]
    fn issues_are_listed_one_per_line() {
        let check = check(10, &[("validator-0", 3)]);
        let err = ConsensusLiveness::report(9, 5, check).unwrap_err();
        let details = err.source().map(ToString::to_string).unwrap_or_default();
        let lines: Vec<&str> = details.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|line| line.starts_with("- ")));
    }
}
