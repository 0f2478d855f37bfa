use std::{
    num::{NonZeroU64, NonZeroUsize},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use testbed_core::{
    nodes::TransactionRequest,
    scenario::{DynError, Expectation, RunContext, RunMetrics, Workload as ScenarioWorkload},
    topology::GeneratedTopology,
};
use thiserror::Error;
use tokio::time::sleep;

const DEFAULT_TXS_PER_BLOCK: NonZeroU64 = NonZeroU64::new(5).unwrap();
const DEFAULT_USERS: NonZeroUsize = NonZeroUsize::new(1).unwrap();
const TRANSFER_AMOUNT: u64 = 1;

/// Fraction of the plan that must be accepted by the cluster for the bundled
/// expectation to pass.
const MIN_SUBMISSION_RATIO: f64 = 0.8;

#[derive(Debug, Error)]
pub enum TxFlowError {
    #[error("{required} transaction users requested but only {available} wallet accounts funded")]
    InsufficientWallets { required: usize, available: usize },
    #[error("transaction workload started before its submission plan was resolved")]
    NotInitialized,
    #[error("cluster rejected {rejected} transactions")]
    Rejected { rejected: u64 },
    #[error("cluster accepted {submitted} of {planned} planned transactions, required {required}")]
    BelowPlan {
        submitted: u64,
        planned: u64,
        required: u64,
    },
}

/// Submits a steady stream of transfers across the genesis wallets and tracks
/// how the cluster received them.
pub struct Workload {
    txs_per_block: NonZeroU64,
    users: NonZeroUsize,
    plan: Option<SubmissionPlan>,
    stats: Arc<TxFlowStats>,
}

#[async_trait]
impl ScenarioWorkload for Workload {
    fn name(&self) -> &'static str {
        "tx_flow"
    }

    fn expectations(&self) -> Vec<Box<dyn Expectation>> {
        vec![Box::new(TxFlowExpectation::new(Arc::clone(&self.stats))) as Box<dyn Expectation>]
    }

    fn init(
        &mut self,
        descriptors: &GeneratedTopology,
        run_metrics: &RunMetrics,
    ) -> Result<(), DynError> {
        let required = self.users.get();
        let available = descriptors.wallet_accounts().len();
        if available < required {
            return Err(TxFlowError::InsufficientWallets {
                required,
                available,
            }
            .into());
        }

        let plan = SubmissionPlan::resolve(run_metrics, self.txs_per_block);
        tracing::debug!(
            total = plan.total,
            interval_ms = plan.interval.as_millis() as u64,
            "transaction submission plan resolved"
        );
        self.stats.reset(plan.total);
        self.plan = Some(plan);
        Ok(())
    }

    async fn start(&self, ctx: &RunContext) -> Result<(), DynError> {
        let plan = self.plan.ok_or(TxFlowError::NotInitialized)?;
        if plan.total == 0 {
            return Ok(());
        }

        let senders: Vec<String> = ctx
            .wallet_accounts()
            .iter()
            .take(self.users.get())
            .map(|account| account.address().to_owned())
            .collect();
        let user_count = senders.len() as u64;

        for index in 0..plan.total {
            let request = TransactionRequest {
                sender: senders[(index % user_count) as usize].clone(),
                nonce: index / user_count,
                amount: TRANSFER_AMOUNT,
            };

            let outcome = ctx
                .cluster_client()
                .try_all_clients(|client| {
                    let request = request.clone();
                    Box::pin(async move { client.submit_transaction(&request).await })
                })
                .await;

            match outcome {
                Ok(()) => self.stats.record_submission(),
                Err(err) => {
                    tracing::warn!(index, error = %err, "cluster rejected transaction");
                    self.stats.record_rejection();
                }
            }

            if !plan.interval.is_zero() {
                sleep(plan.interval).await;
            }
        }

        Ok(())
    }
}

impl Workload {
    #[must_use]
    pub fn new(txs_per_block: NonZeroU64, users: NonZeroUsize) -> Self {
        Self {
            txs_per_block,
            users,
            plan: None,
            stats: TxFlowStats::shared(),
        }
    }

    #[must_use]
    pub fn with_rate(txs_per_block: u64) -> Option<Self> {
        NonZeroU64::new(txs_per_block).map(|rate| Self::new(rate, DEFAULT_USERS))
    }

    #[must_use]
    pub fn with_default_rate() -> Self {
        Self::new(DEFAULT_TXS_PER_BLOCK, DEFAULT_USERS)
    }

    #[must_use]
    pub const fn with_users(mut self, users: NonZeroUsize) -> Self {
        self.users = users;
        self
    }
}

impl Default for Workload {
    fn default() -> Self {
        Self::with_default_rate()
    }
}

/// Fixed submission schedule derived from the run window at init time.
#[derive(Clone, Copy)]
struct SubmissionPlan {
    total: u64,
    interval: Duration,
}

impl SubmissionPlan {
    fn resolve(run_metrics: &RunMetrics, txs_per_block: NonZeroU64) -> Self {
        let total = run_metrics
            .expected_consensus_blocks()
            .saturating_mul(txs_per_block.get());
        Self {
            total,
            interval: transmission_interval(run_metrics.run_duration(), total),
        }
    }
}

fn transmission_interval(run_duration: Duration, total_txs: u64) -> Duration {
    if total_txs == 0 {
        return Duration::ZERO;
    }

    let secs = run_duration.as_secs_f64();
    if !secs.is_finite() || secs <= 0.0 {
        return Duration::ZERO;
    }

    Duration::from_secs_f64(secs / total_txs as f64)
}

/// Submission counters shared between the workload and its bundled
/// expectation. Reset on every init so a redeployed scenario starts clean.
#[derive(Debug, Default)]
struct TxFlowStats {
    planned: AtomicU64,
    submitted: AtomicU64,
    rejected: AtomicU64,
}

impl TxFlowStats {
    fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn reset(&self, planned: u64) {
        self.planned.store(planned, Ordering::Relaxed);
        self.submitted.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
    }

    fn record_submission(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn planned(&self) -> u64 {
        self.planned.load(Ordering::Relaxed)
    }

    fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Verdict over the submission counters recorded during the run: the cluster
/// must accept at least [`MIN_SUBMISSION_RATIO`] of the plan and reject none.
pub struct TxFlowExpectation {
    stats: Arc<TxFlowStats>,
}

impl TxFlowExpectation {
    const fn new(stats: Arc<TxFlowStats>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl Expectation for TxFlowExpectation {
    fn name(&self) -> &'static str {
        "tx_acceptance"
    }

    async fn evaluate(&mut self, _ctx: &RunContext) -> Result<(), DynError> {
        let planned = self.stats.planned();
        if planned == 0 {
            tracing::debug!("transaction plan was empty, nothing to verify");
            return Ok(());
        }

        judge(planned, self.stats.submitted(), self.stats.rejected())?;
        tracing::info!(
            planned,
            submitted = self.stats.submitted(),
            "transaction flow accepted by the cluster"
        );
        Ok(())
    }
}

fn judge(planned: u64, submitted: u64, rejected: u64) -> Result<(), TxFlowError> {
    if rejected > 0 {
        return Err(TxFlowError::Rejected { rejected });
    }

    let required = required_submissions(planned);
    if submitted < required {
        return Err(TxFlowError::BelowPlan {
            submitted,
            planned,
            required,
        });
    }

    Ok(())
}

fn required_submissions(planned: u64) -> u64 {
    (planned as f64 * MIN_SUBMISSION_RATIO).ceil() as u64
}
