use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt as _;
use tokio::{
    task::JoinSet,
    time::{sleep, timeout},
};
use tracing::warn;

use super::deployer::{FailureReport, NamedFailure, ScenarioError};
use crate::{
    adjust_timeout,
    scenario::{
        DynError, Expectation, Scenario, Workload,
        runtime::context::{CleanupGuard, RunContext, RunHandle},
    },
};

/// Window granted to aborted workload tasks to settle before the runner
/// stops waiting for them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type WorkloadOutcome = (String, Result<(), DynError>);

/// Represents a fully prepared environment capable of executing a scenario.
pub struct Runner {
    context: Arc<RunContext>,
    cleanup_guard: Option<Box<dyn CleanupGuard>>,
}

impl Runner {
    #[must_use]
    pub fn new(context: RunContext, cleanup_guard: Option<Box<dyn CleanupGuard>>) -> Self {
        Self {
            context: Arc::new(context),
            cleanup_guard,
        }
    }

    #[must_use]
    pub fn context(&self) -> Arc<RunContext> {
        Arc::clone(&self.context)
    }

    pub(crate) fn cleanup(&mut self) {
        if let Some(guard) = self.cleanup_guard.take() {
            guard.cleanup();
        }
    }

    pub(crate) fn into_run_handle(mut self) -> RunHandle {
        RunHandle::from_shared(Arc::clone(&self.context), self.cleanup_guard.take())
    }

    /// Executes the scenario: workload prerequisites, expectation captures,
    /// the concurrent workload phase, a cooldown, and finally every
    /// expectation. Workload and expectation failures are collected into one
    /// [`FailureReport`] so a single run names every culprit; prerequisite
    /// and capture failures abort before anything starts.
    pub async fn run<Caps>(
        mut self,
        scenario: &mut Scenario<Caps>,
    ) -> Result<RunHandle, ScenarioError>
    where
        Caps: Send + Sync,
    {
        let context = self.context();

        if let Err(error) = Self::initialize_workloads(scenario.workloads_mut(), context.as_ref())
        {
            self.cleanup();
            return Err(error);
        }

        if let Err(error) =
            Self::prepare_expectations(scenario.expectations_mut(), context.as_ref()).await
        {
            self.cleanup();
            return Err(error);
        }

        let workload_failures = Self::run_workloads(&context, scenario).await;

        Self::cooldown(&context).await;

        let expectation_failures =
            Self::run_expectations(scenario.expectations_mut(), context.as_ref()).await;

        let report = FailureReport::new(workload_failures, expectation_failures);
        if report.is_empty() {
            Ok(self.into_run_handle())
        } else {
            self.cleanup();
            Err(ScenarioError::Failed { report })
        }
    }

    /// Runs every workload's prerequisite hook before anything is spawned.
    /// The first failure aborts the run with the workload's name attached.
    fn initialize_workloads(
        workloads: &mut [Arc<dyn Workload>],
        context: &RunContext,
    ) -> Result<(), ScenarioError> {
        let descriptors = context.descriptors();
        let run_metrics = context.run_metrics();

        for workload in workloads {
            let name = workload.name().to_owned();
            let Some(inner) = Arc::get_mut(workload) else {
                return Err(ScenarioError::Prerequisite {
                    workload: name,
                    source: "workload handle is still shared by a previous run".into(),
                });
            };
            inner
                .init(descriptors, &run_metrics)
                .map_err(|source| ScenarioError::Prerequisite {
                    workload: name,
                    source,
                })?;
        }
        Ok(())
    }

    /// Arms expectation captures in registration order, strictly before any
    /// workload starts, so baselines never race the traffic they measure.
    async fn prepare_expectations(
        expectations: &mut [Box<dyn Expectation>],
        context: &RunContext,
    ) -> Result<(), ScenarioError> {
        for expectation in expectations {
            if let Err(source) = expectation.start_capture(context).await {
                return Err(ScenarioError::Capture {
                    expectation: expectation.name().to_owned(),
                    source,
                });
            }
        }
        Ok(())
    }

    /// Spawns every workload, lets them run until the configured duration
    /// elapses (or all return early), then aborts and drains the rest.
    /// Failures never cancel sibling workloads.
    async fn run_workloads<Caps>(
        context: &Arc<RunContext>,
        scenario: &Scenario<Caps>,
    ) -> Vec<NamedFailure>
    where
        Caps: Send + Sync,
    {
        let mut workloads = Self::spawn_workloads(scenario, context);
        let mut failures = Vec::new();

        Self::drive_until_timer(&mut workloads, scenario.duration(), &mut failures).await;
        Self::drain_workloads(&mut workloads, &mut failures).await;

        failures
    }

    /// Evaluates every registered expectation in order, aggregating failures
    /// so callers see all missing conditions in a single report.
    async fn run_expectations(
        expectations: &mut [Box<dyn Expectation>],
        context: &RunContext,
    ) -> Vec<NamedFailure> {
        let mut failures = Vec::new();
        for expectation in expectations {
            if let Err(source) = expectation.evaluate(context).await {
                failures.push(NamedFailure::new(expectation.name(), source.to_string()));
            }
        }
        failures
    }

    /// Lets the cluster quiesce before expectations sample it. Runs with
    /// node control get a longer floor since restarted nodes need to rejoin.
    async fn cooldown(context: &Arc<RunContext>) {
        let metrics = context.run_metrics();
        let needs_stabilization = context.node_control().is_some();

        let mut wait = metrics.block_interval_hint().mul_f64(5.0);
        if needs_stabilization {
            let minimum = Duration::from_secs(30);
            if wait < minimum {
                wait = minimum;
            }
        }
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    /// Spawns each workload inside its own task, capturing panics so one
    /// misbehaving workload cannot take down the runner.
    fn spawn_workloads<Caps>(
        scenario: &Scenario<Caps>,
        context: &Arc<RunContext>,
    ) -> JoinSet<WorkloadOutcome>
    where
        Caps: Send + Sync,
    {
        let mut workloads = JoinSet::new();
        for workload in scenario.workloads() {
            let workload = Arc::clone(workload);
            let ctx = Arc::clone(context);

            workloads.spawn(async move {
                let name = workload.name().to_owned();
                let outcome = AssertUnwindSafe(async { workload.start(ctx.as_ref()).await })
                    .catch_unwind()
                    .await;

                let outcome = outcome.unwrap_or_else(|panic| {
                    Err(format!("workload panicked: {}", panic_message(panic)).into())
                });
                (name, outcome)
            });
        }

        workloads
    }

    /// Polls workload tasks until the run window closes or every task has
    /// returned, collecting failures as they surface.
    async fn drive_until_timer(
        workloads: &mut JoinSet<WorkloadOutcome>,
        duration: Duration,
        failures: &mut Vec<NamedFailure>,
    ) {
        let run_future = async {
            while let Some(result) = workloads.join_next().await {
                Self::collect_join_result(result, failures);
            }
        };

        // Expiry is the normal way long-running workloads stop.
        let _ = timeout(duration, run_future).await;
    }

    /// Aborts remaining workload tasks and waits a bounded window for them
    /// to settle so we do not leak work across scenario runs.
    async fn drain_workloads(
        workloads: &mut JoinSet<WorkloadOutcome>,
        failures: &mut Vec<NamedFailure>,
    ) {
        workloads.abort_all();

        let drain = async {
            while let Some(result) = workloads.join_next().await {
                Self::collect_join_result(result, failures);
            }
        };

        if timeout(adjust_timeout(DRAIN_TIMEOUT), drain).await.is_err() {
            warn!(
                drain_timeout = ?DRAIN_TIMEOUT,
                "workload tasks did not settle within the drain window"
            );
        }
    }

    /// Records the outcome of a workload task, tolerating cancellation since
    /// aborting unfinished tasks at expiry is the expected shutdown path.
    fn collect_join_result(
        result: Result<WorkloadOutcome, tokio::task::JoinError>,
        failures: &mut Vec<NamedFailure>,
    ) {
        match result {
            Ok((_, Ok(()))) => {}
            Ok((name, Err(source))) => {
                warn!(workload = %name, error = %source, "workload failed; siblings keep running");
                failures.push(NamedFailure::new(name, source.to_string()));
            }
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => {
                failures.push(NamedFailure::new(
                    "workload task",
                    format!("task failed: {join_err}"),
                ));
            }
        }
    }
}

/// Attempts to turn a panic payload into a readable string for diagnostics.
fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic.downcast::<String>().map_or_else(
        |panic| {
            panic.downcast::<&'static str>().map_or_else(
                |_| "unknown panic".to_owned(),
                |message| (*message).to_owned(),
            )
        },
        |message| *message,
    )
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_render_to_strings() {
        assert_eq!(panic_message(Box::new("boom".to_owned())), "boom");
        assert_eq!(panic_message(Box::new("static boom")), "static boom");
        assert_eq!(panic_message(Box::new(42_u32)), "unknown panic");
    }

    #[test]
    fn cancelled_tasks_are_not_failures() {
        let mut failures = Vec::new();
        Runner::collect_join_result(Ok(("noop".to_owned(), Ok(()))), &mut failures);
        assert!(failures.is_empty());

        Runner::collect_join_result(
            Ok(("flaky".to_owned(), Err("request refused".into()))),
            &mut failures,
        );
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name(), "flaky");
        assert_eq!(failures[0].message(), "request refused");
    }
}
