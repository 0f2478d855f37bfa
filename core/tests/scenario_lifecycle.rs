mod support;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use support::{EventLog, stub_runner};
use testbed_core::{
    scenario::{
        Builder, ControlOperation, DynError, Expectation, NodeControlError, NodeControlHandle,
        RunContext, RunMetrics, ScenarioError, Workload,
    },
    topology::{GeneratedTopology, NodeRole, configs::consensus::ConsensusParams},
};
use tokio::time::sleep;

fn fast_builder(validators: usize) -> Builder<()> {
    Builder::<()>::with_node_counts(validators, 0)
        .map_topology(|topology| {
            topology.with_consensus_params(
                ConsensusParams::default()
                    .with_slot_duration(Duration::from_millis(100))
                    .with_active_slot_coeff(0.5),
            )
        })
        .with_run_duration(Duration::from_millis(400))
}

struct RecordingWorkload {
    name: &'static str,
    log: EventLog,
}

#[async_trait]
impl Workload for RecordingWorkload {
    fn name(&self) -> &str {
        self.name
    }

    async fn start(&self, _ctx: &RunContext) -> Result<(), DynError> {
        self.log.record(format!("start:{}", self.name));
        Ok(())
    }
}

struct FailingInitWorkload {
    log: EventLog,
}

#[async_trait]
impl Workload for FailingInitWorkload {
    fn name(&self) -> &str {
        "broken prerequisites"
    }

    fn init(
        &mut self,
        _descriptors: &GeneratedTopology,
        _run_metrics: &RunMetrics,
    ) -> Result<(), DynError> {
        Err("missing wallet funding".into())
    }

    async fn start(&self, _ctx: &RunContext) -> Result<(), DynError> {
        self.log.record("start:broken prerequisites");
        Ok(())
    }
}

struct FailingWorkload {
    name: &'static str,
    message: &'static str,
}

#[async_trait]
impl Workload for FailingWorkload {
    fn name(&self) -> &str {
        self.name
    }

    async fn start(&self, _ctx: &RunContext) -> Result<(), DynError> {
        Err(self.message.into())
    }
}

/// Ticks until cancelled at the end of the run window.
struct TickingWorkload {
    ticks: Arc<AtomicU64>,
}

#[async_trait]
impl Workload for TickingWorkload {
    fn name(&self) -> &str {
        "ticker"
    }

    async fn start(&self, _ctx: &RunContext) -> Result<(), DynError> {
        loop {
            sleep(Duration::from_millis(10)).await;
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct CountingInitWorkload {
    inits: Arc<AtomicUsize>,
}

#[async_trait]
impl Workload for CountingInitWorkload {
    fn name(&self) -> &str {
        "counting init"
    }

    fn init(
        &mut self,
        _descriptors: &GeneratedTopology,
        _run_metrics: &RunMetrics,
    ) -> Result<(), DynError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, _ctx: &RunContext) -> Result<(), DynError> {
        Ok(())
    }
}

struct RecordingExpectation {
    name: &'static str,
    log: EventLog,
    fail_capture: bool,
    fail_evaluation: Option<&'static str>,
}

impl RecordingExpectation {
    fn passing(name: &'static str, log: EventLog) -> Self {
        Self {
            name,
            log,
            fail_capture: false,
            fail_evaluation: None,
        }
    }

    fn failing_capture(name: &'static str, log: EventLog) -> Self {
        Self {
            name,
            log,
            fail_capture: true,
            fail_evaluation: None,
        }
    }

    fn failing_evaluation(name: &'static str, log: EventLog, message: &'static str) -> Self {
        Self {
            name,
            log,
            fail_capture: false,
            fail_evaluation: Some(message),
        }
    }
}

#[async_trait]
impl Expectation for RecordingExpectation {
    fn name(&self) -> &str {
        self.name
    }

    async fn start_capture(&mut self, _ctx: &RunContext) -> Result<(), DynError> {
        self.log.record(format!("capture:{}", self.name));
        if self.fail_capture {
            return Err("baseline query refused".into());
        }
        Ok(())
    }

    async fn evaluate(&mut self, _ctx: &RunContext) -> Result<(), DynError> {
        self.log.record(format!("evaluate:{}", self.name));
        match self.fail_evaluation {
            Some(message) => Err(message.into()),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct RecordingControl {
    restarts: Mutex<Vec<(NodeRole, usize)>>,
}

#[async_trait]
impl NodeControlHandle for RecordingControl {
    fn backend(&self) -> &'static str {
        "stub"
    }

    async fn restart(&self, role: NodeRole, index: usize) -> Result<(), NodeControlError> {
        self.restarts.lock().unwrap().push((role, index));
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn prerequisite_failure_skips_captures_and_starts() {
    let log = EventLog::default();
    let cleanups = Arc::new(AtomicUsize::new(0));
    let mut scenario = fast_builder(1)
        .with_workload(FailingInitWorkload { log: log.clone() })
        .with_workload(RecordingWorkload {
            name: "sibling",
            log: log.clone(),
        })
        .with_expectation(RecordingExpectation::passing("baseline", log.clone()))
        .build()
        .unwrap();

    let (runner, _feed_task) = stub_runner(&scenario, &cleanups, None).await;
    let error = runner.run(&mut scenario).await.unwrap_err();

    let ScenarioError::Prerequisite { workload, source } = error else {
        panic!("expected a prerequisite failure, got {error}");
    };
    assert_eq!(workload, "broken prerequisites");
    assert!(source.to_string().contains("missing wallet funding"));
    assert!(
        log.entries().is_empty(),
        "nothing may run after an init failure: {:?}",
        log.entries()
    );
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn captures_arm_in_order_before_any_workload_starts() {
    let log = EventLog::default();
    let cleanups = Arc::new(AtomicUsize::new(0));
    let mut scenario = fast_builder(1)
        .with_expectation(RecordingExpectation::passing("first", log.clone()))
        .with_expectation(RecordingExpectation::passing("second", log.clone()))
        .with_workload(RecordingWorkload {
            name: "traffic",
            log: log.clone(),
        })
        .build()
        .unwrap();

    let (runner, _feed_task) = stub_runner(&scenario, &cleanups, None).await;
    let handle = runner.run(&mut scenario).await.expect("scenario passes");

    assert_eq!(
        log.entries(),
        vec![
            "capture:first",
            "capture:second",
            "start:traffic",
            "evaluate:first",
            "evaluate:second",
        ]
    );

    assert_eq!(
        cleanups.load(Ordering::SeqCst),
        0,
        "guard must transfer to the run handle on success"
    );
    drop(handle);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn capture_failure_stops_the_run_before_workloads() {
    let log = EventLog::default();
    let cleanups = Arc::new(AtomicUsize::new(0));
    let mut scenario = fast_builder(1)
        .with_expectation(RecordingExpectation::passing("armed", log.clone()))
        .with_expectation(RecordingExpectation::failing_capture(
            "broken capture",
            log.clone(),
        ))
        .with_workload(RecordingWorkload {
            name: "traffic",
            log: log.clone(),
        })
        .build()
        .unwrap();

    let (runner, _feed_task) = stub_runner(&scenario, &cleanups, None).await;
    let error = runner.run(&mut scenario).await.unwrap_err();

    let ScenarioError::Capture { expectation, source } = error else {
        panic!("expected a capture failure, got {error}");
    };
    assert_eq!(expectation, "broken capture");
    assert!(source.to_string().contains("baseline query refused"));
    assert_eq!(log.entries(), vec!["capture:armed", "capture:broken capture"]);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn workload_failures_do_not_cancel_siblings() {
    let cleanups = Arc::new(AtomicUsize::new(0));
    let ticks = Arc::new(AtomicU64::new(0));
    let mut scenario = fast_builder(1)
        .with_workload(FailingWorkload {
            name: "instant failure",
            message: "connection refused by node",
        })
        .with_workload(TickingWorkload {
            ticks: Arc::clone(&ticks),
        })
        .build()
        .unwrap();

    let (runner, _feed_task) = stub_runner(&scenario, &cleanups, None).await;
    let error = runner.run(&mut scenario).await.unwrap_err();

    let ScenarioError::Failed { report } = error else {
        panic!("expected an aggregated failure, got {error}");
    };
    assert_eq!(report.workloads().len(), 1);
    assert_eq!(report.workloads()[0].name(), "instant failure");
    assert!(report.expectations().is_empty());

    let observed_ticks = ticks.load(Ordering::SeqCst);
    assert!(
        observed_ticks >= 30,
        "sibling should keep running for the full window, ticked {observed_ticks} times"
    );
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn report_aggregates_every_workload_and_expectation_failure() {
    let log = EventLog::default();
    let cleanups = Arc::new(AtomicUsize::new(0));
    let mut scenario = fast_builder(1)
        .with_workload(FailingWorkload {
            name: "transactions",
            message: "mempool rejected the batch",
        })
        .with_workload(FailingWorkload {
            name: "dispersal",
            message: "channel closed mid-write",
        })
        .with_expectation(RecordingExpectation::failing_evaluation(
            "liveness",
            log.clone(),
            "chain stalled at height 4",
        ))
        .with_expectation(RecordingExpectation::passing("peer counts", log.clone()))
        .build()
        .unwrap();

    let (runner, _feed_task) = stub_runner(&scenario, &cleanups, None).await;
    let error = runner.run(&mut scenario).await.unwrap_err();

    let ScenarioError::Failed { ref report } = error else {
        panic!("expected an aggregated failure, got {error}");
    };

    let workload_names: Vec<_> = report
        .workloads()
        .iter()
        .map(|failure| failure.name())
        .collect();
    assert_eq!(workload_names.len(), 2);
    assert!(workload_names.contains(&"transactions"));
    assert!(workload_names.contains(&"dispersal"));

    assert_eq!(report.expectations().len(), 1);
    assert_eq!(report.expectations()[0].name(), "liveness");

    // A failing expectation never blocks the ones after it.
    assert!(log.entries().contains(&"evaluate:peer counts".to_owned()));

    let rendered = error.to_string();
    assert!(rendered.contains("mempool rejected the batch"));
    assert!(rendered.contains("channel closed mid-write"));
    assert!(rendered.contains("chain stalled at height 4"));
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn long_workloads_are_cancelled_at_expiry_without_failing() {
    let cleanups = Arc::new(AtomicUsize::new(0));
    let ticks = Arc::new(AtomicU64::new(0));
    let mut scenario = fast_builder(1)
        .with_workload(TickingWorkload {
            ticks: Arc::clone(&ticks),
        })
        .build()
        .unwrap();

    let (runner, _feed_task) = stub_runner(&scenario, &cleanups, None).await;
    let handle = runner
        .run(&mut scenario)
        .await
        .expect("cancellation at expiry is not a failure");

    assert!(ticks.load(Ordering::SeqCst) >= 30);
    drop(handle);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn node_control_reaches_workloads_and_denies_unsupported_operations() {
    struct RestartOnce;

    #[async_trait]
    impl Workload for RestartOnce {
        fn name(&self) -> &str {
            "restart once"
        }

        async fn start(&self, ctx: &RunContext) -> Result<(), DynError> {
            let control = ctx
                .node_control()
                .ok_or("node control missing from context")?;
            control.restart(NodeRole::Validator, 0).await?;

            match control.pause(NodeRole::Validator, 0).await {
                Err(NodeControlError::NotSupported { backend, operation }) => {
                    if backend != "stub" || operation != ControlOperation::Pause {
                        return Err(format!("wrong denial: {backend} {operation}").into());
                    }
                }
                other => return Err(format!("pause should be refused, got {other:?}").into()),
            }
            Ok(())
        }
    }

    let cleanups = Arc::new(AtomicUsize::new(0));
    let control = Arc::new(RecordingControl::default());
    let mut scenario = fast_builder(1)
        .enable_node_control()
        .with_workload(RestartOnce)
        .build()
        .unwrap();
    assert!(scenario.requires_node_control());

    let (runner, _feed_task) = stub_runner(
        &scenario,
        &cleanups,
        Some(Arc::clone(&control) as Arc<dyn NodeControlHandle>),
    )
    .await;
    let handle = runner.run(&mut scenario).await.expect("scenario passes");

    assert_eq!(
        control.restarts.lock().unwrap().clone(),
        vec![(NodeRole::Validator, 0)]
    );
    drop(handle);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn prerequisites_rerun_when_a_scenario_is_deployed_again() {
    let cleanups = Arc::new(AtomicUsize::new(0));
    let inits = Arc::new(AtomicUsize::new(0));
    let mut scenario = fast_builder(1)
        .with_workload(CountingInitWorkload {
            inits: Arc::clone(&inits),
        })
        .build()
        .unwrap();

    let (first, _first_feed) = stub_runner(&scenario, &cleanups, None).await;
    drop(first.run(&mut scenario).await.expect("first run passes"));

    let (second, _second_feed) = stub_runner(&scenario, &cleanups, None).await;
    drop(second.run(&mut scenario).await.expect("second run passes"));

    assert_eq!(inits.load(Ordering::SeqCst), 2);
    assert_eq!(cleanups.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn abandoned_runner_fires_cleanup_exactly_once() {
    let cleanups = Arc::new(AtomicUsize::new(0));
    let scenario = fast_builder(1).build().unwrap();

    let (runner, _feed_task) = stub_runner(&scenario, &cleanups, None).await;
    drop(runner);

    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}
