mod support;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use support::{CountingGuard, init_tracing, spawn_stub_cluster};
use testbed_core::{
    nodes::TransactionRequest,
    scenario::{
        BlockFeedTask, Builder, DynError, Expectation, Metrics, NodeClients, RunContext, Runner,
        Scenario, ScenarioError, Workload, spawn_block_feed_with_interval,
    },
    topology::{
        GeneratedTopology, TopologyBuilder, TopologyConfig,
        configs::consensus::ConsensusParams,
        readiness::{ReadinessError, wait_da_membership_ready, wait_network_ready},
    },
};
use tokio::time::sleep;

const STUB_SLOT: Duration = Duration::from_millis(50);

fn fast_builder(validators: usize, executors: usize, duration: Duration) -> Builder<()> {
    Builder::<()>::with_node_counts(validators, executors)
        .map_topology(|topology| {
            topology.with_consensus_params(
                ConsensusParams::default()
                    .with_slot_duration(STUB_SLOT)
                    .with_active_slot_coeff(0.9),
            )
        })
        .with_run_duration(duration)
}

fn stub_descriptors(validators: usize) -> GeneratedTopology {
    TopologyBuilder::new(TopologyConfig::with_node_numbers(validators, 0))
        .with_consensus_params(
            ConsensusParams::default()
                .with_slot_duration(STUB_SLOT)
                .with_active_slot_coeff(0.9),
        )
        .build()
        .unwrap()
}

/// Context wired against the stub cluster: real HTTP clients and a block
/// feed sampling one of the stub validators.
async fn cluster_runner(
    scenario: &Scenario<()>,
    cleanups: &Arc<AtomicUsize>,
) -> (Runner, BlockFeedTask) {
    let descriptors = scenario.topology().clone();
    let node_clients = NodeClients::from_topology(&descriptors);
    let source = node_clients
        .random_validator()
        .cloned()
        .expect("cluster has at least one validator");
    let (block_feed, feed_task) = spawn_block_feed_with_interval(source, Duration::from_millis(25))
        .await
        .expect("stub cluster serves consensus info");

    let context = RunContext::new(
        descriptors,
        node_clients,
        scenario.duration(),
        Metrics::empty(),
        block_feed,
        None,
    );
    let runner = Runner::new(
        context,
        Some(Box::new(CountingGuard::new(Arc::clone(cleanups)))),
    );
    (runner, feed_task)
}

struct SubmitTransactions {
    count: u64,
}

#[async_trait]
impl Workload for SubmitTransactions {
    fn name(&self) -> &str {
        "submit transactions"
    }

    async fn start(&self, ctx: &RunContext) -> Result<(), DynError> {
        for nonce in 0..self.count {
            let request = TransactionRequest {
                sender: format!("sender-{nonce}"),
                nonce,
                amount: 1,
            };
            ctx.cluster_client()
                .try_all_clients(|client| {
                    let request = request.clone();
                    Box::pin(async move { client.submit_transaction(&request).await })
                })
                .await?;
            sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }
}

/// Requires the block feed to have advanced a minimum number of blocks
/// between capture and evaluation.
struct FeedProgress {
    required_delta: u64,
    baseline: u64,
}

impl FeedProgress {
    const fn requiring(required_delta: u64) -> Self {
        Self {
            required_delta,
            baseline: 0,
        }
    }
}

#[async_trait]
impl Expectation for FeedProgress {
    fn name(&self) -> &str {
        "chain progress"
    }

    async fn start_capture(&mut self, ctx: &RunContext) -> Result<(), DynError> {
        self.baseline = ctx.block_feed().latest().height;
        Ok(())
    }

    async fn evaluate(&mut self, ctx: &RunContext) -> Result<(), DynError> {
        let observed = ctx.block_feed().latest().height;
        let gained = observed.saturating_sub(self.baseline);
        if gained < self.required_delta {
            return Err(format!(
                "chain advanced {gained} blocks since capture, required {}",
                self.required_delta
            )
            .into());
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn block_feed_tracks_a_live_stub_cluster() {
    let descriptors = stub_descriptors(2);
    let _nodes = spawn_stub_cluster(&descriptors, Duration::from_millis(30)).await;

    let clients = NodeClients::from_topology(&descriptors);
    let source = clients.random_validator().cloned().unwrap();
    let (feed, mut feed_task) = spawn_block_feed_with_interval(source, Duration::from_millis(20))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut previous = feed.latest().height;
    while feed.latest().height < 3 {
        assert!(Instant::now() < deadline, "feed never reached height 3");
        let current = feed.latest().height;
        assert!(
            current >= previous,
            "height regressed from {previous} to {current}"
        );
        previous = current;
        sleep(Duration::from_millis(10)).await;
    }

    feed_task.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn healthy_cluster_passes_a_full_scenario() {
    init_tracing();
    let cleanups = Arc::new(AtomicUsize::new(0));
    let mut scenario = fast_builder(2, 0, Duration::from_millis(400))
        .with_workload(SubmitTransactions { count: 3 })
        .with_expectation(FeedProgress::requiring(2))
        .build()
        .unwrap();

    let nodes = spawn_stub_cluster(scenario.topology(), STUB_SLOT).await;
    let (runner, mut feed_task) = cluster_runner(&scenario, &cleanups).await;

    let handle = runner
        .run(&mut scenario)
        .await
        .expect("healthy cluster passes");

    let accepted: u64 = nodes
        .iter()
        .map(|node| node.state().accepted_transactions())
        .sum();
    assert_eq!(accepted, 3);

    drop(handle);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    feed_task.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frozen_cluster_fails_the_progress_expectation() {
    init_tracing();
    let cleanups = Arc::new(AtomicUsize::new(0));
    let mut scenario = fast_builder(2, 0, Duration::from_millis(300))
        .with_expectation(FeedProgress::requiring(2))
        .build()
        .unwrap();

    let nodes = spawn_stub_cluster(scenario.topology(), STUB_SLOT).await;
    for node in &nodes {
        node.state().freeze();
    }

    let (runner, mut feed_task) = cluster_runner(&scenario, &cleanups).await;
    let error = runner.run(&mut scenario).await.unwrap_err();

    let ScenarioError::Failed { report } = error else {
        panic!("expected an expectation failure, got {error}");
    };
    assert!(report.workloads().is_empty());
    assert_eq!(report.expectations().len(), 1);
    assert_eq!(report.expectations()[0].name(), "chain progress");
    assert!(
        report.expectations()[0]
            .message()
            .contains("advanced 0 blocks"),
        "message: {}",
        report.expectations()[0].message()
    );

    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    feed_task.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn six_node_traffic_run_succeeds_without_a_liveness_expectation() {
    init_tracing();
    let cleanups = Arc::new(AtomicUsize::new(0));
    let mut scenario = fast_builder(4, 2, Duration::from_millis(600))
        .with_workload(SubmitTransactions { count: 10 })
        .build()
        .unwrap();

    let nodes = spawn_stub_cluster(scenario.topology(), STUB_SLOT).await;
    // Freeze every node so the verdict cannot hinge on chain progression.
    for node in &nodes {
        node.state().freeze();
    }

    let (runner, mut feed_task) = cluster_runner(&scenario, &cleanups).await;
    let handle = runner
        .run(&mut scenario)
        .await
        .expect("traffic-only scenario passes on a frozen cluster");

    let accepted: u64 = nodes
        .iter()
        .map(|node| node.state().accepted_transactions())
        .sum();
    assert_eq!(accepted, 10);

    drop(handle);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    feed_task.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readiness_checks_pass_against_a_stub_cluster() {
    let descriptors = stub_descriptors(2);
    let nodes = spawn_stub_cluster(&descriptors, STUB_SLOT).await;
    // Full mesh of two nodes: each sees one peer.
    for node in &nodes {
        node.state().set_peer_count(1);
    }

    let clients = NodeClients::from_topology(&descriptors);
    wait_network_ready(&descriptors, &clients, Duration::from_secs(5))
        .await
        .expect("peer counts satisfied");
    wait_da_membership_ready(&descriptors, &clients, Duration::from_secs(5))
        .await
        .expect("membership populated");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readiness_timeout_names_lagging_nodes() {
    let descriptors = stub_descriptors(2);
    let nodes = spawn_stub_cluster(&descriptors, STUB_SLOT).await;
    // Only the first node reaches its expected peer count.
    nodes[0].state().set_peer_count(1);

    let clients = NodeClients::from_topology(&descriptors);
    let error = wait_network_ready(&descriptors, &clients, Duration::from_millis(400))
        .await
        .unwrap_err();

    let ReadinessError::NetworkTimeout { pending, .. } = error else {
        panic!("expected a network timeout, got {error}");
    };
    assert!(
        pending.contains("validator-1"),
        "pending summary should name the lagging node: {pending}"
    );
    assert!(
        pending.contains("expected=1"),
        "pending summary should state the expectation: {pending}"
    );
}
