use std::{
    thread,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{
    runtime::Handle,
    sync::{oneshot, watch},
    task::{JoinError, JoinHandle},
    time::{MissedTickBehavior, error::Elapsed, interval, sleep, timeout},
};
use tracing::{debug, warn};

use crate::{
    nodes::ApiClient,
    scenario::{CleanupGuard, DynError},
};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

const INITIAL_FETCH_ATTEMPTS: usize = 10;
const INITIAL_FETCH_DELAY: Duration = Duration::from_millis(500);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Point-in-time view of a node's chain tip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockSnapshot {
    pub height: u64,
    pub slot: u64,
    pub block_id: String,
    pub observed_at: Instant,
}

/// Source polled by the block feed for tip snapshots.
#[async_trait]
pub trait BlockSource: Send + Sync + 'static {
    async fn latest_block(&self) -> Result<BlockSnapshot, DynError>;
}

#[async_trait]
impl BlockSource for ApiClient {
    async fn latest_block(&self) -> Result<BlockSnapshot, DynError> {
        let info = self.consensus_info().await?;
        Ok(BlockSnapshot {
            height: info.height,
            slot: info.slot,
            block_id: info.tip,
            observed_at: Instant::now(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BlockFeedError {
    #[error("block feed could not fetch an initial snapshot: {reason}")]
    InitialSnapshot { reason: String },
}

/// Shared read handle over the latest observed block.
///
/// Reads never block on the sampler, and heights never go backwards within a
/// run: samples that regress (a node restarting, a lagging replica answering
/// the poll) are skipped by the publisher. No history is retained.
#[derive(Clone)]
pub struct BlockFeed {
    latest: watch::Receiver<BlockSnapshot>,
}

impl BlockFeed {
    #[must_use]
    pub fn latest(&self) -> BlockSnapshot {
        self.latest.borrow().clone()
    }
}

/// Owns the sampling task. [`BlockFeedTask::shutdown`] signals it to stop
/// and waits for it to finish; merely dropping the task signals stop without
/// waiting.
pub struct BlockFeedTask {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BlockFeedTask {
    pub fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let Some(handle) = self.handle.take() else {
            return;
        };
        if Handle::try_current().is_ok() {
            Self::spawn_wait_thread(handle);
        } else {
            Self::blocking_wait(handle);
        }
    }

    fn blocking_wait(handle: JoinHandle<()>) {
        match tokio::runtime::Runtime::new() {
            Ok(rt) => Self::report_join(rt.block_on(timeout(SHUTDOWN_TIMEOUT, handle))),
            Err(err) => warn!("unable to create block feed shutdown runtime: {err}"),
        }
    }

    fn spawn_wait_thread(handle: JoinHandle<()>) {
        match thread::Builder::new()
            .name("block-feed-shutdown".into())
            .spawn(move || Self::blocking_wait(handle))
        {
            Ok(joiner) => {
                if let Err(err) = joiner.join() {
                    warn!("block feed shutdown thread panicked: {err:?}");
                }
            }
            Err(err) => warn!("failed to spawn block feed shutdown thread: {err}"),
        }
    }

    fn report_join(result: Result<Result<(), JoinError>, Elapsed>) {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_cancelled() => {}
            Ok(Err(err)) => warn!("block feed task ended abnormally: {err}"),
            Err(_) => warn!("block feed task did not stop within {SHUTDOWN_TIMEOUT:?}"),
        }
    }
}

impl CleanupGuard for BlockFeedTask {
    fn cleanup(mut self: Box<Self>) {
        self.shutdown();
    }
}

/// Starts sampling `source` at the default interval after fetching an
/// initial snapshot (bounded retries).
pub async fn spawn_block_feed<S>(source: S) -> Result<(BlockFeed, BlockFeedTask), BlockFeedError>
where
    S: BlockSource,
{
    spawn_block_feed_with_interval(source, DEFAULT_SAMPLE_INTERVAL).await
}

pub async fn spawn_block_feed_with_interval<S>(
    source: S,
    sample_interval: Duration,
) -> Result<(BlockFeed, BlockFeedTask), BlockFeedError>
where
    S: BlockSource,
{
    let initial = fetch_initial_snapshot(&source).await?;
    let (sender, receiver) = watch::channel(initial);
    let (stop_tx, stop_rx) = oneshot::channel();
    let handle = tokio::spawn(sample_loop(source, sender, stop_rx, sample_interval));
    Ok((
        BlockFeed { latest: receiver },
        BlockFeedTask {
            stop: Some(stop_tx),
            handle: Some(handle),
        },
    ))
}

async fn fetch_initial_snapshot<S>(source: &S) -> Result<BlockSnapshot, BlockFeedError>
where
    S: BlockSource,
{
    let mut last_reason = String::from("no attempt made");
    for _ in 0..INITIAL_FETCH_ATTEMPTS {
        match source.latest_block().await {
            Ok(snapshot) => return Ok(snapshot),
            Err(err) => last_reason = err.to_string(),
        }
        sleep(INITIAL_FETCH_DELAY).await;
    }
    Err(BlockFeedError::InitialSnapshot {
        reason: last_reason,
    })
}

async fn sample_loop<S>(
    source: S,
    sender: watch::Sender<BlockSnapshot>,
    mut stop: oneshot::Receiver<()>,
    sample_interval: Duration,
) where
    S: BlockSource,
{
    let mut ticker = interval(sample_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                match source.latest_block().await {
                    Ok(snapshot) => {
                        let current = sender.borrow().height;
                        if snapshot.height < current {
                            debug!(
                                current,
                                observed = snapshot.height,
                                "skipping regressing block sample"
                            );
                        } else if sender.send(snapshot).is_err() {
                            // all feed handles gone
                            break;
                        }
                    }
                    Err(err) => debug!(error = %err, "block sample failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, Ordering},
        },
    };

    use super::*;

    struct ScriptedSource {
        samples: Mutex<VecDeque<u64>>,
        last: Mutex<u64>,
        dropped: Arc<AtomicBool>,
    }

    impl ScriptedSource {
        fn new(heights: &[u64], dropped: Arc<AtomicBool>) -> Self {
            Self {
                samples: Mutex::new(heights.iter().copied().collect()),
                last: Mutex::new(0),
                dropped,
            }
        }
    }

    impl Drop for ScriptedSource {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BlockSource for ScriptedSource {
        async fn latest_block(&self) -> Result<BlockSnapshot, DynError> {
            let height = {
                let mut samples = self.samples.lock().unwrap();
                let mut last = self.last.lock().unwrap();
                if let Some(next) = samples.pop_front() {
                    *last = next;
                }
                *last
            };
            Ok(BlockSnapshot {
                height,
                slot: height,
                block_id: format!("block-{height}"),
                observed_at: Instant::now(),
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reads_are_monotonic_under_regressing_samples() {
        let dropped = Arc::new(AtomicBool::new(false));
        let source = ScriptedSource::new(&[3, 5, 2, 7], Arc::clone(&dropped));
        let (feed, mut task) = spawn_block_feed_with_interval(source, Duration::from_millis(10))
            .await
            .unwrap();

        let mut observed = vec![feed.latest().height];
        let deadline = Instant::now() + Duration::from_secs(5);
        while feed.latest().height < 7 {
            assert!(Instant::now() < deadline, "feed never reached height 7");
            observed.push(feed.latest().height);
            sleep(Duration::from_millis(5)).await;
        }
        observed.push(feed.latest().height);

        assert!(
            observed.windows(2).all(|pair| pair[0] <= pair[1]),
            "observed heights regressed: {observed:?}"
        );
        task.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_stops_the_sampling_task() {
        let dropped = Arc::new(AtomicBool::new(false));
        let source = ScriptedSource::new(&[1], Arc::clone(&dropped));
        let (_feed, task) = spawn_block_feed_with_interval(source, Duration::from_millis(10))
            .await
            .unwrap();

        Box::new(task).cleanup();
        assert!(dropped.load(Ordering::SeqCst), "sampler still running");
    }

    #[tokio::test(start_paused = true)]
    async fn initial_snapshot_failure_is_reported() {
        struct FailingSource;

        #[async_trait]
        impl BlockSource for FailingSource {
            async fn latest_block(&self) -> Result<BlockSnapshot, DynError> {
                Err("node unreachable".into())
            }
        }

        let result = spawn_block_feed_with_interval(FailingSource, Duration::from_millis(10)).await;
        let Err(BlockFeedError::InitialSnapshot { reason }) = result.map(|_| ()) else {
            panic!("expected initial snapshot failure");
        };
        assert!(reason.contains("node unreachable"));
    }
}
