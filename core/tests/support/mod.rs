#![allow(dead_code)]

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use testbed_core::{
    scenario::{
        BlockFeedTask, BlockSnapshot, BlockSource, CleanupGuard, DynError, Metrics, NodeClients,
        NodeControlHandle, RunContext, Runner, Scenario, spawn_block_feed_with_interval,
    },
    topology::GeneratedTopology,
};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

/// Installs a fmt subscriber so `RUST_LOG` exposes runner traces. Safe to
/// call from every test; only the first installation wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Block source whose height advances by one on every poll.
#[derive(Default)]
pub struct CountingBlockSource {
    height: AtomicU64,
}

#[async_trait]
impl BlockSource for CountingBlockSource {
    async fn latest_block(&self) -> Result<BlockSnapshot, DynError> {
        let height = self.height.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(BlockSnapshot {
            height,
            slot: height,
            block_id: format!("block-{height}"),
            observed_at: Instant::now(),
        })
    }
}

/// Cleanup guard that counts how many times it fired.
pub struct CountingGuard {
    fired: Arc<AtomicUsize>,
}

impl CountingGuard {
    pub fn new(fired: Arc<AtomicUsize>) -> Self {
        Self { fired }
    }
}

impl CleanupGuard for CountingGuard {
    fn cleanup(self: Box<Self>) {
        self.fired.fetch_add(1, Ordering::SeqCst);
    }
}

/// Shared ordered record of observed lifecycle events.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn record(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Builds a runner over stub infrastructure: node clients point at the
/// generated ports, the block feed samples a scripted source, and cleanup
/// increments `cleanups` instead of tearing anything down.
pub async fn stub_runner<Caps>(
    scenario: &Scenario<Caps>,
    cleanups: &Arc<AtomicUsize>,
    node_control: Option<Arc<dyn NodeControlHandle>>,
) -> (Runner, BlockFeedTask) {
    let descriptors = scenario.topology().clone();
    let node_clients = NodeClients::from_topology(&descriptors);
    let (block_feed, feed_task) =
        spawn_block_feed_with_interval(CountingBlockSource::default(), Duration::from_millis(50))
            .await
            .expect("counting block source never fails");

    let context = RunContext::new(
        descriptors,
        node_clients,
        scenario.duration(),
        Metrics::empty(),
        block_feed,
        node_control,
    );

    let runner = Runner::new(
        context,
        Some(Box::new(CountingGuard::new(Arc::clone(cleanups)))),
    );
    (runner, feed_task)
}

/// Minimal HTTP stand-in for a ledger node: health, consensus, network,
/// membership, and mempool endpoints backed by shared in-memory state.
pub struct StubNode {
    state: Arc<StubNodeState>,
    accept_task: JoinHandle<()>,
}

pub struct StubNodeState {
    name: String,
    slot_duration: Duration,
    started: Instant,
    frozen: AtomicBool,
    frozen_height: AtomicU64,
    peer_count: AtomicU64,
    reject_transactions: AtomicBool,
    accepted_transactions: AtomicU64,
}

impl StubNodeState {
    fn height(&self) -> u64 {
        if self.frozen.load(Ordering::SeqCst) {
            return self.frozen_height.load(Ordering::SeqCst);
        }
        let slot_millis = self.slot_duration.as_millis().max(1);
        (self.started.elapsed().as_millis() / slot_millis) as u64
    }

    /// Pins the reported height at its current value.
    pub fn freeze(&self) {
        self.frozen_height.store(self.height(), Ordering::SeqCst);
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn set_peer_count(&self, count: u64) {
        self.peer_count.store(count, Ordering::SeqCst);
    }

    pub fn reject_transactions(&self) {
        self.reject_transactions.store(true, Ordering::SeqCst);
    }

    pub fn accepted_transactions(&self) -> u64 {
        self.accepted_transactions.load(Ordering::SeqCst)
    }

    fn respond(&self, method: &str, path: &str) -> String {
        match (method, path) {
            ("GET", "/health") => http_response("200 OK", ""),
            ("GET", "/consensus/info") => {
                let height = self.height();
                http_response(
                    "200 OK",
                    &format!(r#"{{"slot":{height},"height":{height},"tip":"block-{height}"}}"#),
                )
            }
            ("GET", "/network/info") => http_response(
                "200 OK",
                &format!(
                    r#"{{"peer_id":"{}","peer_count":{},"listen_addresses":[]}}"#,
                    self.name,
                    self.peer_count.load(Ordering::SeqCst),
                ),
            ),
            ("GET", "/da/membership") => http_response(
                "200 OK",
                &format!(r#"{{"session":0,"assignations":{{"0":["{}"]}}}}"#, self.name),
            ),
            ("POST", "/mempool/transaction") => {
                if self.reject_transactions.load(Ordering::SeqCst) {
                    http_response("409 Conflict", r#"{"error":"mempool full"}"#)
                } else {
                    self.accepted_transactions.fetch_add(1, Ordering::SeqCst);
                    http_response("200 OK", "{}")
                }
            }
            _ => http_response("404 Not Found", ""),
        }
    }
}

impl StubNode {
    pub async fn spawn(
        addr: SocketAddr,
        name: impl Into<String>,
        slot_duration: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let state = Arc::new(StubNodeState {
            name: name.into(),
            slot_duration,
            started: Instant::now(),
            frozen: AtomicBool::new(false),
            frozen_height: AtomicU64::new(0),
            peer_count: AtomicU64::new(0),
            reject_transactions: AtomicBool::new(false),
            accepted_transactions: AtomicU64::new(0),
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let connection_state = Arc::clone(&accept_state);
                tokio::spawn(handle_connection(stream, connection_state));
            }
        });

        Ok(Self { state, accept_task })
    }

    pub fn state(&self) -> &Arc<StubNodeState> {
        &self.state
    }
}

impl Drop for StubNode {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Spawns one stub node per descriptor, bound to the generated API ports.
pub async fn spawn_stub_cluster(
    descriptors: &GeneratedTopology,
    slot_duration: Duration,
) -> Vec<StubNode> {
    let mut nodes = Vec::with_capacity(descriptors.node_count());
    for descriptor in descriptors.nodes() {
        let addr = SocketAddr::from(([127, 0, 0, 1], descriptor.api_port()));
        let node = StubNode::spawn(addr, descriptor.label(), slot_duration)
            .await
            .expect("stub node binds its generated port");
        nodes.push(node);
    }
    nodes
}

async fn handle_connection(mut stream: TcpStream, state: Arc<StubNodeState>) {
    let Some((method, path)) = read_request(&mut stream).await else {
        return;
    };
    let response = state.respond(&method, &path);
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Reads one request, draining any content-length body, and returns the
/// method and path.
async fn read_request(stream: &mut TcpStream) -> Option<(String, String)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0_u8; 1024];
    loop {
        if let Some(headers_end) = find_subslice(&buf, b"\r\n\r\n") {
            let header_text = String::from_utf8_lossy(&buf[..headers_end]).into_owned();
            let request_line = header_text.lines().next()?;
            let mut parts = request_line.split_whitespace();
            let method = parts.next()?.to_owned();
            let path = parts.next()?.to_owned();

            let body_len = content_length(&header_text).unwrap_or(0);
            let mut remaining = (headers_end + 4 + body_len).saturating_sub(buf.len());
            while remaining > 0 {
                let read = stream.read(&mut chunk).await.ok()?;
                if read == 0 {
                    break;
                }
                remaining = remaining.saturating_sub(read);
            }
            return Some((method, path));
        }

        let read = stream.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..read]);
    }
}

fn content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn http_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    )
}
