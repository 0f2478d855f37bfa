use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    process::{self, Child, Stdio},
    time::Duration,
};

use parking_lot::Mutex;
use testbed_core::{
    adjust_timeout,
    scenario::http_probe,
    topology::{GeneratedTopology, NodeRole},
};
use tokio::process::Command;
use tracing::warn;

pub(crate) const CONFIG_FILE: &str = "config.yaml";
pub(crate) const STDOUT_LOG: &str = "stdout.log";
pub(crate) const STDERR_LOG: &str = "stderr.log";

const RESTART_READY_TIMEOUT: Duration = Duration::from_secs(30);
const RESTART_POLL_INTERVAL: Duration = Duration::from_millis(250);
const LOG_TAIL_LINES: usize = 120;

const LOOPBACK_HOST: &str = "127.0.0.1";

/// Filesystem layout and spawn parameters for a single node process.
pub(crate) struct NodeLaunch {
    label: String,
    role: NodeRole,
    api_port: u16,
    dir: PathBuf,
    config_path: PathBuf,
}

impl NodeLaunch {
    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    #[cfg(test)]
    pub(crate) const fn config_path(&self) -> &PathBuf {
        &self.config_path
    }
}

/// One spawned node process.
///
/// The child handle sits behind a synchronous lock so the cleanup guard can
/// kill every process without entering an async context, while the gate
/// serializes restart and signal operations per node.
pub(crate) struct NodeSlot {
    launch: NodeLaunch,
    child: Mutex<Option<Child>>,
    gate: tokio::sync::Mutex<()>,
}

impl NodeSlot {
    fn new(launch: NodeLaunch, child: Child) -> Self {
        Self {
            launch,
            child: Mutex::new(Some(child)),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    fn kill(&self) {
        let Some(mut child) = self.child.lock().take() else {
            return;
        };
        if let Err(err) = child.kill() {
            warn!(node = %self.launch.label, "failed to kill node process: {err}");
        }
        let _ = child.wait();
    }
}

/// Owns every spawned node process for one deployment.
pub(crate) struct ProcessSupervisor {
    binary: PathBuf,
    slots: Vec<NodeSlot>,
}

impl ProcessSupervisor {
    pub(crate) const fn new(binary: PathBuf, slots: Vec<NodeSlot>) -> Self {
        Self { binary, slots }
    }

    pub(crate) fn node_count(&self) -> usize {
        self.slots.len()
    }

    /// Kills every node process that is still running. Safe to call more
    /// than once.
    pub(crate) fn kill_all(&self) {
        for slot in &self.slots {
            slot.kill();
        }
    }

    /// Prints the tail of every node log to stderr for post-mortem
    /// inspection.
    pub(crate) fn dump_logs(&self) {
        for slot in &self.slots {
            for (stream, file) in [("stdout", STDOUT_LOG), ("stderr", STDERR_LOG)] {
                let tail = tail_lines(&slot.launch.dir.join(file), LOG_TAIL_LINES);
                if !tail.is_empty() {
                    eprintln!("[local-runner] {} {stream} tail:\n{tail}", slot.launch.label);
                }
            }
        }
    }

    /// Kills and respawns one node, then waits for its HTTP endpoint to
    /// answer again.
    pub(crate) async fn restart_slot(&self, flat: usize) -> Result<(), SupervisorError> {
        let slot = self
            .slots
            .get(flat)
            .ok_or(SupervisorError::UnknownSlot { flat })?;
        let _gate = slot.gate.lock().await;

        slot.kill();
        let child = spawn_node(&self.binary, &slot.launch)
            .map_err(|source| SupervisorError::Respawn { source })?;
        *slot.child.lock() = Some(child);

        http_probe::wait_for_http_ports(
            &[slot.launch.api_port],
            slot.launch.role,
            adjust_timeout(RESTART_READY_TIMEOUT),
            RESTART_POLL_INTERVAL,
        )
        .await
        .map_err(|source| SupervisorError::Probe { source })
    }

    /// Sends a signal to one node process through the `kill` binary.
    pub(crate) async fn signal_slot(&self, flat: usize, signal: &str) -> Result<(), SupervisorError> {
        let slot = self
            .slots
            .get(flat)
            .ok_or(SupervisorError::UnknownSlot { flat })?;
        let _gate = slot.gate.lock().await;

        let pid = slot
            .child
            .lock()
            .as_ref()
            .map(Child::id)
            .ok_or(SupervisorError::NotRunning)?;
        let status = Command::new("kill")
            .arg(signal)
            .arg(pid.to_string())
            .status()
            .await
            .map_err(|source| SupervisorError::Signal { source })?;
        if status.success() {
            Ok(())
        } else {
            Err(SupervisorError::SignalFailed { status })
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SupervisorError {
    #[error("no process slot for node index {flat}")]
    UnknownSlot { flat: usize },
    #[error("failed to respawn node process: {source}")]
    Respawn {
        #[source]
        source: ProvisionError,
    },
    #[error("node did not answer its health endpoint after restart: {source}")]
    Probe {
        #[source]
        source: http_probe::HttpReadinessError,
    },
    #[error("node process is not running")]
    NotRunning,
    #[error("failed to invoke kill: {source}")]
    Signal {
        #[source]
        source: io::Error,
    },
    #[error("kill exited with {status}")]
    SignalFailed { status: process::ExitStatus },
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to create local workspace: {source}")]
    Workspace {
        #[source]
        source: io::Error,
    },
    #[error("failed to create node directory {path}: {source}")]
    NodeDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize node config for {label}: {source}")]
    ConfigSerialize {
        label: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to write node config {path}: {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn {label} from {}: {source}", binary.display())]
    Spawn {
        label: String,
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Lays out one directory per node under `root` and writes the node config
/// files. Peers are addressed over loopback since every process shares the
/// host network namespace.
pub(crate) fn prepare_launches(
    descriptors: &GeneratedTopology,
    root: &Path,
) -> Result<Vec<NodeLaunch>, ProvisionError> {
    let mut launches = Vec::with_capacity(descriptors.node_count());
    for (flat, node) in descriptors.nodes().enumerate() {
        let dir = root.join(node.label());
        fs::create_dir_all(&dir).map_err(|source| ProvisionError::NodeDir {
            path: dir.clone(),
            source,
        })?;

        let config = descriptors
            .node_config_file(flat, |_| LOOPBACK_HOST.to_owned())
            .expect("flat index enumerates the generated topology");
        let rendered =
            serde_yaml::to_string(&config).map_err(|source| ProvisionError::ConfigSerialize {
                label: node.label(),
                source,
            })?;
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, rendered).map_err(|source| ProvisionError::ConfigWrite {
            path: config_path.clone(),
            source,
        })?;

        launches.push(NodeLaunch {
            label: node.label(),
            role: node.role(),
            api_port: node.api_port(),
            dir,
            config_path,
        });
    }
    Ok(launches)
}

/// Spawns every prepared node. If one spawn fails, processes started so far
/// are killed before the error is surfaced.
pub(crate) fn spawn_all(
    binary: &Path,
    launches: Vec<NodeLaunch>,
) -> Result<Vec<NodeSlot>, ProvisionError> {
    let mut slots = Vec::with_capacity(launches.len());
    for launch in launches {
        match spawn_node(binary, &launch) {
            Ok(child) => slots.push(NodeSlot::new(launch, child)),
            Err(err) => {
                for slot in &slots {
                    slot.kill();
                }
                return Err(err);
            }
        }
    }
    Ok(slots)
}

fn spawn_node(binary: &Path, launch: &NodeLaunch) -> Result<Child, ProvisionError> {
    let stdout = open_log(&launch.dir.join(STDOUT_LOG))?;
    let stderr = open_log(&launch.dir.join(STDERR_LOG))?;
    process::Command::new(binary)
        .arg(&launch.config_path)
        .current_dir(&launch.dir)
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .map_err(|source| ProvisionError::Spawn {
            label: launch.label.clone(),
            binary: binary.to_path_buf(),
            source,
        })
}

fn open_log(path: &Path) -> Result<File, ProvisionError> {
    File::options()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| ProvisionError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

fn tail_lines(path: &Path, max_lines: usize) -> String {
    let Ok(contents) = fs::read_to_string(path) else {
        return String::new();
    };
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
