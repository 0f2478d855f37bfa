use std::fmt;

use async_trait::async_trait;

use crate::topology::NodeRole;

/// Marker type used by scenario builders to request node control support.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeControlCapability;

/// Trait implemented by scenario capability markers to signal whether node
/// control is required.
pub trait RequiresNodeControl {
    const REQUIRED: bool;
}

impl RequiresNodeControl for () {
    const REQUIRED: bool = false;
}

impl RequiresNodeControl for NodeControlCapability {
    const REQUIRED: bool = true;
}

/// Runtime interventions a backend may support on individual nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlOperation {
    Restart,
    Pause,
    Resume,
}

impl ControlOperation {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }
}

impl fmt::Display for ControlOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeControlError {
    #[error("backend {backend} does not support {operation}")]
    NotSupported {
        backend: &'static str,
        operation: ControlOperation,
    },
    #[error("no {role} with index {index} in the deployed topology")]
    UnknownNode { role: NodeRole, index: usize },
    #[error("{operation} of {role}-{index} failed: {reason}")]
    Failed {
        operation: ControlOperation,
        role: NodeRole,
        index: usize,
        reason: String,
    },
}

/// Interface exposed by runners that can intervene on nodes at runtime.
///
/// Implementations serialize concurrent operations against the same node
/// index; requests for distinct nodes may proceed in parallel.
#[async_trait]
pub trait NodeControlHandle: Send + Sync {
    /// Name of the backing deployment, used in error reports.
    fn backend(&self) -> &'static str;

    async fn restart(&self, role: NodeRole, index: usize) -> Result<(), NodeControlError>;

    async fn pause(&self, _role: NodeRole, _index: usize) -> Result<(), NodeControlError> {
        Err(NodeControlError::NotSupported {
            backend: self.backend(),
            operation: ControlOperation::Pause,
        })
    }

    async fn resume(&self, _role: NodeRole, _index: usize) -> Result<(), NodeControlError> {
        Err(NodeControlError::NotSupported {
            backend: self.backend(),
            operation: ControlOperation::Resume,
        })
    }
}
