use std::path::PathBuf;

use testbed_core::scenario::CleanupGuard;
use tracing::warn;

use crate::{compose::compose_down, workspace::ComposeWorkspace};

/// Releases the compose stack: brings the project down with its volumes,
/// then removes the temporary workspace. Dropping the workspace last keeps
/// the compose file available for the down command.
pub(crate) struct RunnerCleanup {
    compose_path: PathBuf,
    project_name: String,
    root: PathBuf,
    workspace: Option<ComposeWorkspace>,
}

impl RunnerCleanup {
    pub(crate) const fn new(
        compose_path: PathBuf,
        project_name: String,
        root: PathBuf,
        workspace: Option<ComposeWorkspace>,
    ) -> Self {
        Self {
            compose_path,
            project_name,
            root,
            workspace,
        }
    }
}

impl CleanupGuard for RunnerCleanup {
    fn cleanup(mut self: Box<Self>) {
        if let Err(err) = compose_down(&self.compose_path, &self.project_name, &self.root) {
            warn!(project = %self.project_name, "docker compose down failed: {err}");
        }
        drop(self.workspace.take());
    }
}
