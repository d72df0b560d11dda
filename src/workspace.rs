//! Disposable per-task workspaces for isolated execution.
//!
//! When a plan enables isolation, each task acquires an exclusive
//! workspace directory before execution. Release is guaranteed on every
//! exit path (success, failure, or cancellation) because the
//! [`IsolatedWorkspace`] guard removes its directory on drop; there is
//! no manual cleanup to forget.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::FleetError;

/// Creates exclusive, disposable workspace directories under a root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Acquire an exclusive workspace for one task.
    ///
    /// The directory name embeds the task ID plus a fresh nonce, so
    /// re-runs of the same task never collide with a directory that is
    /// still being torn down.
    pub fn acquire(&self, task_id: Uuid) -> Result<IsolatedWorkspace, FleetError> {
        let path = self
            .root
            .join(format!("task-{}-{}", task_id, Uuid::new_v4().simple()));
        std::fs::create_dir_all(&path).map_err(|e| FleetError::Structural {
            reason: format!("cannot create workspace {}: {}", path.display(), e),
        })?;
        tracing::debug!(task_id = %task_id, path = %path.display(), "Workspace acquired");
        Ok(IsolatedWorkspace { task_id, path })
    }
}

/// An exclusive working area granted to one task.
///
/// Removed recursively when dropped.
#[derive(Debug)]
pub struct IsolatedWorkspace {
    task_id: Uuid,
    path: PathBuf,
}

impl IsolatedWorkspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    task_id = %self.task_id,
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove isolated workspace"
                );
            }
        } else {
            tracing::debug!(task_id = %self.task_id, path = %self.path.display(), "Workspace released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_and_drop_removes() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let task_id = Uuid::new_v4();

        let path = {
            let ws = manager.acquire(task_id).unwrap();
            assert!(ws.path().is_dir());
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn workspaces_are_exclusive_per_acquisition() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let task_id = Uuid::new_v4();
        let a = manager.acquire(task_id).unwrap();
        let b = manager.acquire(task_id).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn release_happens_on_failure_paths_too() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());

        let failing = || -> Result<(), &'static str> {
            let ws = manager.acquire(Uuid::new_v4()).unwrap();
            std::fs::write(ws.path().join("partial.out"), b"half-written").unwrap();
            Err("task failed")
        };
        assert!(failing().is_err());
        // Guard dropped on the error path; nothing left under the root.
        let leftovers: Vec<_> = std::fs::read_dir(root.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}
