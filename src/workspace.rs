//! Per-job scratch directories for phase workers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use baton_common::Stage;
use tracing::{debug, warn};
use uuid::Uuid;

/// A scratch directory removed on [`Workspace::cleanup`], or on drop if the
/// worker never got that far.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    cleaned: bool,
}

impl Workspace {
    pub fn create(root: &Path, run_id: Uuid, stage: Stage, attempt: u32) -> Result<Self> {
        let path = root.join(format!("{}-{}-{}", run_id.simple(), stage, attempt));
        if path.exists() {
            // Leftover from a crashed delivery of the same attempt.
            std::fs::remove_dir_all(&path).with_context(|| {
                format!("Failed to clear stale workspace {}", path.display())
            })?;
        }
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create workspace {}", path.display()))?;
        debug!(path = %path.display(), "workspace created");
        Ok(Self {
            path,
            cleaned: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cleanup(mut self) -> Result<()> {
        self.cleaned = true;
        std::fs::remove_dir_all(&self.path)
            .with_context(|| format!("Failed to remove workspace {}", self.path.display()))
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.cleaned
            && let Err(e) = std::fs::remove_dir_all(&self.path)
        {
            warn!("Failed to remove workspace {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(root.path(), Uuid::new_v4(), Stage::Review, 1).unwrap();
        let path = ws.path().to_path_buf();
        assert!(path.is_dir());
        ws.cleanup().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let ws = Workspace::create(root.path(), Uuid::new_v4(), Stage::Ops, 2).unwrap();
            std::fs::write(ws.path().join("scratch.txt"), "x").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_directory_is_replaced() {
        let root = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let stale = root.path().join(format!("{}-dev-1", id.simple()));
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("old.txt"), "old").unwrap();

        let ws = Workspace::create(root.path(), id, Stage::Dev, 1).unwrap();
        assert_eq!(ws.path(), stale.as_path());
        assert!(!stale.join("old.txt").exists());
    }
}
