//! Per-step screenshot evidence on the local filesystem.

use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Writes screenshots as `<root>/<run_id>/step-<n>.png`.
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    root: PathBuf,
}

impl EvidenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn step_path(&self, run_id: Uuid, step: usize) -> PathBuf {
        self.root.join(run_id.to_string()).join(format!("step-{step}.png"))
    }

    /// Persist a screenshot and return the reference stored on the step.
    pub async fn save_step(
        &self,
        run_id: Uuid,
        step: usize,
        png: &[u8],
    ) -> std::io::Result<String> {
        let path = self.step_path(run_id, step);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, png).await?;
        tracing::debug!(%run_id, step, path = %path.display(), bytes = png.len(), "evidence saved");
        Ok(path.display().to_string())
    }
}
