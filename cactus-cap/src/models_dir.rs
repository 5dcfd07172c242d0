use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// The per-installation directory holding downloaded model assets.
///
/// Layout inside `<root>/<slug>` belongs to the capability; the bridge only
/// checks that a model directory exists and is non-empty.
#[derive(Debug, Clone)]
pub struct ModelsDirectory {
    root: PathBuf,
}

impl ModelsDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory if it is missing.
    pub fn ensure(&self) -> Result<()> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root).with_context(|| {
                format!("failed to create models directory {}", self.root.display())
            })?;
            debug!(path = %self.root.display(), "created models directory");
        }
        Ok(())
    }

    pub fn model_path(&self, slug: &str) -> PathBuf {
        self.root.join(slug)
    }

    pub fn has_model(&self, slug: &str) -> bool {
        is_non_empty_dir(&self.model_path(slug))
    }
}

fn is_non_empty_dir(path: &Path) -> bool {
    path.is_dir()
        && fs::read_dir(path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
}
