use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

/// Per-process scratch directory for generated Dockerfiles, staged volume
/// content and materialized credential files. Created once and passed to
/// the components that need it, never reached through a global.
#[derive(Debug)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(parent: &Path) -> Result<Self> {
        let root = parent.join(format!("abox-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root)?;
        debug!("Staging area created at {}", root.display());
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// A fresh uniquely-named subdirectory, e.g. one per image build.
    pub fn unique_subdir(&self, prefix: &str) -> Result<PathBuf> {
        let dir = self.root.join(format!("{prefix}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn write_file(&self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            debug!("Staging cleanup skipped for {}: {}", self.root.display(), e);
        }
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_cleans_root() {
        let parent = tempfile::tempdir().unwrap();
        let root = {
            let staging = StagingArea::new(parent.path()).unwrap();
            let file = staging.write_file("Dockerfile", b"FROM alpine\n").unwrap();
            assert!(file.exists());
            staging.path().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[test]
    fn unique_subdirs_do_not_collide() {
        let parent = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(parent.path()).unwrap();
        let a = staging.unique_subdir("build").unwrap();
        let b = staging.unique_subdir("build").unwrap();
        assert_ne!(a, b);
        assert!(a.exists() && b.exists());
    }
}
