//! On-disk layout for staged shots and the reconstructed model.
//!
//! The pipeline owns two locations under a single root: the `Scans/`
//! staging directory the capture engine writes into, and the model output
//! path the reconstruction engine produces. Mode-reset clears the staging
//! directory before a fresh session is acquired, so two activations never
//! share staged images.

use std::path::{Path, PathBuf};
use tracing::debug;

/// Staging subdirectory for captured shots.
const SCANS_DIR_NAME: &str = "Scans";

/// Fixed model output file name (unique naming appends a UUID instead).
const MODEL_FILE_NAME: &str = "model.usdz";

/// File store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to clear directory {path}: {source}")]
    Clear {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Directory and path provider for the pipeline.
pub trait FileStore: Send + Sync + 'static {
    /// Root documents directory the pipeline works under.
    fn documents_dir(&self) -> PathBuf;

    /// Staging directory for captured shots.
    fn scans_dir(&self) -> PathBuf;

    /// Output path for the next reconstructed model.
    fn model_output_path(&self) -> PathBuf;

    /// Remove a directory's contents and recreate it empty.
    fn clear_dir(&self, dir: &Path) -> Result<(), StoreError>;
}

/// Plain-filesystem store rooted at a documents directory.
pub struct DiskStore {
    root: PathBuf,
    unique_model_names: bool,
}

impl DiskStore {
    /// Create a store rooted at `root`.
    ///
    /// With `unique_model_names` each call to [`FileStore::model_output_path`]
    /// yields a fresh `model-<uuid>.usdz`; otherwise the fixed name is
    /// reused and overwritten by successive reconstructions.
    pub fn new(root: impl Into<PathBuf>, unique_model_names: bool) -> Self {
        Self {
            root: root.into(),
            unique_model_names,
        }
    }
}

impl FileStore for DiskStore {
    fn documents_dir(&self) -> PathBuf {
        self.root.clone()
    }

    fn scans_dir(&self) -> PathBuf {
        self.root.join(SCANS_DIR_NAME)
    }

    fn model_output_path(&self) -> PathBuf {
        if self.unique_model_names {
            self.root.join(format!("model-{}.usdz", uuid::Uuid::new_v4()))
        } else {
            self.root.join(MODEL_FILE_NAME)
        }
    }

    fn clear_dir(&self, dir: &Path) -> Result<(), StoreError> {
        if dir.exists() {
            std::fs::remove_dir_all(dir).map_err(|source| StoreError::Clear {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Clear {
            path: dir.to_path_buf(),
            source,
        })?;
        debug!(path = %dir.display(), "Cleared directory");
        Ok(())
    }
}
