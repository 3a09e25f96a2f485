//! Triggers file on disk.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use nwnbridge_domain::{ParseError, TriggerCatalog};

#[derive(Debug, thiserror::Error)]
pub enum TriggerFileError {
    #[error("Cannot read triggers file {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Invalid triggers file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },
}

/// Location of the triggers document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerFile {
    path: PathBuf,
}

impl TriggerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the whole file.
    pub async fn load(&self) -> Result<TriggerCatalog, TriggerFileError> {
        let document = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| TriggerFileError::Io {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        TriggerCatalog::parse(&document).map_err(|source| TriggerFileError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Last modification time, `None` when unavailable.
    pub async fn modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .ok()
    }
}
