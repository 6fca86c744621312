//! Scoped on-disk staging for audio format conversion.
//!
//! Some encodings (browser `webm`/`ogg` containers) can only be decoded by an external
//! converter that reads and writes files. Every file it needs is acquired from a
//! [`StagingArea`] and released explicitly with [`StagedArtifact::release`]; an artifact
//! that is dropped without being released (error, cancellation, panic unwinding) is
//! deleted in `Drop`. The area counts live artifacts so leaks are observable.

use crate::error::{VoiceError, VoiceResult};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Directory in which staging artifacts are created.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
    live: Arc<AtomicUsize>,
}

impl Default for StagingArea {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create an empty staging file with the given suffix (e.g. ".webm").
    pub fn acquire(&self, suffix: &str) -> VoiceResult<StagedArtifact> {
        let file = tempfile::Builder::new()
            .prefix("parley-")
            .suffix(suffix)
            .tempfile_in(&self.dir)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        debug!(path = %file.path().display(), "staging artifact acquired");
        Ok(StagedArtifact {
            file: Some(file),
            live: Arc::clone(&self.live),
        })
    }

    /// Number of artifacts acquired and not yet released.
    pub fn live_artifacts(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// One staged file. Deleted on `release()` or, failing that, on drop.
#[derive(Debug)]
pub struct StagedArtifact {
    file: Option<NamedTempFile>,
    live: Arc<AtomicUsize>,
}

impl StagedArtifact {
    pub fn path(&self) -> &Path {
        match self.file {
            Some(ref f) => f.path(),
            None => Path::new(""),
        }
    }

    /// Write the whole payload, replacing any previous contents.
    pub async fn write_all(&self, bytes: &[u8]) -> VoiceResult<()> {
        tokio::fs::write(self.path(), bytes).await?;
        Ok(())
    }

    pub async fn read_all(&self) -> VoiceResult<Vec<u8>> {
        Ok(tokio::fs::read(self.path()).await?)
    }

    /// Delete the file now and surface any filesystem error.
    pub fn release(mut self) -> VoiceResult<()> {
        match self.file.take() {
            Some(file) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                file.close().map_err(VoiceError::Io)
            }
            None => Ok(()),
        }
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.live.fetch_sub(1, Ordering::SeqCst);
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                warn!(path = %path.display(), "failed to delete staging artifact: {}", e);
            }
        }
    }
}
