//! Scratch directory for temporary model inputs.
//!
//! Audio models read from a file, so each transcription writes its payload to
//! a `tmp*` named temporary file here. Files are removed when the handle
//! drops; [`ScratchDir::cleanup_stray`] sweeps whatever a crash left behind.
//!
//! Without a configured directory each worker gets its own private one, so
//! the sweep never touches another process's files.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info};

/// Audio extensions the worker writes and sweeps.
pub const AUDIO_EXTENSIONS: [&str; 4] = ["wav", "mp3", "webm", "m4a"];

const TEMP_PREFIX: &str = "tmp";

/// Where the worker keeps temporary files.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    path: PathBuf,
    /// Private directory, removed when the last clone drops.
    _owned: Option<Arc<TempDir>>,
}

impl ScratchDir {
    /// Use `path`, or a fresh private directory under the system temp dir
    /// when `None`.
    ///
    /// # Errors
    ///
    /// Any I/O error from creating the private directory.
    pub fn new(path: Option<PathBuf>) -> io::Result<Self> {
        match path {
            Some(path) => Ok(Self { path, _owned: None }),
            None => {
                let dir = tempfile::Builder::new().prefix("inference-worker-").tempdir()?;
                debug!(dir = %dir.path().display(), "private scratch dir created");
                Ok(Self {
                    path: dir.path().to_path_buf(),
                    _owned: Some(Arc::new(dir)),
                })
            }
        }
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a temporary audio file whose extension follows `filename`.
    ///
    /// # Errors
    ///
    /// Any I/O error from creating the file.
    pub fn audio_file(&self, filename: &str) -> io::Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(&format!(".{}", audio_extension(filename)))
            .tempfile_in(&self.path)
    }

    /// Remove stray `tmp*.{wav,mp3,webm,m4a}` files. Returns how many were removed.
    pub fn cleanup_stray(&self) -> usize {
        let entries = match std::fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.path.display(), error = %e, "scratch dir unreadable");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if is_stray(&path) && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, dir = %self.path.display(), "cleaned up temporary files");
        }
        removed
    }
}

fn audio_extension(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    AUDIO_EXTENSIONS
        .iter()
        .find(|known| ext.as_deref() == Some(**known))
        .copied()
        .unwrap_or("wav")
}

fn is_stray(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    name.starts_with(TEMP_PREFIX) && AUDIO_EXTENSIONS.contains(&ext) && path.is_file()
}
