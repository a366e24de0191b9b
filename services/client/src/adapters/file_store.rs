//! services/client/src/adapters/file_store.rs
//!
//! A `SessionStore` that keeps one JSON file per key in a cache directory, so a
//! session survives the process that produced it.

use page_forge_core::ports::{PortError, PortResult, SessionStore};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Opens (and creates, if needed) the cache directory.
    pub fn new(dir: impl AsRef<Path>) -> PortResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| {
            PortError::Unexpected(format!("Failed to create {}: {e}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Maps a key to a file name, replacing anything that is not safe in a path.
    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl SessionStore for FileSessionStore {
    fn read(&self, key: &str) -> PortResult<Option<String>> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PortError::Unexpected(e.to_string())),
        }
    }

    fn write(&self, key: &str, value: &str) -> PortResult<()> {
        let path = self.path_for(key);
        // Write beside the target and rename, so readers never see half a file.
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, value).map_err(|e| PortError::Unexpected(e.to_string()))?;
        std::fs::rename(&staging, &path).map_err(|e| PortError::Unexpected(e.to_string()))?;
        debug!(path = %path.display(), "Wrote session file");
        Ok(())
    }

    fn remove(&self, key: &str) -> PortResult<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PortError::Unexpected(e.to_string())),
        }
    }
}
