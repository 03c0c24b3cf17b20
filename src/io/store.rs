//! Storage of pickled stage results.
//!
//! The context only keeps a light proxy per accepted result; the full result
//! lives in an [`ArtifactStore`] keyed by stage number.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use lazy_static::lazy_static;
use log::trace;
use regex::Regex;

use super::error::IOError;

lazy_static! {
    static ref STAGE_FILE_RE: Regex = Regex::new(r"^result-stage(\d+)\.pickle$").unwrap();
}

/// Somewhere to keep pickled stage results.
pub trait ArtifactStore: Send {
    /// Store the pickled result of `stage_number`, replacing any previous one.
    /// Returns a description of where it went.
    ///
    /// # Errors
    ///
    /// Fails if the backing storage can't be written.
    fn put(&mut self, stage_number: usize, bytes: &[u8]) -> Result<String, IOError>;

    /// Fetch the pickled result of `stage_number`.
    ///
    /// # Errors
    ///
    /// Fails if nothing was stored for the stage, or it can't be read.
    fn get(&self, stage_number: usize) -> Result<Vec<u8>, IOError>;

    /// Stage numbers with a stored result, ascending.
    ///
    /// # Errors
    ///
    /// Fails if the backing storage can't be listed.
    fn stages(&self) -> Result<Vec<usize>, IOError>;
}

/// Results pickled to `result-stage<N>.pickle` files in a directory.
#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    /// Use `dir` for stage results, creating it if necessary.
    ///
    /// # Errors
    ///
    /// Fails if the directory can't be created.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, IOError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| IOError::filesystem(&dir, e))?;
        Ok(Self { dir })
    }

    /// Path of the file holding `stage_number`'s result
    pub fn stage_path(&self, stage_number: usize) -> PathBuf {
        self.dir.join(format!("result-stage{stage_number}.pickle"))
    }
}

impl ArtifactStore for DiskStore {
    fn put(&mut self, stage_number: usize, bytes: &[u8]) -> Result<String, IOError> {
        let path = self.stage_path(stage_number);
        trace!("writing {} bytes to {}", bytes.len(), path.display());
        fs::write(&path, bytes).map_err(|e| IOError::filesystem(&path, e))?;
        Ok(path.display().to_string())
    }

    fn get(&self, stage_number: usize) -> Result<Vec<u8>, IOError> {
        let path = self.stage_path(stage_number);
        if !path.exists() {
            return Err(IOError::MissingStage { stage_number });
        }
        fs::read(&path).map_err(|e| IOError::filesystem(&path, e))
    }

    fn stages(&self) -> Result<Vec<usize>, IOError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| IOError::filesystem(&self.dir, e))?;
        let mut stages = vec![];
        for entry in entries {
            let entry = entry.map_err(|e| IOError::filesystem(&self.dir, e))?;
            let name = entry.file_name();
            if let Some(captures) = name.to_str().and_then(|name| STAGE_FILE_RE.captures(name)) {
                if let Ok(stage_number) = captures[1].parse() {
                    stages.push(stage_number);
                }
            }
        }
        stages.sort_unstable();
        Ok(stages)
    }
}

/// Results kept in memory, for runs that don't persist anything.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    blobs: BTreeMap<usize, Vec<u8>>,
}

impl ArtifactStore for MemoryStore {
    fn put(&mut self, stage_number: usize, bytes: &[u8]) -> Result<String, IOError> {
        self.blobs.insert(stage_number, bytes.to_vec());
        Ok(format!("memory:stage{stage_number}"))
    }

    fn get(&self, stage_number: usize) -> Result<Vec<u8>, IOError> {
        self.blobs
            .get(&stage_number)
            .cloned()
            .ok_or(IOError::MissingStage { stage_number })
    }

    fn stages(&self) -> Result<Vec<usize>, IOError> {
        Ok(self.blobs.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_disk_store_lists_stage_files() {
        let tmp_dir = tempdir().unwrap();
        let mut store = DiskStore::new(tmp_dir.path().join("saved_state")).unwrap();
        store.put(10, b"ten").unwrap();
        let location = store.put(2, b"two").unwrap();
        assert!(location.ends_with("result-stage2.pickle"));
        fs::write(tmp_dir.path().join("saved_state/notes.txt"), b"ignored").unwrap();

        assert_eq!(store.stages().unwrap(), vec![2, 10]);
        assert_eq!(store.get(10).unwrap(), b"ten");
        assert!(matches!(
            store.get(3),
            Err(IOError::MissingStage { stage_number: 3 })
        ));
    }

    #[test]
    fn test_memory_store_replaces_stage() {
        let mut store = MemoryStore::default();
        store.put(1, b"first").unwrap();
        store.put(1, b"second").unwrap();
        assert_eq!(store.get(1).unwrap(), b"second");
        assert_eq!(store.stages().unwrap(), vec![1]);
    }
}
