//! JSON document store

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Files in a data directory that are not documents
const IGNORED_FILES: &[&str] = &[".gitkeep"];

/// Directory of JSON documents, one per file
#[derive(Debug, Clone)]
pub struct JsonStore {
    base_dir: PathBuf,
}

impl JsonStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Store for a subdirectory (`servers/`, `games/`, ...)
    pub fn sub(&self, name: &str) -> Self {
        Self::new(self.base_dir.join(name))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.base_dir.join(filename)
    }

    fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            std::fs::create_dir_all(&self.base_dir)
                .map_err(|e| Error::Config(format!("Failed to create directory: {}", e)))?;
        }
        Ok(())
    }

    /// Load one document
    pub fn load<T: DeserializeOwned>(&self, filename: &str) -> Result<T> {
        let path = self.file_path(filename);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Load one document, `None` when the file does not exist
    pub fn load_optional<T: DeserializeOwned>(&self, filename: &str) -> Result<Option<T>> {
        if !self.exists(filename) {
            return Ok(None);
        }
        self.load(filename).map(Some)
    }

    /// Load every `.json` document in the directory.
    ///
    /// Unreadable or malformed files are logged and skipped so one bad
    /// document cannot keep the rest from loading. A missing directory
    /// yields an empty list.
    pub fn load_all<T: DeserializeOwned>(&self) -> Result<Vec<(String, T)>> {
        let mut names = self.list()?;
        names.sort();

        let mut documents = Vec::with_capacity(names.len());
        for name in names {
            match self.load::<T>(&name) {
                Ok(doc) => {
                    debug!(file = %name, dir = %self.base_dir.display(), "Loaded document");
                    documents.push((name, doc));
                }
                Err(e) => {
                    error!(file = %name, error = %e, "Failed to load JSON document, skipping");
                }
            }
        }
        Ok(documents)
    }

    /// Names of the `.json` files in the directory
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if IGNORED_FILES.contains(&name.as_str()) || !name.ends_with(".json") {
                continue;
            }
            if entry.file_type()?.is_file() {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Save a document, replacing the previous one atomically
    pub fn save<T: Serialize>(&self, filename: &str, data: &T) -> Result<()> {
        self.ensure_dir()?;
        let path = self.file_path(filename);
        let tmp = self.file_path(&format!(".{}.tmp", filename));
        let content = serde_json::to_string_pretty(data)
            .map_err(|e| Error::Config(format!("Failed to serialize: {}", e)))?;
        std::fs::write(&tmp, content)
            .map_err(|e| Error::Config(format!("Failed to write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| Error::Config(format!("Failed to write {}: {}", path.display(), e)))
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.file_path(filename).exists()
    }

    /// Delete a document; deleting a missing document is not an error
    pub fn remove(&self, filename: &str) -> Result<()> {
        let path = self.file_path(filename);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| {
                Error::Config(format!("Failed to remove {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }
}
