//! Durable progress: resume records, the recently opened books and the
//! last opened file.
//!
//! Everything sits in one flat string key-value store. The file-backed store
//! keeps its entries in a TOML `[entries]` table and rewrites the whole file
//! atomically on every change.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const RECENT_FILES_KEY: &str = "recent-files";
pub const LAST_FILE_KEY: &str = "last-file";

pub trait KeyValueStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    entries: BTreeMap<String, String>,
}

/// Key-value store persisted to a TOML file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let entries = match fs::read_to_string(path) {
            Ok(contents) => {
                let file: StoreFile =
                    toml::from_str(&contents).map_err(|source| StoreError::Parse {
                        path: path.to_path_buf(),
                        source,
                    })?;
                debug!(path = %path.display(), entries = file.entries.len(), "Loaded progress store");
                file.entries
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    fn persist(&self) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let contents = toml::to_string(&StoreFile {
            entries: self.entries.clone(),
        })?;
        let mut temp_name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        temp_name.push(".tmp");
        let temp_path = self.path.with_file_name(temp_name);
        fs::write(&temp_path, contents).map_err(io_err)?;
        fs::rename(&temp_path, &self.path).map_err(io_err)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        self.persist()
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        if self.entries.remove(key).is_some() {
            self.persist()?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

pub fn progress_key(document: &str, destination: &str) -> String {
    format!("last-completed:{document}:{destination}")
}

pub fn fingerprint_key(document: &str, destination: &str) -> String {
    format!("plan-fingerprint:{document}:{destination}")
}

/// Stable identity of a book file: its canonical path when it exists.
pub fn document_identity(path: &Path) -> String {
    fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

/// Destinations may not exist yet, so they are made absolute without
/// touching the filesystem.
pub fn destination_identity(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

/// High-water marks per (document, destination).
pub struct ProgressStore<S> {
    store: S,
}

impl<S: KeyValueStore> ProgressStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Highest completed global index, if any.
    pub fn get(&self, document: &str, destination: &str) -> Option<usize> {
        let key = progress_key(document, destination);
        let raw = self.store.get(&key)?;
        match raw.trim().parse() {
            Ok(index) => Some(index),
            Err(_) => {
                warn!(%key, value = %raw, "Ignoring unreadable resume record");
                None
            }
        }
    }

    pub fn set(&mut self, document: &str, destination: &str, index: usize) -> Result<(), StoreError> {
        self.store
            .set(&progress_key(document, destination), index.to_string())
    }

    pub fn clear(&mut self, document: &str, destination: &str) -> Result<(), StoreError> {
        info!(document, destination, "Clearing resume record");
        self.store.remove(&progress_key(document, destination))?;
        self.store.remove(&fingerprint_key(document, destination))
    }

    /// First global index not yet completed.
    pub fn resume_index(&self, document: &str, destination: &str) -> usize {
        self.get(document, destination).map_or(0, |last| last + 1)
    }

    pub fn fingerprint(&self, document: &str, destination: &str) -> Option<String> {
        self.store.get(&fingerprint_key(document, destination))
    }

    pub fn set_fingerprint(
        &mut self,
        document: &str,
        destination: &str,
        fingerprint: &str,
    ) -> Result<(), StoreError> {
        self.store.set(
            &fingerprint_key(document, destination),
            fingerprint.to_string(),
        )
    }

    pub fn last_file(&self) -> Option<PathBuf> {
        self.store.get(LAST_FILE_KEY).map(PathBuf::from)
    }

    pub fn set_last_file(&mut self, path: &Path) -> Result<(), StoreError> {
        self.store
            .set(LAST_FILE_KEY, path.display().to_string())
    }

    pub fn recent_files(&self) -> Result<RecentFiles, StoreError> {
        RecentFiles::load(&self.store)
    }

    /// Record `path` as the most recently opened book and as the last file.
    /// Stored in the same canonical form used for resume keys.
    pub fn remember_opened(&mut self, path: &Path, limit: usize) -> Result<(), StoreError> {
        let path = PathBuf::from(document_identity(path));
        let mut recent = self.recent_files()?;
        recent.push(&path, limit);
        recent.save(&mut self.store)?;
        self.set_last_file(&path)
    }
}

/// Most recently opened books, newest first, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecentFiles {
    paths: Vec<String>,
}

impl RecentFiles {
    pub fn load<S: KeyValueStore + ?Sized>(store: &S) -> Result<Self, StoreError> {
        let Some(raw) = store.get(RECENT_FILES_KEY) else {
            return Ok(Self::default());
        };
        let paths = serde_json::from_str(&raw).map_err(|source| StoreError::Json {
            key: RECENT_FILES_KEY.to_string(),
            source,
        })?;
        Ok(Self { paths })
    }

    pub fn save<S: KeyValueStore + ?Sized>(&self, store: &mut S) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&self.paths).map_err(|source| StoreError::Json {
            key: RECENT_FILES_KEY.to_string(),
            source,
        })?;
        store.set(RECENT_FILES_KEY, raw)
    }

    pub fn push(&mut self, path: &Path, limit: usize) {
        let entry = path.display().to_string();
        self.paths.retain(|existing| *existing != entry);
        self.paths.insert(0, entry);
        self.paths.truncate(limit.max(1));
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_store_path(label: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be after epoch")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("book-to-audio-{label}-{nonce}"))
            .join("progress.toml")
    }

    #[test]
    fn resume_index_follows_set_and_clear() {
        let mut progress = ProgressStore::new(MemoryStore::new());
        assert_eq!(progress.resume_index("book", "/out"), 0);

        progress.set("book", "/out", 41).unwrap();
        assert_eq!(progress.get("book", "/out"), Some(41));
        assert_eq!(progress.resume_index("book", "/out"), 42);

        progress.clear("book", "/out").unwrap();
        assert_eq!(progress.get("book", "/out"), None);
        assert_eq!(progress.resume_index("book", "/out"), 0);
    }

    #[test]
    fn records_are_qualified_by_destination() {
        let mut progress = ProgressStore::new(MemoryStore::new());
        progress.set("book", "/a", 3).unwrap();
        assert_eq!(progress.resume_index("book", "/a"), 4);
        assert_eq!(progress.resume_index("book", "/b"), 0);
        assert_eq!(progress.resume_index("other", "/a"), 0);
    }

    #[test]
    fn unreadable_record_means_nothing_completed() {
        let mut store = MemoryStore::new();
        store
            .set(&progress_key("book", "/out"), "seven".to_string())
            .unwrap();
        let progress = ProgressStore::new(store);
        assert_eq!(progress.resume_index("book", "/out"), 0);
    }

    #[test]
    fn file_store_survives_reopen() {
        let path = temp_store_path("store-reopen");
        {
            let mut progress = ProgressStore::new(FileStore::open(&path).unwrap());
            progress.set("book", "/out", 9).unwrap();
            progress.set_fingerprint("book", "/out", "abc").unwrap();
        }
        let progress = ProgressStore::new(FileStore::open(&path).unwrap());
        assert_eq!(progress.resume_index("book", "/out"), 10);
        assert_eq!(progress.fingerprint("book", "/out").as_deref(), Some("abc"));
        assert!(!path.with_file_name("progress.toml.tmp").exists());

        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn corrupt_store_file_is_a_parse_error() {
        let path = temp_store_path("store-corrupt");
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).unwrap();
        }
        fs::write(&path, "entries = [not toml").unwrap();
        assert!(matches!(
            FileStore::open(&path),
            Err(StoreError::Parse { .. })
        ));
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn recent_files_are_deduplicated_newest_first_and_capped() {
        let mut progress = ProgressStore::new(MemoryStore::new());
        for name in ["a.epub", "b.epub", "a.epub", "c.epub"] {
            progress.remember_opened(Path::new(name), 2).unwrap();
        }
        let recent = progress.recent_files().unwrap();
        assert_eq!(recent.paths(), ["c.epub", "a.epub"]);
        assert_eq!(progress.last_file(), Some(PathBuf::from("c.epub")));
    }

    #[test]
    fn opened_books_are_remembered_by_canonical_path() {
        let book = temp_store_path("recent-canonical").with_file_name("book.epub");
        let dir = book.parent().expect("book has a parent").to_path_buf();
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(&book, b"epub").unwrap();

        let mut progress = ProgressStore::new(MemoryStore::new());
        let roundabout = dir.join("sub").join("..").join("book.epub");
        progress.remember_opened(&roundabout, 5).unwrap();

        let canonical = fs::canonicalize(&book).unwrap();
        assert_eq!(progress.last_file(), Some(canonical.clone()));
        assert_eq!(
            progress.recent_files().unwrap().paths(),
            [canonical.display().to_string()]
        );
        assert_eq!(
            progress.last_file().map(|path| document_identity(&path)),
            Some(document_identity(&roundabout))
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn invalid_recent_files_json_is_reported() {
        let mut store = MemoryStore::new();
        store.set(RECENT_FILES_KEY, "{oops".to_string()).unwrap();
        assert!(matches!(
            RecentFiles::load(&store),
            Err(StoreError::Json { .. })
        ));
    }

    #[test]
    fn destination_identity_is_absolute() {
        let identity = destination_identity(Path::new("relative/out"));
        assert!(Path::new(&identity).is_absolute());
        assert!(identity.ends_with("out"));
    }
}
