//! Named-entry access to the zip container behind an EPUB.
//!
//! The rest of the crate only talks to the [`Archive`] trait so navigation and
//! content shaping can be exercised against in-memory books.

use crate::error::{BookError, Result};
use epub::archive::EpubArchive;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub trait Archive {
    /// Every entry path stored in the container.
    fn entries(&self) -> Vec<String>;

    /// Decode one entry as text. Fails with `EntryNotFound` for unknown paths.
    fn read_text(&mut self, path: &str) -> Result<String>;

    fn contains(&self, path: &str) -> bool {
        self.entries().iter().any(|entry| entry == path)
    }
}

/// An EPUB file on disk.
pub struct EpubFile {
    path: PathBuf,
    inner: EpubArchive<BufReader<File>>,
}

impl EpubFile {
    pub fn open(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "Opening EPUB archive");
        let inner = EpubArchive::new(path).map_err(|err| BookError::Archive {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        debug!(entries = inner.files.len(), "Read archive directory");
        Ok(Self {
            path: path.to_path_buf(),
            inner,
        })
    }

}

impl Archive for EpubFile {
    fn entries(&self) -> Vec<String> {
        self.inner.files.clone()
    }

    fn contains(&self, path: &str) -> bool {
        self.inner.files.iter().any(|entry| entry == path)
    }

    fn read_text(&mut self, path: &str) -> Result<String> {
        if !self.contains(path) {
            return Err(BookError::EntryNotFound {
                path: path.to_string(),
            });
        }
        let bytes = self
            .inner
            .get_entry(path)
            .map_err(|err| BookError::Archive {
                path: format!("{}!{path}", self.path.display()),
                message: err.to_string(),
            })?;
        Ok(decode_text(&bytes))
    }
}

/// Archive held entirely in memory, keyed by entry path.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn insert(&mut self, path: &str, contents: impl Into<Vec<u8>>) {
        self.entries.insert(path.to_string(), contents.into());
    }
}

impl Archive for MemoryArchive {
    fn entries(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    fn read_text(&mut self, path: &str) -> Result<String> {
        self.entries
            .get(path)
            .map(|bytes| decode_text(bytes))
            .ok_or_else(|| BookError::EntryNotFound {
                path: path.to_string(),
            })
    }
}

/// UTF-8 decode with a leading byte-order mark dropped. Invalid sequences
/// become U+FFFD instead of failing the whole chapter.
fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
