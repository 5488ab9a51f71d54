//! Error types for book-to-audio.

use std::path::PathBuf;
use thiserror::Error;

/// Failures while turning an archive into chapters and segments.
///
/// Every variant is fatal to the book load: no partial chapter list is
/// returned alongside it.
#[derive(Error, Debug)]
pub enum BookError {
    #[error("Malformed archive: {reason}")]
    MalformedArchive { reason: String },

    #[error("Missing navigation document: {reason}")]
    MissingNavigation { reason: String },

    #[error("Entry not found in archive: {path}")]
    EntryNotFound { path: String },

    #[error("Chapter not in files list {path} - {}", .available.join(","))]
    ChapterEntryMissing {
        path: String,
        available: Vec<String>,
    },

    #[error("Failed to parse markup in {path}: {message}")]
    Markup { path: String, message: String },

    #[error("Cannot split block of {len} code units at a sentence boundary: {preview}")]
    UnsplittableBlock { len: usize, preview: String },

    #[error("Segment {index} is {len} code units, over the {limit} unit limit")]
    OversizedSegment {
        index: usize,
        len: usize,
        limit: usize,
    },

    #[error("Failed to read archive {path}: {message}")]
    Archive { path: String, message: String },
}

/// Failures of a transcription run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Failed to prepare destination {}: {source}", .path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Submitting segment {index} failed: {message}")]
    Submit {
        index: usize,
        token: Option<String>,
        message: String,
    },

    #[error("Run stopped before segment {next_index}")]
    Cancelled { next_index: usize },

    #[error("Token {token} already bound to segment {existing}, refusing to rebind to {index}")]
    TokenReused {
        token: String,
        existing: usize,
        index: usize,
    },
}

/// Failures of the durable key-value store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store file {} is not valid TOML: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize store: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid JSON under key {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures while joining segment audio into chapter files.
#[derive(Error, Debug)]
pub enum ConsolidateError {
    #[error("Segment file missing: {}", .path.display())]
    MissingSegment { path: PathBuf },

    #[error("Audio format of {} differs from the first segment of the chapter", .path.display())]
    SpecMismatch { path: PathBuf },

    #[error("WAV error at {}: {source}", .path.display())]
    Wav {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, BookError>;
