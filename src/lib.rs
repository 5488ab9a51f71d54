//! EPUB to speech: chapters, normalized text blocks, sentence-aware segments
//! and a resumable transcription job against an external speech engine.

pub mod archive;
pub mod book;
pub mod cancellation;
pub mod config;
pub mod consolidate;
pub mod content;
pub mod engine;
pub mod error;
pub mod markup;
pub mod navigation;
pub mod runner;
pub mod segment;
pub mod session;
pub mod store;
