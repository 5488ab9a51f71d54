//! Configuration loading for book-to-audio.
//!
//! Settings live in `conf/config.toml`, grouped into `[logging]`, `[output]`,
//! `[tts]`, `[session]` and `[storage]` tables. Missing entries take their
//! defaults and an unreadable file falls back to the defaults entirely, so a
//! run can always start.

mod defaults;
mod io;
mod models;
mod tables;

pub use io::{load_config, parse_config, serialize_config};
pub use models::{AppConfig, LogLevel};
