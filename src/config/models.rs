use serde::Deserialize;
use std::path::PathBuf;

/// Flattened application configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, serde::Serialize)]
pub struct AppConfig {
    #[serde(default = "crate::config::defaults::default_log_level")]
    pub log_level: LogLevel,
    /// Parent of the default per-book destination directories.
    #[serde(default = "crate::config::defaults::default_output_root")]
    pub output_root: String,
    #[serde(default = "crate::config::defaults::default_tts_command")]
    pub tts_command: String,
    /// Arguments for `tts_command`; `{output}` and `{text}` are substituted.
    #[serde(default = "crate::config::defaults::default_tts_args")]
    pub tts_args: Vec<String>,
    #[serde(default = "crate::config::defaults::default_tts_progress_log_interval_secs")]
    pub tts_progress_log_interval_secs: f32,
    #[serde(default = "crate::config::defaults::default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default = "crate::config::defaults::default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "crate::config::defaults::default_recent_files_limit")]
    pub recent_files_limit: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            log_level: crate::config::defaults::default_log_level(),
            output_root: crate::config::defaults::default_output_root(),
            tts_command: crate::config::defaults::default_tts_command(),
            tts_args: crate::config::defaults::default_tts_args(),
            tts_progress_log_interval_secs:
                crate::config::defaults::default_tts_progress_log_interval_secs(),
            drain_timeout_secs: crate::config::defaults::default_drain_timeout_secs(),
            cache_dir: crate::config::defaults::default_cache_dir(),
            recent_files_limit: crate::config::defaults::default_recent_files_limit(),
        }
    }
}

impl AppConfig {
    /// File backing the progress store.
    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(&self.cache_dir).join("progress.toml")
    }
}

/// Supported logging verbosity levels.
#[derive(Debug, Clone, Copy, Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    #[default]
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_filter_str())
    }
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
