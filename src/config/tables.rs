use super::defaults;
use super::models::{AppConfig, LogLevel};
use serde::Deserialize;

/// On-disk layout of `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
pub(super) struct ConfigTables {
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    output: OutputConfig,
    #[serde(default)]
    tts: TtsConfig,
    #[serde(default)]
    session: SessionConfig,
    #[serde(default)]
    storage: StorageConfig,
}

impl From<ConfigTables> for AppConfig {
    fn from(tables: ConfigTables) -> Self {
        AppConfig {
            log_level: tables.logging.log_level,
            output_root: tables.output.output_root,
            tts_command: tables.tts.tts_command,
            tts_args: tables.tts.tts_args,
            tts_progress_log_interval_secs: tables.session.tts_progress_log_interval_secs,
            drain_timeout_secs: tables.session.drain_timeout_secs,
            cache_dir: tables.storage.cache_dir,
            recent_files_limit: tables.storage.recent_files_limit,
        }
    }
}

impl From<&AppConfig> for ConfigTables {
    fn from(config: &AppConfig) -> Self {
        ConfigTables {
            logging: LoggingConfig {
                log_level: config.log_level,
            },
            output: OutputConfig {
                output_root: config.output_root.clone(),
            },
            tts: TtsConfig {
                tts_command: config.tts_command.clone(),
                tts_args: config.tts_args.clone(),
            },
            session: SessionConfig {
                tts_progress_log_interval_secs: config.tts_progress_log_interval_secs,
                drain_timeout_secs: config.drain_timeout_secs,
            },
            storage: StorageConfig {
                cache_dir: config.cache_dir.clone(),
                recent_files_limit: config.recent_files_limit,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct LoggingConfig {
    #[serde(default = "defaults::default_log_level")]
    log_level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: defaults::default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct OutputConfig {
    #[serde(default = "defaults::default_output_root")]
    output_root: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            output_root: defaults::default_output_root(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct TtsConfig {
    #[serde(default = "defaults::default_tts_command")]
    tts_command: String,
    #[serde(default = "defaults::default_tts_args")]
    tts_args: Vec<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        TtsConfig {
            tts_command: defaults::default_tts_command(),
            tts_args: defaults::default_tts_args(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct SessionConfig {
    #[serde(default = "defaults::default_tts_progress_log_interval_secs")]
    tts_progress_log_interval_secs: f32,
    #[serde(default = "defaults::default_drain_timeout_secs")]
    drain_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            tts_progress_log_interval_secs: defaults::default_tts_progress_log_interval_secs(),
            drain_timeout_secs: defaults::default_drain_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct StorageConfig {
    #[serde(default = "defaults::default_cache_dir")]
    cache_dir: String,
    #[serde(default = "defaults::default_recent_files_limit")]
    recent_files_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            cache_dir: defaults::default_cache_dir(),
            recent_files_limit: defaults::default_recent_files_limit(),
        }
    }
}
