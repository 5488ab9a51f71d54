pub(crate) fn default_log_level() -> crate::config::LogLevel {
    crate::config::LogLevel::Debug
}

pub(crate) fn default_output_root() -> String {
    "Audiobooks".to_string()
}

pub(crate) fn default_tts_command() -> String {
    "espeak-ng".to_string()
}

pub(crate) fn default_tts_args() -> Vec<String> {
    vec![
        "-w".to_string(),
        "{output}".to_string(),
        "--stdin".to_string(),
    ]
}

pub(crate) fn default_tts_progress_log_interval_secs() -> f32 {
    5.0
}

pub(crate) fn default_drain_timeout_secs() -> u64 {
    600
}

pub(crate) fn default_cache_dir() -> String {
    ".cache".to_string()
}

pub(crate) fn default_recent_files_limit() -> usize {
    10
}
