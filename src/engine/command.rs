//! Speech engine backed by an external synthesizer command.
//!
//! Requests are handed to a single worker thread over a rendezvous channel,
//! so `submit` returns only once the worker has finished the previous
//! request and taken the new one. At most one request is ever in flight.
//! Output is written to a temporary file next to the target and renamed
//! into place only after the command succeeds, so a `{index}.wav` on disk is
//! always complete.

use super::{EngineEvent, ListenerRegistry, SubmitError, SynthesisEngine, Token};
use crate::config::AppConfig;
use crate::segment::code_units;
use anyhow::{Context, Result, bail};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const OUTPUT_PLACEHOLDER: &str = "{output}";
const TEXT_PLACEHOLDER: &str = "{text}";

/// Program and argument template. `{output}` is replaced by the file to
/// write; `{text}` by the text to speak, which is otherwise piped to stdin.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    fn takes_text_argument(&self) -> bool {
        self.args.iter().any(|arg| arg.contains(TEXT_PLACEHOLDER))
    }

    fn render_args(&self, output: &Path, text: &str) -> Vec<String> {
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(OUTPUT_PLACEHOLDER, &output)
                    .replace(TEXT_PLACEHOLDER, text)
            })
            .collect()
    }
}

struct Job {
    token: Token,
    text: String,
    output: PathBuf,
    generation: u64,
}

pub struct CommandEngine {
    jobs: Option<SyncSender<Job>>,
    worker: Option<JoinHandle<()>>,
    registry: ListenerRegistry,
    generation: Arc<AtomicU64>,
    next_token: u64,
}

impl CommandEngine {
    pub fn new(spec: CommandSpec) -> Self {
        let registry = ListenerRegistry::new();
        let generation = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::sync_channel::<Job>(0);

        let worker_registry = registry.clone();
        let worker_generation = generation.clone();
        info!(program = %spec.program, args = ?spec.args, "Starting synthesis worker");
        let worker = thread::spawn(move || {
            for job in rx {
                run_job(&spec, job, &worker_registry, &worker_generation);
            }
            debug!("Synthesis worker exiting");
        });

        Self {
            jobs: Some(tx),
            worker: Some(worker),
            registry,
            generation,
            next_token: 0,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(CommandSpec {
            program: config.tts_command.clone(),
            args: config.tts_args.clone(),
        })
    }
}

impl SynthesisEngine for CommandEngine {
    fn submit(&mut self, text: &str, output: &Path) -> Result<Token, SubmitError> {
        let token = format!("utt-{}", self.next_token);
        self.next_token += 1;

        let Some(jobs) = &self.jobs else {
            return Err(SubmitError {
                token: Some(token),
                message: "synthesis worker is shut down".to_string(),
            });
        };
        let job = Job {
            token: token.clone(),
            text: text.to_string(),
            output: output.to_path_buf(),
            generation: self.generation.load(Ordering::Acquire),
        };
        jobs.send(job).map_err(|_| SubmitError {
            token: Some(token.clone()),
            message: "synthesis worker exited".to_string(),
        })?;
        debug!(%token, output = %output.display(), "Handed synthesis request to worker");
        Ok(token)
    }

    fn stop(&mut self) {
        let previous = self.generation.fetch_add(1, Ordering::AcqRel);
        info!(generation = previous + 1, "Discarding the in-flight synthesis request");
    }

    fn listeners(&self) -> ListenerRegistry {
        self.registry.clone()
    }
}

impl Drop for CommandEngine {
    fn drop(&mut self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Synthesis worker panicked");
            }
        }
    }
}

fn run_job(spec: &CommandSpec, job: Job, registry: &ListenerRegistry, generation: &AtomicU64) {
    let stale = || job.generation != generation.load(Ordering::Acquire);
    if stale() {
        registry.emit(EngineEvent::Cancel {
            message: format!("request {} stopped before synthesis", job.token),
        });
        return;
    }

    let result = synthesize(spec, &job.text, &job.output).and_then(|temp| {
        if stale() {
            let _ = fs::remove_file(&temp);
            return Ok(false);
        }
        move_into_place(&temp, &job.output)?;
        Ok(true)
    });
    match result {
        Ok(false) => {
            debug!(token = %job.token, "Discarded audio for a stopped request");
            registry.emit(EngineEvent::Cancel {
                message: format!("request {} stopped during synthesis", job.token),
            });
        }
        Ok(true) => {
            registry.emit(EngineEvent::Progress {
                token: job.token.clone(),
                chars_spoken: code_units(&job.text),
            });
            registry.emit(EngineEvent::Finish { token: job.token });
        }
        Err(err) => {
            warn!(token = %job.token, "Synthesis failed: {err:#}");
            registry.emit(EngineEvent::Error {
                token: Some(job.token),
                message: format!("{err:#}"),
            });
        }
    }
}

/// Run the command once. Returns the temporary file holding the audio.
fn synthesize(spec: &CommandSpec, text: &str, output: &Path) -> Result<PathBuf> {
    let temp_path = unique_temp_wav_path(output);
    let text_on_stdin = !spec.takes_text_argument();

    let mut child = Command::new(&spec.program)
        .args(spec.render_args(&temp_path, text))
        .stdin(if text_on_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to start {}", spec.program))?;

    if text_on_stdin {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .with_context(|| format!("Failed to write text to {}", spec.program))?;
        }
    }

    let result = child
        .wait_with_output()
        .with_context(|| format!("Failed waiting for {}", spec.program))?;
    if !result.status.success() {
        let _ = fs::remove_file(&temp_path);
        let stderr = String::from_utf8_lossy(&result.stderr);
        bail!(
            "{} exited with {}: {}",
            spec.program,
            result.status,
            stderr.trim()
        );
    }
    if !temp_path.exists() {
        bail!(
            "{} finished without writing {}",
            spec.program,
            temp_path.display()
        );
    }

    Ok(temp_path)
}

fn move_into_place(temp_path: &Path, output: &Path) -> Result<()> {
    if fs::rename(temp_path, output).is_err() {
        fs::copy(temp_path, output)
            .with_context(|| format!("Failed to move audio into {}", output.display()))?;
        let _ = fs::remove_file(temp_path);
    }
    Ok(())
}

fn unique_temp_wav_path(path: &Path) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let nonce = SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let stem = path
        .file_stem()
        .and_then(|f| f.to_str())
        .unwrap_or("segment");
    // Keep the .wav extension; some synthesizers pick the format from it.
    path.with_file_name(format!(".{stem}.tmp-{ts_nanos}-{nonce}.wav"))
}
