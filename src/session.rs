//! One transcription session: resume lookup, listener registration, the
//! run itself and draining of outstanding completions.
//!
//! Engine events are handled on a scoped thread that borrows the session's
//! [`TranscriptionState`] and progress store, so it can only ever observe
//! state that outlives its registration.

use crate::cancellation::CancellationToken;
use crate::config::AppConfig;
use crate::engine::{EngineEvent, SynthesisEngine, Token};
use crate::error::RunError;
use crate::runner::{Runner, TranscriptionState, lock_state};
use crate::segment::code_units;
use crate::store::{KeyValueStore, ProgressStore, destination_identity};
use anyhow::{Result, anyhow};
use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// `"12.50%   5 of 40"`
pub fn progress_line(done: usize, total: usize) -> String {
    let pct = if total == 0 {
        100.0
    } else {
        done as f64 * 100.0 / total as f64
    };
    format!("{pct:.2}%   {done} of {total}")
}

/// An engine event resolved against the submissions of the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Completed {
        index: usize,
    },
    Failed {
        index: Option<usize>,
        text: Option<String>,
        message: String,
    },
    Cancelled {
        message: String,
    },
    Progress {
        index: usize,
        chars_spoken: usize,
        total_chars: usize,
    },
    Ignored {
        token: Option<Token>,
    },
}

pub fn correlate(event: &EngineEvent, state: &TranscriptionState) -> SessionUpdate {
    match event {
        EngineEvent::Finish { token } => match state.index_of(token) {
            Some(index) => SessionUpdate::Completed { index },
            None => SessionUpdate::Ignored {
                token: Some(token.clone()),
            },
        },
        EngineEvent::Error { token, message } => {
            let index = match token {
                Some(token) => match state.index_of(token) {
                    Some(index) => Some(index),
                    None => {
                        return SessionUpdate::Ignored {
                            token: Some(token.clone()),
                        };
                    }
                },
                None => None,
            };
            SessionUpdate::Failed {
                index,
                text: index.and_then(|i| state.text_of(i)).map(str::to_string),
                message: message.clone(),
            }
        }
        EngineEvent::Cancel { message } => SessionUpdate::Cancelled {
            message: message.clone(),
        },
        EngineEvent::Progress {
            token,
            chars_spoken,
        } => match state.index_of(token) {
            Some(index) => SessionUpdate::Progress {
                index,
                chars_spoken: *chars_spoken,
                total_chars: state.text_of(index).map(code_units).unwrap_or(0),
            },
            None => SessionUpdate::Ignored {
                token: Some(token.clone()),
            },
        },
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub progress_log_interval: Duration,
    /// How long the engine may stay silent while the last submission is
    /// outstanding.
    pub drain_timeout: Duration,
}

impl SessionOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            progress_log_interval: Duration::from_secs_f32(
                config.tts_progress_log_interval_secs.max(0.1),
            ),
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
        }
    }
}

/// What to transcribe and where.
pub struct SessionJob<'a> {
    pub document: &'a str,
    pub destination: &'a Path,
    pub segments: &'a [&'a str],
    pub fingerprint: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Every segment up to the end of the book has finished.
    Completed,
    /// The cancellation token stopped the run.
    Stopped { next_index: usize },
    SubmitFailed {
        index: usize,
        text: String,
        message: String,
    },
    EngineError {
        index: Option<usize>,
        text: Option<String>,
        message: String,
    },
    EngineCancelled { message: String },
    DrainTimedOut { waiting_for: usize },
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub total: usize,
    pub resumed_from: usize,
    pub submitted: usize,
    pub completed: usize,
    pub high_water: Option<usize>,
    pub outcome: SessionOutcome,
}

impl SessionReport {
    /// Global index the next session will start from.
    pub fn next_index(&self) -> usize {
        self.high_water.map_or(0, |last| last + 1)
    }

    pub fn progress_line(&self) -> String {
        progress_line(self.next_index(), self.total)
    }
}

/// Run one session for `job` and report how it ended.
///
/// Submission failures and engine errors end the session but are reported
/// in the outcome rather than returned as errors; the resume record is left
/// at the last finished segment so the next session retries from there.
pub fn run_session<E, S>(
    engine: &mut E,
    progress: &mut ProgressStore<S>,
    job: &SessionJob<'_>,
    options: &SessionOptions,
    cancel: &CancellationToken,
) -> Result<SessionReport>
where
    E: SynthesisEngine + ?Sized,
    S: KeyValueStore + Send,
{
    let destination = destination_identity(job.destination);
    let total = job.segments.len();
    check_fingerprint(progress, job, &destination)?;

    let stored = progress.get(job.document, &destination);
    let resumed_from = stored.map_or(0, |last| last + 1);
    info!(
        document = job.document,
        destination = %destination,
        resumed_from,
        total,
        "Starting session"
    );
    if resumed_from >= total {
        info!("{}", progress_line(total, total));
        return Ok(SessionReport {
            total,
            resumed_from,
            submitted: 0,
            completed: 0,
            high_water: stored,
            outcome: SessionOutcome::Completed,
        });
    }

    let state = Mutex::new(TranscriptionState::new(total));
    let control = DrainControl::default();
    let registry = engine.listeners();
    let (guard, rx) = registry.register();

    let listener = Listener {
        state: &state,
        control: &control,
        progress,
        cancel: cancel.clone(),
        document: job.document,
        destination: &destination,
        total,
        log_interval: options.progress_log_interval,
        high_water: stored,
        completed: 0,
        last_log: Instant::now(),
        last_activity: Instant::now(),
    };

    let (run, listened) = thread::scope(|scope| {
        let handle = scope.spawn(move || listener.listen(rx));
        let _unwind = AbortOnPanic(&control);
        let run = Runner::new(&mut *engine, cancel.clone()).run(
            job.destination,
            job.segments,
            resumed_from,
            &state,
        );
        match &run {
            Ok(summary) => control.drain_until(summary.last_submitted, options.drain_timeout),
            Err(_) => control.abort(),
        }
        (run, handle.join())
    });
    drop(guard);

    let listened = listened.map_err(|_| anyhow!("Engine event listener panicked"))?;
    if matches!(listened.end, ListenEnd::Stopped) {
        engine.stop();
    }
    let resume_at = listened.high_water.map_or(resumed_from, |last| last + 1);
    let (submitted, outcome) = match run {
        Ok(summary) => (summary.submitted, listened.end.into_outcome(None, resume_at)),
        Err(RunError::Submit { index, message, .. }) => {
            let text = job.segments.get(index).copied().unwrap_or_default();
            error!(index, text, "Submission failed: {message}");
            (
                index - resumed_from,
                SessionOutcome::SubmitFailed {
                    index,
                    text: text.to_string(),
                    message,
                },
            )
        }
        Err(RunError::Cancelled { next_index }) => (
            next_index - resumed_from,
            listened.end.into_outcome(Some(next_index), resume_at),
        ),
        Err(err) => return Err(err.into()),
    };

    let report = SessionReport {
        total,
        resumed_from,
        submitted,
        completed: listened.completed,
        high_water: listened.high_water,
        outcome,
    };
    info!(
        outcome = ?report.outcome,
        completed = report.completed,
        "Session ended: {}",
        report.progress_line()
    );
    Ok(report)
}

fn check_fingerprint<S: KeyValueStore>(
    progress: &mut ProgressStore<S>,
    job: &SessionJob<'_>,
    destination: &str,
) -> Result<()> {
    let Some(fingerprint) = job.fingerprint else {
        return Ok(());
    };
    match progress.fingerprint(job.document, destination) {
        Some(stored) if stored == fingerprint => return Ok(()),
        Some(stored) => warn!(
            stored = %stored,
            current = fingerprint,
            "Segment plan changed since the last session; resume index may point at different text"
        ),
        None => {}
    }
    progress.set_fingerprint(job.document, destination, fingerprint)?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum DrainTarget {
    Running,
    /// Wait for `last` to finish, giving up once the engine has been quiet
    /// for `idle` since `since` or since its latest event.
    Until {
        last: Option<usize>,
        since: Instant,
        idle: Duration,
    },
    Abort,
}

/// Releases the listener if the runner panics, so the scope can unwind.
struct AbortOnPanic<'a>(&'a DrainControl);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort();
        }
    }
}

struct DrainControl {
    target: Mutex<DrainTarget>,
}

impl Default for DrainControl {
    fn default() -> Self {
        Self {
            target: Mutex::new(DrainTarget::Running),
        }
    }
}

impl DrainControl {
    fn drain_until(&self, last: Option<usize>, idle: Duration) {
        self.set(DrainTarget::Until {
            last,
            since: Instant::now(),
            idle,
        });
    }

    fn abort(&self) {
        self.set(DrainTarget::Abort);
    }

    fn set(&self, target: DrainTarget) {
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = target;
    }

    fn get(&self) -> DrainTarget {
        *self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
enum ListenEnd {
    Drained,
    Aborted,
    Disconnected,
    /// Cancelled while waiting for the last submission.
    Stopped,
    EngineError {
        index: Option<usize>,
        text: Option<String>,
        message: String,
    },
    EngineCancelled {
        message: String,
    },
    TimedOut {
        waiting_for: usize,
    },
}

impl ListenEnd {
    /// `stopped_at` is set when the runner itself was cancelled. `resume_at`
    /// is the first segment not yet finished.
    fn into_outcome(self, stopped_at: Option<usize>, resume_at: usize) -> SessionOutcome {
        match self {
            ListenEnd::Stopped => SessionOutcome::Stopped {
                next_index: resume_at,
            },
            ListenEnd::EngineError {
                index,
                text,
                message,
            } => SessionOutcome::EngineError {
                index,
                text,
                message,
            },
            ListenEnd::EngineCancelled { message } if stopped_at.is_none() => {
                SessionOutcome::EngineCancelled { message }
            }
            ListenEnd::TimedOut { waiting_for } => SessionOutcome::DrainTimedOut { waiting_for },
            _ => match stopped_at {
                Some(next_index) => SessionOutcome::Stopped { next_index },
                None => SessionOutcome::Completed,
            },
        }
    }
}

struct ListenResult {
    end: ListenEnd,
    high_water: Option<usize>,
    completed: usize,
}

struct Listener<'s, S> {
    state: &'s Mutex<TranscriptionState>,
    control: &'s DrainControl,
    progress: &'s mut ProgressStore<S>,
    cancel: CancellationToken,
    document: &'s str,
    destination: &'s str,
    total: usize,
    log_interval: Duration,
    high_water: Option<usize>,
    completed: usize,
    last_log: Instant,
    last_activity: Instant,
}

impl<S: KeyValueStore> Listener<'_, S> {
    fn listen(mut self, rx: Receiver<EngineEvent>) -> ListenResult {
        let end = loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(event) => {
                    if let Some(end) = self.handle(event) {
                        break end;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break ListenEnd::Disconnected,
            }
            self.log_progress_if_due();

            match self.control.get() {
                DrainTarget::Running => {}
                DrainTarget::Abort => break self.drain_pending(&rx),
                DrainTarget::Until { last, since, idle } => {
                    let Some(last) = last else {
                        break ListenEnd::Drained;
                    };
                    if self.high_water.is_some_and(|mark| mark >= last) {
                        break ListenEnd::Drained;
                    }
                    if self.cancel.is_cancelled() {
                        info!(waiting_for = last, "Stopped while waiting for the engine");
                        break ListenEnd::Stopped;
                    }
                    if self.last_activity.max(since).elapsed() >= idle {
                        warn!(waiting_for = last, ?idle, "Engine went quiet while draining");
                        break ListenEnd::TimedOut { waiting_for: last };
                    }
                }
            }
        };
        debug!(?end, "Listener finished");
        ListenResult {
            end,
            high_water: self.high_water,
            completed: self.completed,
        }
    }

    /// Handle whatever already arrived, without waiting for more.
    fn drain_pending(&mut self, rx: &Receiver<EngineEvent>) -> ListenEnd {
        while let Ok(event) = rx.try_recv() {
            if let Some(end) = self.handle(event) {
                return end;
            }
        }
        ListenEnd::Aborted
    }

    fn handle(&mut self, event: EngineEvent) -> Option<ListenEnd> {
        let update = correlate(&event, &lock_state(self.state));
        match update {
            SessionUpdate::Completed { index } => {
                self.last_activity = Instant::now();
                self.completed += 1;
                self.advance(index);
                None
            }
            SessionUpdate::Failed {
                index,
                text,
                message,
            } => {
                error!(?index, text = ?text, "Engine reported an error: {message}");
                self.cancel.cancel();
                Some(ListenEnd::EngineError {
                    index,
                    text,
                    message,
                })
            }
            SessionUpdate::Cancelled { message } => {
                warn!("Engine cancelled: {message}");
                self.cancel.cancel();
                Some(ListenEnd::EngineCancelled { message })
            }
            SessionUpdate::Progress {
                index,
                chars_spoken,
                total_chars,
            } => {
                self.last_activity = Instant::now();
                trace!(index, chars_spoken, total_chars, "Segment progress");
                None
            }
            SessionUpdate::Ignored { token } => {
                warn!(?token, ?event, "Ignoring event for a token this run never submitted");
                None
            }
        }
    }

    /// Move the high-water mark forward and persist it. Late finishes for
    /// lower indices leave it alone.
    fn advance(&mut self, index: usize) {
        if self.high_water.is_some_and(|mark| mark >= index) {
            debug!(index, "Finish below the high-water mark");
            return;
        }
        self.high_water = Some(index);
        match self.progress.set(self.document, self.destination, index) {
            Ok(()) => debug!(index, "Recorded completed segment"),
            Err(err) => error!(index, "Failed to persist progress: {err}"),
        }
    }

    fn log_progress_if_due(&mut self) {
        if self.last_log.elapsed() < self.log_interval {
            return;
        }
        self.last_log = Instant::now();
        let done = self.high_water.map_or(0, |last| last + 1);
        info!("{}", progress_line(done, self.total));
    }
}
