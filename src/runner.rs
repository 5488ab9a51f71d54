//! Sequential submission of segments to a speech engine.

use crate::cancellation::CancellationToken;
use crate::engine::{SynthesisEngine, Token};
use crate::error::RunError;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Audio file name for a global segment index.
pub fn segment_file_name(index: usize) -> String {
    format!("{index}.wav")
}

pub fn segment_path(destination: &Path, index: usize) -> PathBuf {
    destination.join(segment_file_name(index))
}

/// What the current run has submitted, for correlating engine events.
#[derive(Debug, Default)]
pub struct TranscriptionState {
    pub total_segments: usize,
    correlation_to_segment: HashMap<Token, usize>,
    segment_text: BTreeMap<usize, String>,
}

impl TranscriptionState {
    pub fn new(total_segments: usize) -> Self {
        Self {
            total_segments,
            ..Self::default()
        }
    }

    /// Bind `token` to `index`. Rebinding to the same index is a no-op;
    /// rebinding to another index is refused.
    pub fn bind_token(&mut self, token: &str, index: usize) -> Result<(), RunError> {
        match self.correlation_to_segment.get(token) {
            Some(&existing) if existing != index => Err(RunError::TokenReused {
                token: token.to_string(),
                existing,
                index,
            }),
            Some(_) => Ok(()),
            None => {
                self.correlation_to_segment.insert(token.to_string(), index);
                Ok(())
            }
        }
    }

    pub fn index_of(&self, token: &str) -> Option<usize> {
        self.correlation_to_segment.get(token).copied()
    }

    pub fn text_of(&self, index: usize) -> Option<&str> {
        self.segment_text.get(&index).map(String::as_str)
    }

    pub fn record_text(&mut self, index: usize, text: &str) {
        self.segment_text.insert(index, text.to_string());
    }

    pub fn submitted(&self) -> usize {
        self.segment_text.len()
    }
}

/// Lock the shared state, recovering the data if a holder panicked.
pub fn lock_state(state: &Mutex<TranscriptionState>) -> MutexGuard<'_, TranscriptionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub skipped: usize,
    pub submitted: usize,
    pub last_submitted: Option<usize>,
}

/// Drives one transcription job. Borrows the engine mutably for the whole
/// run, so two runs cannot share an engine at once.
pub struct Runner<'e, E: SynthesisEngine + ?Sized> {
    engine: &'e mut E,
    cancel: CancellationToken,
}

impl<'e, E: SynthesisEngine + ?Sized> Runner<'e, E> {
    pub fn new(engine: &'e mut E, cancel: CancellationToken) -> Self {
        Self { engine, cancel }
    }

    /// Submit every segment from `resume_from` on, writing `{index}.wav`
    /// under `destination`. `state` is reset before the first submission.
    pub fn run<S: AsRef<str>>(
        &mut self,
        destination: &Path,
        segments: &[S],
        resume_from: usize,
        state: &Mutex<TranscriptionState>,
    ) -> Result<RunSummary, RunError> {
        fs::create_dir_all(destination).map_err(|source| RunError::Destination {
            path: destination.to_path_buf(),
            source,
        })?;
        *lock_state(state) = TranscriptionState::new(segments.len());

        let mut summary = RunSummary {
            skipped: resume_from.min(segments.len()),
            ..RunSummary::default()
        };
        info!(
            destination = %destination.display(),
            total = segments.len(),
            resume_from,
            "Starting transcription run"
        );

        for (index, segment) in segments.iter().enumerate().skip(resume_from) {
            if self.cancel.is_cancelled() {
                info!(next_index = index, "Run cancelled");
                self.engine.stop();
                return Err(RunError::Cancelled { next_index: index });
            }

            let text = segment.as_ref();
            let output = segment_path(destination, index);

            // Held across submit so a fast finish cannot be correlated
            // before its token is bound.
            let mut guard = lock_state(state);
            guard.record_text(index, text);
            match self.engine.submit(text, &output) {
                Ok(token) => {
                    guard.bind_token(&token, index)?;
                    debug!(index, %token, "Submitted segment");
                }
                Err(err) => {
                    if let Some(token) = &err.token {
                        guard.bind_token(token, index)?;
                    }
                    warn!(index, "Submission failed: {err}");
                    return Err(RunError::Submit {
                        index,
                        token: err.token,
                        message: err.message,
                    });
                }
            }
            drop(guard);

            summary.submitted += 1;
            summary.last_submitted = Some(index);
        }

        info!(
            submitted = summary.submitted,
            skipped = summary.skipped,
            "Transcription run submitted all segments"
        );
        Ok(summary)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::{EngineEvent, ListenerRegistry, SubmitError};
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Records submissions and, unless told otherwise, reports each one as
    /// finished right away.
    #[derive(Clone, Default)]
    pub(crate) struct MockEngine {
        pub(crate) requests: Arc<Mutex<Vec<(String, PathBuf)>>>,
        pub(crate) stops: Arc<Mutex<usize>>,
        pub(crate) registry: ListenerRegistry,
        pub(crate) fail_at: Option<usize>,
        pub(crate) fail_with_token: bool,
        pub(crate) silent: bool,
        pub(crate) duplicate_tokens: bool,
        /// Call whose outcome is an error event instead of a finish.
        pub(crate) error_at: Option<usize>,
        /// Emitted before every outcome event.
        pub(crate) stray_events: Vec<EngineEvent>,
    }

    impl MockEngine {
        pub(crate) fn requests(&self) -> Vec<(String, PathBuf)> {
            self.requests
                .lock()
                .expect("requests lock should be available")
                .clone()
        }

        pub(crate) fn stop_count(&self) -> usize {
            *self.stops.lock().expect("stops lock should be available")
        }
    }

    impl SynthesisEngine for MockEngine {
        fn submit(&mut self, text: &str, output: &Path) -> Result<Token, SubmitError> {
            let mut requests = self
                .requests
                .lock()
                .expect("requests lock should be available");
            let call = requests.len();
            let token = if self.duplicate_tokens {
                "same".to_string()
            } else {
                format!("mock-{call}")
            };
            if self.fail_at == Some(call) {
                return Err(SubmitError {
                    token: self.fail_with_token.then(|| token.clone()),
                    message: "mock engine refused".to_string(),
                });
            }
            requests.push((text.to_string(), output.to_path_buf()));
            for event in &self.stray_events {
                self.registry.emit(event.clone());
            }
            if self.error_at == Some(call) {
                self.registry.emit(EngineEvent::Error {
                    token: Some(token.clone()),
                    message: "voice crashed".to_string(),
                });
            } else if !self.silent {
                self.registry.emit(EngineEvent::Finish {
                    token: token.clone(),
                });
            }
            Ok(token)
        }

        fn stop(&mut self) {
            *self.stops.lock().expect("stops lock should be available") += 1;
        }

        fn listeners(&self) -> ListenerRegistry {
            self.registry.clone()
        }
    }

    pub(crate) fn temp_destination(label: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be after epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("book-to-audio-{label}-{nonce}"))
    }

    fn five_segments() -> Vec<String> {
        (0..5).map(|i| format!("Segment {i}.")).collect()
    }

    #[test]
    fn resumes_from_the_given_index() {
        let dest = temp_destination("runner-resume");
        let mut engine = MockEngine::default();
        let state = Mutex::new(TranscriptionState::default());

        let summary = Runner::new(&mut engine, CancellationToken::new())
            .run(&dest, &five_segments(), 2, &state)
            .unwrap();

        assert_eq!(
            summary,
            RunSummary {
                skipped: 2,
                submitted: 3,
                last_submitted: Some(4)
            }
        );
        let requests = engine.requests();
        let texts: Vec<&str> = requests.iter().map(|(text, _)| text.as_str()).collect();
        assert_eq!(texts, vec!["Segment 2.", "Segment 3.", "Segment 4."]);
        let files: Vec<PathBuf> = requests.iter().map(|(_, path)| path.clone()).collect();
        assert_eq!(
            files,
            vec![dest.join("2.wav"), dest.join("3.wav"), dest.join("4.wav")]
        );
        assert!(dest.is_dir());

        let state = lock_state(&state);
        assert_eq!(state.total_segments, 5);
        assert_eq!(state.index_of("mock-0"), Some(2));
        assert_eq!(state.index_of("mock-2"), Some(4));
        assert_eq!(state.text_of(3), Some("Segment 3."));
        assert_eq!(state.text_of(1), None);
        drop(state);

        let _ = fs::remove_dir_all(&dest);
    }

    #[test]
    fn resume_past_the_end_submits_nothing() {
        let dest = temp_destination("runner-done");
        let mut engine = MockEngine::default();
        let state = Mutex::new(TranscriptionState::default());
        let summary = Runner::new(&mut engine, CancellationToken::new())
            .run(&dest, &five_segments(), 5, &state)
            .unwrap();
        assert_eq!(summary.submitted, 0);
        assert_eq!(summary.last_submitted, None);
        assert!(engine.requests().is_empty());
        let _ = fs::remove_dir_all(&dest);
    }

    #[test]
    fn submit_failure_stops_and_keeps_token_binding() {
        let dest = temp_destination("runner-fail");
        let mut engine = MockEngine {
            fail_at: Some(1),
            fail_with_token: true,
            ..MockEngine::default()
        };
        let state = Mutex::new(TranscriptionState::default());

        let err = Runner::new(&mut engine, CancellationToken::new())
            .run(&dest, &five_segments(), 0, &state)
            .expect_err("second submission fails");

        match err {
            RunError::Submit {
                index,
                token,
                message,
            } => {
                assert_eq!(index, 1);
                assert_eq!(token.as_deref(), Some("mock-1"));
                assert_eq!(message, "mock engine refused");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let state = lock_state(&state);
        assert_eq!(state.index_of("mock-1"), Some(1));
        assert_eq!(state.text_of(1), Some("Segment 1."));
        assert_eq!(engine.requests().len(), 1);
        drop(state);
        let _ = fs::remove_dir_all(&dest);
    }

    #[test]
    fn cancellation_halts_before_next_submission() {
        let dest = temp_destination("runner-cancel");
        let mut engine = MockEngine::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let state = Mutex::new(TranscriptionState::default());

        let err = Runner::new(&mut engine, cancel)
            .run(&dest, &five_segments(), 3, &state)
            .expect_err("cancelled before start");
        assert!(matches!(err, RunError::Cancelled { next_index: 3 }));
        assert!(engine.requests().is_empty());
        assert_eq!(engine.stop_count(), 1);
        let _ = fs::remove_dir_all(&dest);
    }

    #[test]
    fn reused_token_for_another_segment_is_rejected() {
        let dest = temp_destination("runner-reuse");
        let mut engine = MockEngine {
            duplicate_tokens: true,
            silent: true,
            ..MockEngine::default()
        };
        let state = Mutex::new(TranscriptionState::default());
        let err = Runner::new(&mut engine, CancellationToken::new())
            .run(&dest, &five_segments(), 0, &state)
            .expect_err("duplicate token");
        assert!(matches!(
            err,
            RunError::TokenReused {
                existing: 0,
                index: 1,
                ..
            }
        ));
        let _ = fs::remove_dir_all(&dest);
    }

    #[test]
    fn destination_that_is_a_file_is_reported() {
        let dest = temp_destination("runner-file");
        fs::write(&dest, b"not a dir").expect("write blocking file");
        let mut engine = MockEngine::default();
        let state = Mutex::new(TranscriptionState::default());
        let err = Runner::new(&mut engine, CancellationToken::new())
            .run(&dest.join("out"), &five_segments(), 0, &state)
            .expect_err("cannot create under a file");
        assert!(matches!(err, RunError::Destination { .. }));
        let _ = fs::remove_file(&dest);
    }

    #[test]
    fn binding_same_token_twice_to_same_index_is_allowed() {
        let mut state = TranscriptionState::new(2);
        state.bind_token("t", 1).unwrap();
        state.bind_token("t", 1).unwrap();
        assert!(state.bind_token("t", 0).is_err());
        assert_eq!(state.index_of("t"), Some(1));
    }
}
