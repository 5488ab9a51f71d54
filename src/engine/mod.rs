//! The contract between the transcription runner and a speech engine.
//!
//! Submitting text returns a correlation token once the engine has taken the
//! request; the outcome arrives later as an [`EngineEvent`] carrying that
//! token, delivered to every receiver registered on the engine's
//! [`ListenerRegistry`].

pub mod command;

use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::trace;

pub use command::CommandEngine;

/// Opaque identifier the engine hands out per submission.
pub type Token = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Finish {
        token: Token,
    },
    Error {
        token: Option<Token>,
        message: String,
    },
    Cancel {
        message: String,
    },
    Progress {
        token: Token,
        chars_spoken: usize,
    },
}

/// A rejected submission. Some engines assign a token before failing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct SubmitError {
    pub token: Option<Token>,
    pub message: String,
}

pub trait SynthesisEngine {
    /// Hand `text` to the engine for synthesis into `output`.
    ///
    /// Blocks until every earlier request has settled, so a caller
    /// submitting in a loop never has more than one request in flight.
    fn submit(&mut self, text: &str, output: &Path) -> Result<Token, SubmitError>;

    /// Abandon the request in flight. It may still report, typically with
    /// a cancel event.
    fn stop(&mut self);

    fn listeners(&self) -> ListenerRegistry;
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    senders: Vec<(u64, Sender<EngineEvent>)>,
}

/// Shared fan-out of engine events. Clones refer to the same set of
/// listeners.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<Listeners>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. It stays registered until the guard is dropped.
    pub fn register(&self) -> (ListenerGuard, Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel();
        let mut listeners = self.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.senders.push((id, tx));
        trace!(id, "Registered engine listener");
        let guard = ListenerGuard {
            registry: self.clone(),
            id,
        };
        (guard, rx)
    }

    /// Deliver `event` to every listener. Returns how many received it.
    pub fn emit(&self, event: EngineEvent) -> usize {
        let mut listeners = self.lock();
        listeners
            .senders
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
        listeners.senders.len()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().senders.len()
    }

    fn deregister(&self, id: u64) {
        self.lock().senders.retain(|(existing, _)| *existing != id);
        trace!(id, "Deregistered engine listener");
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps one listener registered. Dropping it removes the listener, which
/// also disconnects its receiver.
pub struct ListenerGuard {
    registry: ListenerRegistry,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::TryRecvError;

    #[test]
    fn events_reach_every_registered_listener() {
        let registry = ListenerRegistry::new();
        let (_a, rx_a) = registry.register();
        let (_b, rx_b) = registry.register();

        let event = EngineEvent::Finish {
            token: "t1".to_string(),
        };
        assert_eq!(registry.emit(event.clone()), 2);
        assert_eq!(rx_a.try_recv().unwrap(), event);
        assert_eq!(rx_b.try_recv().unwrap(), event);
    }

    #[test]
    fn dropping_the_guard_deregisters_and_disconnects() {
        let registry = ListenerRegistry::new();
        let (guard, rx) = registry.register();
        assert_eq!(registry.listener_count(), 1);

        drop(guard);
        assert_eq!(registry.listener_count(), 0);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
        assert_eq!(
            registry.emit(EngineEvent::Cancel {
                message: "late".to_string()
            }),
            0
        );
    }

    #[test]
    fn guard_only_removes_its_own_listener() {
        let registry = ListenerRegistry::new();
        let (first, _rx_first) = registry.register();
        let (_second, rx_second) = registry.register();
        drop(first);

        assert_eq!(registry.listener_count(), 1);
        registry.emit(EngineEvent::Progress {
            token: "t".to_string(),
            chars_spoken: 3,
        });
        assert!(rx_second.try_recv().is_ok());
    }

    #[test]
    fn dropped_receivers_are_pruned_on_emit() {
        let registry = ListenerRegistry::new();
        let (_guard, rx) = registry.register();
        drop(rx);
        assert_eq!(
            registry.emit(EngineEvent::Finish {
                token: "t".to_string()
            }),
            0
        );
        assert_eq!(registry.listener_count(), 0);
    }
}
