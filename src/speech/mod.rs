mod engines;

pub use engines::{
    engine_from_config, FallbackSynthesis, LocalSynthesis, RenderedAudioSynthesis, SpeechEngine,
};

use crate::telemetry::Metrics;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{broadcast, Semaphore},
};

#[derive(Error, Debug)]
pub enum SpeechError {
    #[error("Speech is not supported: {0}")]
    Unsupported(String),
    #[error("Nothing to say")]
    EmptyText,
    #[error("Speech process failed: {0}")]
    Process(String),
    #[error("Speech request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Speech io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("All speech engines failed (primary: {primary}, fallback: {fallback})")]
    AllEnginesFailed {
        primary: Box<SpeechError>,
        fallback: Box<SpeechError>,
    },
}

const IDLE: u64 = 0;

/// Process-wide speaking state.
///
/// `active` holds the id of the utterance that currently owns the session, or 0.
/// A falling edge clears it without waiting for the audio, so a stale utterance
/// can still be playing while a new one starts. Completion only clears the
/// session if it still belongs to the finishing utterance.
#[derive(Debug, Default)]
pub struct SpeechSession {
    active: AtomicU64,
    next_id: AtomicU64,
    current_label: Mutex<String>,
}

impl SpeechSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_speaking(&self) -> bool {
        self.active.load(Ordering::Acquire) != IDLE
    }

    #[cfg(test)]
    pub fn current_label(&self) -> String {
        self.current_label.lock().clone()
    }

    fn try_begin(&self, label: &str) -> Option<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.active
            .compare_exchange(IDLE, id, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        *self.current_label.lock() = label.to_string();
        Some(id)
    }

    fn finish(&self, id: u64) -> bool {
        self.active
            .compare_exchange(id, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn force_idle(&self) {
        self.active.store(IDLE, Ordering::Release);
    }
}

/// Runs utterances as tokio tasks, at most `max_concurrent` at once.
pub struct SpeechWorker {
    engine: Arc<dyn SpeechEngine>,
    permits: Arc<Semaphore>,
    runtime: Handle,
    shutdown: broadcast::Sender<()>,
    metrics: Arc<Metrics>,
}

impl SpeechWorker {
    pub fn new(
        engine: Arc<dyn SpeechEngine>,
        max_concurrent: usize,
        runtime: Handle,
        shutdown: broadcast::Sender<()>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            runtime,
            shutdown,
            metrics,
        }
    }

    fn dispatch(&self, session: Arc<SpeechSession>, id: u64, label: String) -> bool {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!("Speech pool is full, dropping utterance {:?}", label);
                self.metrics.record_utterance("dropped");
                return false;
            }
        };

        let engine = self.engine.clone();
        let metrics = self.metrics.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        self.runtime.spawn(async move {
            let _permit = permit;
            tokio::select! {
                result = engine.speak(&label) => match result {
                    Ok(()) => {
                        tracing::info!("Spoke {:?} with {} engine", label, engine.name());
                        metrics.record_utterance("spoken");
                    }
                    Err(e) => {
                        tracing::error!("Failed to speak {:?}: {}", label, e);
                        metrics.record_utterance("failed");
                    }
                },
                _ = shutdown_rx.recv() => {
                    tracing::info!("Utterance {} cancelled by shutdown", id);
                }
            }

            if !session.finish(id) {
                tracing::debug!("Utterance {} finished after the session moved on", id);
            }
        });
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEvent {
    Unchanged,
    Triggered(String),
    /// A rising edge arrived while another utterance owns the session.
    Suppressed,
    /// A rising edge arrived but speech is disabled.
    Muted,
    Reset,
}

/// Per-stream edge detector in front of the shared session.
pub struct SpeechNotifier {
    session: Arc<SpeechSession>,
    worker: Option<Arc<SpeechWorker>>,
    previous_present: bool,
}

impl SpeechNotifier {
    pub fn new(session: Arc<SpeechSession>, worker: Option<Arc<SpeechWorker>>) -> Self {
        Self {
            session,
            worker,
            previous_present: false,
        }
    }

    /// `primary` is the label to announce for this frame, `None` when nothing was retained.
    pub fn observe(&mut self, primary: Option<&str>) -> SpeechEvent {
        let was_present = std::mem::replace(&mut self.previous_present, primary.is_some());

        match (was_present, primary) {
            (false, Some(label)) => self.trigger(label),
            (true, None) => {
                self.session.force_idle();
                SpeechEvent::Reset
            }
            _ => SpeechEvent::Unchanged,
        }
    }

    fn trigger(&self, label: &str) -> SpeechEvent {
        let Some(worker) = &self.worker else {
            return SpeechEvent::Muted;
        };

        let Some(id) = self.session.try_begin(label) else {
            tracing::debug!("Already speaking, suppressing {:?}", label);
            return SpeechEvent::Suppressed;
        };

        if worker.dispatch(self.session.clone(), id, label.to_string()) {
            SpeechEvent::Triggered(label.to_string())
        } else {
            self.session.finish(id);
            SpeechEvent::Suppressed
        }
    }
}
