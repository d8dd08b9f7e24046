//! In-memory runner fakes shared by unit and integration tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{RunRequest, Runner, RunnerEvents, DISPOSED_MESSAGE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    Chunk {
        text: String,
        request_id: String,
        thinking: bool,
    },
    Complete {
        request_id: String,
    },
    Error {
        message: String,
        request_id: String,
    },
}

impl RecordedEvent {
    pub fn chunk(text: &str, request_id: &str, thinking: bool) -> Self {
        RecordedEvent::Chunk {
            text: text.to_string(),
            request_id: request_id.to_string(),
            thinking,
        }
    }

    pub fn complete(request_id: &str) -> Self {
        RecordedEvent::Complete {
            request_id: request_id.to_string(),
        }
    }

    pub fn error(message: &str, request_id: &str) -> Self {
        RecordedEvent::Error {
            message: message.to_string(),
            request_id: request_id.to_string(),
        }
    }
}

/// Records every callback for later assertions.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn snapshot(&self) -> Vec<RecordedEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn terminal_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    RecordedEvent::Complete { .. } | RecordedEvent::Error { .. }
                )
            })
            .count()
    }
}

impl RunnerEvents for RecordingEvents {
    fn on_chunk(&self, text: &str, request_id: &str, thinking: bool) {
        self.events
            .lock()
            .expect("events lock")
            .push(RecordedEvent::chunk(text, request_id, thinking));
    }

    fn on_complete(&self, request_id: &str) {
        self.events
            .lock()
            .expect("events lock")
            .push(RecordedEvent::complete(request_id));
    }

    fn on_error(&self, message: &str, request_id: &str) {
        self.events
            .lock()
            .expect("events lock")
            .push(RecordedEvent::error(message, request_id));
    }
}

/// Scripted behavior for [`MockRunner`].
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Emit one `echo: <prompt>` chunk, then complete.
    Echo,
    /// Emit nothing and wait to be killed.
    Silent,
    /// Fail immediately with the given message.
    Fail(String),
    /// Emit nothing while running; when the kill arrives, a completion is
    /// already in flight and fires anyway. Models a natural completion
    /// racing an explicit cancel for the same id.
    CompleteOnKill,
}

/// Synchronous in-memory runner that records its inputs; the factory test
/// seam substitutes it for the real providers.
pub struct MockRunner {
    behavior: MockBehavior,
    runs: Mutex<Vec<RunRequest>>,
    kills: AtomicUsize,
    disposed: AtomicBool,
    pending: Mutex<Option<(String, Arc<dyn RunnerEvents>)>>,
}

impl MockRunner {
    pub fn new(behavior: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            runs: Mutex::new(Vec::new()),
            kills: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            pending: Mutex::new(None),
        })
    }

    pub fn runs(&self) -> Vec<RunRequest> {
        self.runs.lock().expect("runs lock").clone()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().expect("runs lock").len()
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runner for MockRunner {
    async fn run(&self, request: RunRequest, events: Arc<dyn RunnerEvents>) {
        if self.disposed.load(Ordering::SeqCst) {
            events.on_error(DISPOSED_MESSAGE, &request.request_id);
            return;
        }
        let request_id = request.request_id.clone();
        let prompt = request.prompt.clone();
        self.runs.lock().expect("runs lock").push(request);

        match &self.behavior {
            MockBehavior::Echo => {
                events.on_chunk(&format!("echo: {prompt}"), &request_id, false);
                events.on_complete(&request_id);
            }
            MockBehavior::Silent => {}
            MockBehavior::Fail(message) => {
                events.on_error(message, &request_id);
            }
            MockBehavior::CompleteOnKill => {
                *self.pending.lock().expect("pending lock") = Some((request_id, events));
            }
        }
    }

    async fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        let pending = self.pending.lock().expect("pending lock").take();
        if let Some((request_id, events)) = pending {
            events.on_complete(&request_id);
        }
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.kill().await;
    }
}
