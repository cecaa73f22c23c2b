//! Stream consumer
//!
//! Drives one network call per user turn and folds the streamed body into
//! the turn's bot placeholder, chunk by chunk.
//!
//! Phases of a turn: `Idle -> Sending -> Streaming -> {Completed, Cancelled,
//! Failed} -> Idle`. The stop handle cancels whichever of the two waits
//! (response headers, next chunk) is in progress.

mod decoder;
mod error;
pub mod transport;

pub use decoder::Utf8Accumulator;
pub use error::{StreamError, StreamErrorKind};
pub use transport::{
    read_next, ChatTransport, ChunkStream, ReadOutcome, RelayRequest, RelayTransport,
};

use crate::store::{ConversationStore, TurnSlot};
use crate::upstream::SessionPolicy;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Appended to a response the user stopped
pub const STOP_MARKER: &str = "\n\n⛔ **Stopped by user**";

/// Shown in place of a response when there was nothing to stream
pub const NO_STREAM_TEXT: &str = "⚠️ No response stream.";

/// Where a turn is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Sending,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl TurnPhase {
    /// The "is generating" flag: input disabled, stop control shown
    pub fn is_loading(self) -> bool {
        matches!(self, Self::Sending | Self::Streaming)
    }
}

/// How a call to [`StreamConsumer::send`] ended
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Completed,
    Cancelled,
    Failed(StreamError),
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Text was empty after trimming
    EmptyInput,
    /// Another turn is still in flight
    Busy,
}

struct TurnState {
    /// Cancellation handle of the in-flight turn, if any
    current: Mutex<Option<CancellationToken>>,
    phase: watch::Sender<TurnPhase>,
}

impl TurnState {
    fn current(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: TurnPhase) {
        self.phase.send_replace(phase);
    }
}

/// Holds the turn slot. Dropping it clears the in-flight token and returns
/// the phase to `Idle`, also when the `send` future is dropped mid-turn.
struct TurnGuard {
    state: Arc<TurnState>,
    cancel: CancellationToken,
    /// Terminal phase published before `Idle`
    phase: TurnPhase,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        *self.state.current() = None;
        self.state.set_phase(self.phase);
        self.state.set_phase(TurnPhase::Idle);
    }
}

/// Cancels the in-flight turn from anywhere
#[derive(Clone)]
pub struct StopHandle {
    state: Arc<TurnState>,
}

impl StopHandle {
    /// Request cancellation. Returns false (and does nothing) when no turn is
    /// in flight.
    pub fn stop(&self) -> bool {
        match self.state.current().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.state.phase.borrow().is_loading()
    }
}

/// Runs user turns against a transport, writing into a conversation store
pub struct StreamConsumer<T: ChatTransport> {
    store: ConversationStore,
    transport: Arc<T>,
    session_policy: SessionPolicy,
    state: Arc<TurnState>,
}

impl<T: ChatTransport> Clone for StreamConsumer<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            transport: self.transport.clone(),
            session_policy: self.session_policy,
            state: self.state.clone(),
        }
    }
}

impl<T: ChatTransport> StreamConsumer<T> {
    pub fn new(store: ConversationStore, transport: T) -> Self {
        let (phase, _) = watch::channel(TurnPhase::Idle);
        Self {
            store,
            transport: Arc::new(transport),
            session_policy: SessionPolicy::default(),
            state: Arc::new(TurnState {
                current: Mutex::new(None),
                phase,
            }),
        }
    }

    /// Whether requests carry the conversation id as the upstream session
    pub fn with_session_policy(mut self, policy: SessionPolicy) -> Self {
        self.session_policy = policy;
        self
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            state: self.state.clone(),
        }
    }

    pub fn phase(&self) -> TurnPhase {
        *self.state.phase.borrow()
    }

    pub fn is_loading(&self) -> bool {
        self.phase().is_loading()
    }

    /// Observe phase changes
    pub fn watch_phase(&self) -> watch::Receiver<TurnPhase> {
        self.state.phase.subscribe()
    }

    /// Run one user turn to the end
    pub async fn send(&self, text: &str) -> TurnOutcome {
        if text.trim().is_empty() {
            return TurnOutcome::Rejected(RejectReason::EmptyInput);
        }

        let cancel = CancellationToken::new();
        {
            let mut current = self.state.current();
            if current.is_some() {
                tracing::debug!("Rejecting message while a turn is in flight");
                return TurnOutcome::Rejected(RejectReason::Busy);
            }
            *current = Some(cancel.clone());
        }
        // A dropped future ends the turn as cancelled
        let mut guard = TurnGuard {
            state: self.state.clone(),
            cancel: cancel.clone(),
            phase: TurnPhase::Cancelled,
        };
        self.state.set_phase(TurnPhase::Sending);

        let outcome = self.run_turn(text, &cancel).await;

        guard.phase = match &outcome {
            TurnOutcome::Completed => TurnPhase::Completed,
            TurnOutcome::Cancelled => TurnPhase::Cancelled,
            TurnOutcome::Failed(_) | TurnOutcome::Rejected(_) => TurnPhase::Failed,
        };
        drop(guard);
        outcome
    }

    async fn run_turn(&self, text: &str, cancel: &CancellationToken) -> TurnOutcome {
        let start = Instant::now();

        let slot = match self.store.begin_turn(text) {
            Ok(slot) => slot,
            Err(e) => {
                tracing::error!(error = %e, "Failed to record user message");
                return TurnOutcome::Failed(StreamError::storage(e.to_string()));
            }
        };

        let request = RelayRequest {
            messages: slot.history.clone(),
            session_id: match self.session_policy {
                SessionPolicy::PerConversation => Some(slot.conversation_id.clone()),
                SessionPolicy::PerRequest => None,
            },
        };

        tracing::info!(
            conv_id = %slot.conversation_id,
            history_len = request.messages.len(),
            "Turn started"
        );

        let opened = tokio::select! {
            biased;

            () = cancel.cancelled() => None,

            result = self.transport.open(&request) => Some(result),
        };

        let mut stream = match opened {
            None => {
                tracing::info!(conv_id = %slot.conversation_id, "Turn cancelled before response");
                self.flush(&slot, STOP_MARKER.trim_start());
                return TurnOutcome::Cancelled;
            }
            Some(Err(e)) => {
                tracing::warn!(
                    conv_id = %slot.conversation_id,
                    error = %e,
                    "Failed to open response stream"
                );
                self.flush(&slot, &failure_text(&e));
                return TurnOutcome::Failed(e);
            }
            Some(Ok(stream)) => stream,
        };

        self.state.set_phase(TurnPhase::Streaming);

        let mut acc = Utf8Accumulator::new();
        let mut flushed = 0;
        let outcome = loop {
            match read_next(&mut stream, cancel).await {
                ReadOutcome::Chunk(bytes) => {
                    acc.push(&bytes);
                    if acc.len() != flushed {
                        self.flush(&slot, acc.text());
                        flushed = acc.len();
                    }
                }
                ReadOutcome::Done => {
                    acc.finish();
                    if acc.len() != flushed {
                        self.flush(&slot, acc.text());
                    }
                    break TurnOutcome::Completed;
                }
                ReadOutcome::Cancelled => {
                    acc.push_str(STOP_MARKER);
                    self.flush(&slot, acc.text());
                    break TurnOutcome::Cancelled;
                }
                ReadOutcome::Failed(e) => {
                    // Partial text stays as it is
                    acc.finish();
                    if acc.len() != flushed {
                        self.flush(&slot, acc.text());
                    }
                    break TurnOutcome::Failed(e);
                }
            }
        };

        match &outcome {
            TurnOutcome::Failed(e) => tracing::warn!(
                conv_id = %slot.conversation_id,
                bytes = acc.len(),
                duration_ms = %start.elapsed().as_millis(),
                error = %e,
                "Turn failed mid-stream"
            ),
            _ => tracing::info!(
                conv_id = %slot.conversation_id,
                bytes = acc.len(),
                duration_ms = %start.elapsed().as_millis(),
                cancelled = matches!(outcome, TurnOutcome::Cancelled),
                "Turn finished"
            ),
        }
        outcome
    }

    fn flush(&self, slot: &TurnSlot, text: &str) {
        match self.store.patch_turn(slot, text) {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                conv_id = %slot.conversation_id,
                "Placeholder is no longer the last message, dropping update"
            ),
            Err(e) => tracing::error!(error = %e, "Failed to persist streamed text"),
        }
    }
}

/// Text shown in place of a response that never started
fn failure_text(e: &StreamError) -> String {
    match e.kind {
        StreamErrorKind::NoBody => NO_STREAM_TEXT.to_string(),
        _ => format!("⚠️ Error: {}", e.message),
    }
}
