//! Event Stream Implementation
//!
//! Single-producer, multi-consumer bridge between a protocol decoder and the
//! callers waiting on a chat reply. Every event is buffered so late readers
//! replay the full history before receiving live events.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

// ============================================================================
// Canonical Events
// ============================================================================

/// Canonical chat output event
///
/// A well-formed stream is zero or more `Message` events followed by exactly
/// one `Done` or `Error`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ChatEvent {
    /// A fragment of the reply
    Message {
        /// Text fragment
        content: String,
    },
    /// Reply finished successfully
    Done {
        /// Trailing content, usually empty
        content: String,
    },
    /// Reply failed
    Error {
        /// Human-readable failure description
        error: String,
    },
}

impl ChatEvent {
    /// Whether this event ends the reply
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Aggregated reply for non-streaming callers
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Concatenated message fragments
    pub content: String,
    /// Set when the reply ended with an error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// EventStream
// ============================================================================

#[derive(Default)]
struct StreamState {
    history: Vec<ChatEvent>,
    subscribers: Vec<mpsc::UnboundedSender<ChatEvent>>,
    terminated: bool,
    ended: bool,
}

/// Shared handle to one chat reply
///
/// Cloning yields another handle to the same stream. Writes after `end()` or
/// after a terminal event are dropped.
#[derive(Clone, Default)]
pub struct EventStream {
    inner: Arc<Mutex<StreamState>>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("EventStream")
            .field("events", &state.history.len())
            .field("terminated", &state.terminated)
            .field("ended", &state.ended)
            .finish()
    }
}

impl EventStream {
    /// Create an empty, open stream
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event
    ///
    /// Returns `false` if the event was dropped because the stream is closed
    /// or already carries its terminal event.
    pub fn write(&self, event: ChatEvent) -> bool {
        let mut state = self.inner.lock();
        if state.ended || state.terminated {
            tracing::trace!(?event, "write to closed event stream ignored");
            return false;
        }
        if event.is_terminal() {
            state.terminated = true;
        }
        state
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
        state.history.push(event);
        true
    }

    /// Write a message fragment
    pub fn message(&self, content: impl Into<String>) -> bool {
        self.write(ChatEvent::Message {
            content: content.into(),
        })
    }

    /// Write the `done` terminal event
    pub fn done(&self, content: impl Into<String>) -> bool {
        self.write(ChatEvent::Done {
            content: content.into(),
        })
    }

    /// Write the `error` terminal event
    pub fn error(&self, error: impl Into<String>) -> bool {
        self.write(ChatEvent::Error {
            error: error.into(),
        })
    }

    /// Write `done` with no trailing content and close
    pub fn finish(&self) {
        self.done("");
        self.end();
    }

    /// Write `error` and close
    pub fn fail(&self, error: impl Into<String>) {
        self.error(error);
        self.end();
    }

    /// Close the stream; idempotent
    pub fn end(&self) {
        let mut state = self.inner.lock();
        if state.ended {
            return;
        }
        state.ended = true;
        // Dropping the senders completes every subscriber after its backlog.
        state.subscribers.clear();
    }

    /// Whether `end()` has been called
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.inner.lock().ended
    }

    /// Whether a terminal event has been written
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.lock().terminated
    }

    /// Snapshot of every event written so far
    #[must_use]
    pub fn events(&self) -> Vec<ChatEvent> {
        self.inner.lock().history.clone()
    }

    /// Subscribe to the stream
    ///
    /// The reader first yields every buffered event, then live events, and
    /// completes once the stream is closed.
    #[must_use]
    pub fn subscribe(&self) -> EventReader {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        for event in &state.history {
            // Receiver is still in scope, send cannot fail.
            let _ = tx.send(event.clone());
        }
        if !state.ended {
            state.subscribers.push(tx);
        }
        EventReader { rx }
    }

    /// Register callbacks invoked for every event and once at close
    ///
    /// Callbacks run on a spawned task, so this must be called inside a Tokio
    /// runtime.
    pub fn read<E, C>(&self, mut on_event: E, on_end: C) -> JoinHandle<()>
    where
        E: FnMut(ChatEvent) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let mut reader = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = reader.next().await {
                on_event(event);
            }
            on_end();
        })
    }

    /// Aggregate the reply into a single response
    ///
    /// Stops at the terminal event, or when the stream closes without one.
    pub async fn collect(&self) -> ChatResponse {
        let mut reader = self.subscribe();
        let mut response = ChatResponse::default();
        while let Some(event) = reader.next().await {
            match event {
                ChatEvent::Message { content } => response.content.push_str(&content),
                ChatEvent::Done { content } => {
                    response.content.push_str(&content);
                    break;
                }
                ChatEvent::Error { error } => {
                    response.error = Some(error);
                    break;
                }
            }
        }
        response
    }
}

// ============================================================================
// EventReader
// ============================================================================

/// Async reader over one subscription
#[derive(Debug)]
pub struct EventReader {
    rx: mpsc::UnboundedReceiver<ChatEvent>,
}

impl EventReader {
    /// Next event, or `None` once the stream is closed and drained
    pub async fn next(&mut self) -> Option<ChatEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already buffered
    pub fn try_next(&mut self) -> Option<ChatEvent> {
        self.rx.try_recv().ok()
    }

    /// Convert into a `Stream` of events
    #[must_use]
    pub fn into_stream(self) -> UnboundedReceiverStream<ChatEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}
