//! End-to-end tests for the chunked-stream backend
//!
//! These drive [`OpenAiCompatBackend`] through a scripted transport and check
//! the canonical event sequence callers observe:
//! - Concatenated content for a well-formed reply
//! - A single terminal error for a malformed chunk
//! - Chunk boundaries that cut through characters and `\r\n` pairs
//! - Graceful degradation when the pool is exhausted
//! - Routing through the registry

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use gateway_core::backend::transport::ByteStream;
use gateway_core::backend::{
    ChatBackend, ChatRequest, ChunkTransport, ModelType, OpenAiCompatBackend, OpenAiCompatConfig,
    TransportRequest, OPENAI_COMPAT,
};
use gateway_core::{BackendRegistry, ChatEvent, Credential, CredentialPool, EventStream, PoolConfig, Result};

// =============================================================================
// Scripted Transport
// =============================================================================

/// Replays one body per request, each as a list of network reads
#[derive(Default)]
struct ScriptedTransport {
    bodies: Mutex<VecDeque<Vec<Vec<u8>>>>,
    sent: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    fn new(bodies: Vec<Vec<Vec<u8>>>) -> Self {
        Self {
            bodies: Mutex::new(bodies.into()),
            sent: Mutex::default(),
        }
    }
}

#[async_trait]
impl ChunkTransport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> Result<ByteStream> {
        self.sent.lock().push(request);
        let reads = self.bodies.lock().pop_front().unwrap_or_default();
        let items: Vec<Result<Bytes>> = reads.into_iter().map(|r| Ok(Bytes::from(r))).collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

fn chunk(content: &str) -> Vec<u8> {
    format!(
        "data: {}\n\n",
        serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
    )
    .into_bytes()
}

fn done() -> Vec<u8> {
    b"data: [DONE]\n\n".to_vec()
}

fn backend(bodies: Vec<Vec<Vec<u8>>>, tokens: &[&str]) -> (OpenAiCompatBackend, Arc<ScriptedTransport>) {
    let pool = CredentialPool::new(OPENAI_COMPAT, PoolConfig::default());
    pool.seed(tokens.iter().map(|t| Credential::new(*t)));
    let transport = Arc::new(ScriptedTransport::new(bodies));
    let backend = OpenAiCompatBackend::new(
        OpenAiCompatConfig::default(),
        Arc::new(pool),
        Arc::clone(&transport) as Arc<dyn ChunkTransport>,
    );
    (backend, transport)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_two_chunks_then_sentinel() {
    let (backend, transport) = backend(vec![vec![chunk("Hello"), chunk(", world"), done()]], &["tok"]);

    assert_eq!(backend.support(ModelType::Gpt4), 5000);

    let response = backend.ask(ChatRequest::new("hi", ModelType::Gpt4)).await;
    assert_eq!(response.content, "Hello, world");
    assert!(response.error.is_none());

    let sent = transport.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body["stream"], true);
}

#[tokio::test]
async fn test_missing_choices_yields_single_error() {
    let malformed = b"data: {\"object\":\"error\",\"message\":\"quota\"}\n\n".to_vec();
    let (backend, _) = backend(vec![vec![malformed, chunk("ignored"), done()]], &["tok"]);

    let stream = EventStream::new();
    let mut reader = stream.subscribe();
    backend
        .ask_stream(ChatRequest::new("hi", ModelType::Gpt4), stream.clone())
        .await;

    let mut events = Vec::new();
    while let Some(event) = reader.next().await {
        events.push(event);
    }

    assert_eq!(events.len(), 1, "expected exactly one event, got {events:?}");
    assert!(matches!(events[0], ChatEvent::Error { .. }));
    assert!(stream.is_ended());

    let buffered = stream.collect().await;
    assert!(buffered.error.is_some());
    assert!(buffered.content.is_empty());
}

#[tokio::test]
async fn test_reads_split_through_characters() {
    let mut body = chunk("héllo wörld");
    body.extend(b"data: [DONE]\r\n\r\n");

    // Cut inside the two-byte 'é' and between every CR/LF.
    let accent = body.iter().position(|b| *b == 0xC3).unwrap();
    let mut reads = vec![body[..=accent].to_vec()];
    reads.extend(body[accent + 1..].chunks(3).map(<[u8]>::to_vec));

    let (backend, _) = backend(vec![reads], &["tok"]);
    let response = backend.ask(ChatRequest::new("hi", ModelType::Gpt35Turbo)).await;

    assert_eq!(response.content, "héllo wörld");
    assert!(response.error.is_none());
}

#[tokio::test]
async fn test_exhausted_pool_degrades_gracefully() {
    let (backend, transport) = backend(vec![], &[]);

    let response = backend.ask(ChatRequest::new("hi", ModelType::Gpt4)).await;

    assert_eq!(response.error.as_deref(), Some("openai-compat pool exhausted"));
    assert!(transport.sent.lock().is_empty());
}

#[tokio::test]
async fn test_registry_routes_to_chunked_backend() {
    let (backend, _) = backend(vec![vec![chunk("routed"), done()]], &["tok"]);
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(backend));

    let chosen = registry.route(ModelType::Gpt35Turbo16k).unwrap();
    assert_eq!(chosen.name(), OPENAI_COMPAT);
    assert!(registry.route(ModelType::Llama31_8b).is_none());

    let response = chosen.ask(ChatRequest::new("hi", ModelType::Gpt35Turbo16k)).await;
    assert_eq!(response.content, "routed");
}
