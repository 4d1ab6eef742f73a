//! Shared test doubles for unit tests.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::backend::automation::{AutomationLauncher, AutomationSession, LaunchOptions};
use crate::backend::transport::{ByteStream, ChunkTransport, TransportRequest};
use crate::error::{GatewayError, Result};
use crate::pool::{Cookie, Credential, WorkerFactory};

// ============================================================================
// Byte bodies and frames
// ============================================================================

/// One SSE data chunk carrying `content`
pub fn sse(content: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
    )
}

/// Body yielding each string as one network read
pub fn body_from(chunks: Vec<String>) -> ByteStream {
    Box::pin(futures::stream::iter(
        chunks.into_iter().map(|c| Ok(Bytes::from(c))),
    ))
}

/// Socket frame carrying a cumulative answer and optional sources
pub fn answer_frame(kind: &str, answer: &str, sources: &[(&str, &str)]) -> String {
    let web_results: Vec<_> = sources
        .iter()
        .map(|(name, url)| serde_json::json!({ "name": name, "url": url }))
        .collect();
    let text = serde_json::json!({ "answer": answer, "web_results": web_results }).to_string();
    format!("42{}", serde_json::json!([kind, { "text": text }]))
}

// ============================================================================
// Worker factory
// ============================================================================

#[derive(Debug)]
pub struct MockWorker {
    pub generation: usize,
}

#[derive(Default)]
struct FactoryCounters {
    initialized: AtomicUsize,
    recycled: AtomicUsize,
    shut_down: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MockFactory {
    init_delay: Duration,
    fail_with: Option<fn() -> GatewayError>,
    counters: Arc<FactoryCounters>,
}

impl MockFactory {
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    pub fn failing_init(mut self, make: fn() -> GatewayError) -> Self {
        self.fail_with = Some(make);
        self
    }

    pub fn initialized(&self) -> usize {
        self.counters.initialized.load(Ordering::SeqCst)
    }

    pub fn recycled(&self) -> usize {
        self.counters.recycled.load(Ordering::SeqCst)
    }

    pub fn shut_down(&self) -> usize {
        self.counters.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerFactory for MockFactory {
    type Worker = MockWorker;

    async fn initialize(&self, _credential: &mut Credential) -> Result<MockWorker> {
        let generation = self.counters.initialized.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.init_delay.is_zero() {
            tokio::time::sleep(self.init_delay).await;
        }
        match self.fail_with {
            Some(make) => Err(make()),
            None => Ok(MockWorker { generation }),
        }
    }

    async fn recycle(&self, _worker: &MockWorker, credential: &mut Credential) -> Result<()> {
        self.counters.recycled.fetch_add(1, Ordering::SeqCst);
        credential.model = None;
        Ok(())
    }

    async fn shutdown(&self, _worker: Arc<MockWorker>) {
        self.counters.shut_down.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Canned upstream reply
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Successful streaming body, one read per string
    Body(Vec<String>),
    /// Non-success status
    Status(u16, String),
    /// Body that never produces data
    Stall,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    requests: Arc<Mutex<Vec<TransportRequest>>>,
}

impl MockTransport {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            requests: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChunkTransport for MockTransport {
    async fn send(&self, request: TransportRequest) -> Result<ByteStream> {
        self.requests.lock().push(request);
        match self.replies.lock().pop_front() {
            Some(MockReply::Body(chunks)) => Ok(body_from(chunks)),
            Some(MockReply::Status(status, body)) => Err(GatewayError::from_status(status, &body)),
            Some(MockReply::Stall) => Ok(Box::pin(futures::stream::pending())),
            None => Err(GatewayError::Upstream("no reply scripted".into())),
        }
    }
}

// ============================================================================
// Automation
// ============================================================================

#[derive(Default)]
struct SessionState {
    elements: HashSet<String>,
    typed: Vec<(String, String)>,
    clicks: Vec<String>,
    navigations: Vec<String>,
    cookies: Vec<Cookie>,
    evaluations: Vec<(String, serde_json::Value)>,
    screenshots: Vec<PathBuf>,
    reloads: usize,
    closed: bool,
    frame_tx: Option<mpsc::Sender<String>>,
    reply_frames: Vec<String>,
}

/// Scriptable in-memory page
#[derive(Clone, Default)]
pub struct MockSession {
    state: Arc<Mutex<SessionState>>,
}

impl MockSession {
    pub fn with_element(self, selector: &str) -> Self {
        self.state.lock().elements.insert(selector.to_string());
        self
    }

    /// Script result for any evaluated script containing `needle`
    pub fn with_evaluation(self, needle: &str, value: serde_json::Value) -> Self {
        self.state.lock().evaluations.push((needle.to_string(), value));
        self
    }

    /// Frames delivered to the interceptor when Enter is pressed
    pub fn with_reply_frames(self, frames: Vec<String>) -> Self {
        self.state.lock().reply_frames = frames;
        self
    }

    pub fn remove_element(&self, selector: &str) {
        self.state.lock().elements.remove(selector);
    }

    pub fn typed(&self) -> Vec<(String, String)> {
        self.state.lock().typed.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.state.lock().clicks.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().navigations.clone()
    }

    pub fn screenshots(&self) -> Vec<PathBuf> {
        self.state.lock().screenshots.clone()
    }

    pub fn reloads(&self) -> usize {
        self.state.lock().reloads
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl AutomationSession for MockSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.state.lock().navigations.push(url.to_string());
        Ok(())
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<()> {
        self.state.lock().cookies.extend_from_slice(cookies);
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>> {
        Ok(self.state.lock().cookies.clone())
    }

    async fn wait_for(&self, selector: &str, _timeout: Duration) -> Result<()> {
        if self.state.lock().elements.contains(selector) {
            Ok(())
        } else {
            Err(GatewayError::Automation(format!("timed out waiting for {selector}")))
        }
    }

    async fn exists(&self, selector: &str) -> Result<bool> {
        Ok(self.state.lock().elements.contains(selector))
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.state.lock().clicks.push(selector.to_string());
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        Ok(self
            .state
            .lock()
            .evaluations
            .iter()
            .find(|(needle, _)| script.contains(needle.as_str()))
            .map_or(serde_json::Value::Null, |(_, value)| value.clone()))
    }

    async fn insert_text(&self, selector: &str, text: &str) -> Result<()> {
        self.state
            .lock()
            .typed
            .push((selector.to_string(), text.to_string()));
        Ok(())
    }

    async fn press_enter(&self) -> Result<()> {
        let (tx, frames) = {
            let state = self.state.lock();
            (state.frame_tx.clone(), state.reply_frames.clone())
        };
        if let Some(tx) = tx {
            for frame in frames {
                let _ = tx.send(frame).await;
            }
        }
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.state.lock().reloads += 1;
        Ok(())
    }

    async fn screenshot(&self, path: &Path) -> Result<()> {
        self.state.lock().screenshots.push(path.to_path_buf());
        Ok(())
    }

    async fn intercept_frames(&self) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(64);
        self.state.lock().frame_tx = Some(tx);
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.frame_tx = None;
        Ok(())
    }
}

/// Launcher handing out clones of one scripted session
#[derive(Clone, Default)]
pub struct MockLauncher {
    session: MockSession,
    launches: Arc<Mutex<Vec<LaunchOptions>>>,
}

impl MockLauncher {
    pub fn new(session: MockSession) -> Self {
        Self {
            session,
            launches: Arc::default(),
        }
    }

    pub fn launches(&self) -> Vec<LaunchOptions> {
        self.launches.lock().clone()
    }
}

#[async_trait]
impl AutomationLauncher for MockLauncher {
    async fn launch(&self, options: LaunchOptions) -> Result<Box<dyn AutomationSession>> {
        self.session.set_cookies(&options.cookies).await?;
        self.session.navigate(&options.url).await?;
        self.launches.lock().push(options);
        Ok(Box::new(self.session.clone()))
    }
}
