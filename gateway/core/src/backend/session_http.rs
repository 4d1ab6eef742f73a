//! Session-Derived HTTP Backend
//!
//! Some upstreams hand out API keys only to logged-in browser sessions. Each
//! worker logs in (or restores cookies), harvests the user agent, cookies and
//! API key from the page, and derives a plain HTTP client that mimics the
//! browser. Chat requests then bypass the page entirely.
//!
//! A worker is only handed out after a smoke-test completion succeeded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::automation::{AutomationLauncher, AutomationSession, LaunchOptions, LoginHandler};
use super::chunked::{pump, ChunkFormat};
use super::frame_session::DEFAULT_ACQUIRE_WAIT;
use super::traits::{ChatBackend, ChatRequest, ModelType};
use super::transport::{ChunkTransport, HttpTransportConfig, ReqwestTransport, TransportRequest};
use crate::error::{GatewayError, Result};
use crate::pool::{Credential, CredentialPool, DestroyMode, SessionWorkerPool, WorkerFactory, WorkerLease};
use crate::streaming::EventStream;

/// Registry name of this backend
pub const SESSION_HTTP: &str = "session-http";

const COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Builds the derived HTTP client for a worker
pub type TransportBuilder =
    Arc<dyn Fn(HttpTransportConfig) -> Result<Arc<dyn ChunkTransport>> + Send + Sync>;

/// Site endpoints and timings
#[derive(Clone, Debug)]
pub struct SessionHttpConfig {
    /// Site home, also sent as `origin`
    pub site_url: String,
    /// Page whose scripts embed the API key
    pub api_keys_url: String,
    /// Base URL of the inference API
    pub api_base: String,
    /// Text preceding the key inside the page script
    pub key_marker: String,
    /// Proxy used when the credential has none pinned
    pub proxy: Option<String>,
    /// Pause after the first page load before harvesting
    pub settle_delay: Duration,
    /// Inactivity window while streaming
    pub stall_timeout: Duration,
    /// Recheck window for restricted accounts
    pub restricted_recheck: Duration,
    /// How long a request waits for a worker
    pub acquire_wait: Duration,
}

impl Default for SessionHttpConfig {
    fn default() -> Self {
        Self {
            site_url: "https://fireworks.ai".to_string(),
            api_keys_url: "https://fireworks.ai/account/api-keys".to_string(),
            api_base: "https://api.fireworks.ai/inference".to_string(),
            key_marker: "plaintext".to_string(),
            proxy: None,
            settle_delay: Duration::from_secs(3),
            stall_timeout: Duration::from_secs(30),
            restricted_recheck: Duration::from_secs(30 * 24 * 60 * 60),
            acquire_wait: DEFAULT_ACQUIRE_WAIT,
        }
    }
}

/// Upstream model id for `model`
#[must_use]
pub fn upstream_model(model: ModelType) -> Option<&'static str> {
    match model {
        ModelType::Llama31_8b => Some("accounts/fireworks/models/llama-v3p1-8b-instruct"),
        ModelType::Llama31_70b => Some("accounts/fireworks/models/llama-v3p1-70b-instruct"),
        _ => None,
    }
}

/// Pull the API key following `marker` out of a page script
///
/// The key is the run of `[A-Za-z0-9_-]` after the marker, skipping JSON
/// quoting in between.
#[must_use]
pub fn extract_secret_key(script: &str, marker: &str) -> Option<String> {
    let start = script.find(marker)? + marker.len();
    let key: String = script[start..]
        .trim_start_matches(['\\', '"', ':', ' '])
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    (!key.is_empty()).then_some(key)
}

fn completion_body(model: &str, request: &ChatRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": model,
        "messages": [{ "role": "user", "content": request.prompt }],
        "temperature": request.params.temperature,
        "stream": true,
    });
    if let Some(max_tokens) = request.params.max_tokens {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }
    if let Some(top_p) = request.params.top_p {
        body["top_p"] = serde_json::json!(top_p);
    }
    body
}

// ============================================================================
// Worker
// ============================================================================

/// Derived HTTP client plus the page it was harvested from
pub struct SessionClient {
    transport: Arc<dyn ChunkTransport>,
    page: Box<dyn AutomationSession>,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient").finish_non_exhaustive()
    }
}

impl SessionClient {
    /// The derived transport
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn ChunkTransport> {
        &self.transport
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Logs accounts in and derives HTTP clients from their sessions
pub struct SessionHttpFactory {
    launcher: Arc<dyn AutomationLauncher>,
    login: Option<Arc<dyn LoginHandler>>,
    config: SessionHttpConfig,
    transport_builder: TransportBuilder,
}

impl SessionHttpFactory {
    /// Factory deriving [`ReqwestTransport`] clients
    pub fn new(launcher: Arc<dyn AutomationLauncher>, config: SessionHttpConfig) -> Self {
        Self {
            launcher,
            login: None,
            config,
            transport_builder: Arc::new(|config: HttpTransportConfig| {
                Ok(Arc::new(ReqwestTransport::new(&config)?) as Arc<dyn ChunkTransport>)
            }),
        }
    }

    /// Log in with `login` when no cookies are stored
    #[must_use]
    pub fn with_login(mut self, login: Arc<dyn LoginHandler>) -> Self {
        self.login = Some(login);
        self
    }

    /// Replace how derived transports are built
    #[must_use]
    pub fn with_transport_builder(mut self, builder: TransportBuilder) -> Self {
        self.transport_builder = builder;
        self
    }

    /// Site configuration
    #[must_use]
    pub fn config(&self) -> &SessionHttpConfig {
        &self.config
    }

    async fn open(&self, credential: &Credential, proxy: Option<String>) -> Result<Box<dyn AutomationSession>> {
        if !credential.artifacts.cookies.is_empty() {
            tracing::debug!(credential = %credential.id, "Restoring stored cookies");
            return self
                .launcher
                .launch(LaunchOptions {
                    url: self.config.site_url.clone(),
                    proxy,
                    cookies: credential.artifacts.cookies.clone(),
                })
                .await;
        }

        let Some(login) = &self.login else {
            return Err(GatewayError::CredentialRejected(
                "no stored cookies and no login handler".to_string(),
            ));
        };
        let page = self
            .launcher
            .launch(LaunchOptions {
                url: self.config.site_url.clone(),
                proxy,
                cookies: Vec::new(),
            })
            .await?;
        if let Err(e) = login.login(page.as_ref(), credential).await {
            close_quietly(page.as_ref(), &credential.id).await;
            return Err(e);
        }
        tracing::info!(credential = %credential.id, "Logged in");
        Ok(page)
    }

    /// Harvest session material and build the derived client
    async fn derive(&self, page: &dyn AutomationSession, credential: &mut Credential) -> Result<Arc<dyn ChunkTransport>> {
        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }

        let user_agent = page
            .evaluate("navigator.userAgent")
            .await?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Automation("user agent unavailable".to_string()))?;
        credential.artifacts.user_agent = Some(user_agent.clone());
        credential.artifacts.cookies = page.cookies().await?;

        page.navigate(&self.config.api_keys_url).await?;
        let script = format!(
            "Array.from(document.scripts).map((s) => s.textContent).find((t) => t && t.indexOf('{}') > -1) || null",
            self.config.key_marker
        );
        let api_key = page
            .evaluate(&script)
            .await?
            .as_str()
            .and_then(|text| extract_secret_key(text, &self.config.key_marker))
            .ok_or_else(|| GatewayError::Automation("api key not found on page".to_string()))?;
        credential.artifacts.api_key = Some(api_key.clone());
        tracing::debug!(credential = %credential.id, "Session material harvested");

        let transport_config = HttpTransportConfig::new(&self.config.api_base)
            .with_header("authorization", format!("Bearer {api_key}"))
            .with_header("origin", &self.config.site_url)
            .with_header("user-agent", user_agent)
            .with_proxy(credential.artifacts.proxy.clone());
        (self.transport_builder)(transport_config)
    }

    /// One tiny completion proving the derived client works
    async fn smoke_test(&self, transport: &dyn ChunkTransport) -> Result<()> {
        let model = upstream_model(ModelType::Llama31_8b).unwrap_or_default();
        let request = ChatRequest::new("say 1", ModelType::Llama31_8b)
            .with_temperature(0.1)
            .with_max_tokens(2)
            .with_top_p(1.0);
        let body = transport
            .send(TransportRequest::new(COMPLETIONS_PATH, completion_body(model, &request)))
            .await?;
        pump(body, &EventStream::new(), &ChunkFormat::default(), self.config.stall_timeout).await
    }
}

async fn close_quietly(page: &dyn AutomationSession, credential_id: &str) {
    if let Err(e) = page.close().await {
        tracing::debug!(credential = %credential_id, error = %e, "Page close failed");
    }
}

#[async_trait]
impl WorkerFactory for SessionHttpFactory {
    type Worker = SessionClient;

    async fn initialize(&self, credential: &mut Credential) -> Result<SessionClient> {
        if credential.label.is_none() {
            return Err(GatewayError::CredentialRejected(
                "account e-mail required".to_string(),
            ));
        }
        let proxy = credential
            .artifacts
            .proxy
            .clone()
            .or_else(|| self.config.proxy.clone());
        credential.artifacts.proxy = proxy.clone();

        let page = self.open(credential, proxy).await?;
        let transport = match self.derive(page.as_ref(), credential).await {
            Ok(transport) => transport,
            Err(e) => {
                close_quietly(page.as_ref(), &credential.id).await;
                return Err(e);
            }
        };
        if let Err(e) = self.smoke_test(transport.as_ref()).await {
            close_quietly(page.as_ref(), &credential.id).await;
            return Err(e);
        }
        tracing::info!(credential = %credential.id, "Session client ready");
        Ok(SessionClient { transport, page })
    }

    async fn recycle(&self, _worker: &SessionClient, _credential: &mut Credential) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self, worker: Arc<SessionClient>) {
        close_quietly(worker.page.as_ref(), "").await;
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Chat backend over session-derived HTTP clients
pub struct SessionHttpBackend {
    pool: SessionWorkerPool<SessionHttpFactory>,
}

impl SessionHttpBackend {
    /// Create a backend over `pool`
    pub fn new(pool: SessionWorkerPool<SessionHttpFactory>) -> Self {
        Self { pool }
    }

    /// The worker pool
    #[must_use]
    pub fn pool(&self) -> &SessionWorkerPool<SessionHttpFactory> {
        &self.pool
    }
}

async fn settle_failure(lease: WorkerLease<SessionHttpFactory>, error: &GatewayError, recheck: Duration) {
    tracing::warn!(worker = %lease.id(), credential = %lease.credential().id, error = %error, "Chat request failed");
    if matches!(error, GatewayError::Restricted(_)) {
        lease.destroy(DestroyMode::RecheckAfter(recheck));
    } else {
        lease.fail(error).await;
    }
}

#[async_trait]
impl ChatBackend for SessionHttpBackend {
    fn name(&self) -> &str {
        SESSION_HTTP
    }

    fn support(&self, model: ModelType) -> usize {
        match model {
            ModelType::Llama31_8b | ModelType::Llama31_70b => 16000,
            _ => 0,
        }
    }

    fn credentials(&self) -> Option<&Arc<CredentialPool>> {
        Some(self.pool.credentials())
    }

    async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    async fn ask_stream(&self, request: ChatRequest, stream: EventStream) {
        let Some(model) = upstream_model(request.model) else {
            stream.fail(GatewayError::UnsupportedModel(request.model.to_string()).to_string());
            return;
        };
        let config = self.pool.factory().config();

        let Some(mut lease) = self.pool.acquire(config.acquire_wait).await else {
            stream.fail(
                GatewayError::PoolExhausted {
                    pool: self.pool.credentials().name().to_string(),
                }
                .to_string(),
            );
            return;
        };
        let credential = lease.credential_mut();
        credential.use_count += 1;
        credential.last_use_time = Some(Utc::now());

        let body = lease
            .worker()
            .transport
            .send(TransportRequest::new(COMPLETIONS_PATH, completion_body(model, &request)))
            .await;
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                stream.fail(e.to_string());
                settle_failure(lease, &e, config.restricted_recheck).await;
                return;
            }
        };

        let stall_timeout = config.stall_timeout;
        let recheck = config.restricted_recheck;
        tokio::spawn(async move {
            match pump(body, &stream, &ChunkFormat::default(), stall_timeout).await {
                Ok(()) => lease.succeed(),
                Err(e) => settle_failure(lease, &e, recheck).await,
            }
        });
    }
}
