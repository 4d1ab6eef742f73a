//! OpenAI-Compatible Backend
//!
//! Credential-pool backend for relays that speak the OpenAI chat-completions
//! API with per-account bearer tokens.
//!
//! # Request Flow
//!
//! 1. Check out a token from the [`CredentialPool`]
//! 2. POST `/chat/completions` with `stream: true`
//! 3. Decode the chunked body into the caller's [`EventStream`]
//! 4. Release the token, or invalidate it when upstream rejected it
//!
//! Accounts configured with an e-mail and password are turned into tokens by
//! [`OpenAiCompatBackend::provision`] (`/auth/login`, then `/token/register`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::chunked::{pump, ChunkFormat};
use super::traits::{ChatBackend, ChatRequest, ModelType};
use super::transport::{ChunkTransport, TransportRequest};
use crate::error::{GatewayError, Result};
use crate::pool::{Credential, CredentialPool};
use crate::streaming::EventStream;

/// Registry name of this backend
pub const OPENAI_COMPAT: &str = "openai-compat";

/// Settings for [`OpenAiCompatBackend`]
#[derive(Clone, Debug)]
pub struct OpenAiCompatConfig {
    /// Inactivity window while streaming
    pub stall_timeout: Duration,
    /// Body framing
    pub format: ChunkFormat,
}

impl Default for OpenAiCompatConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(30),
            format: ChunkFormat::default(),
        }
    }
}

/// Chat backend over a pool of bearer tokens
pub struct OpenAiCompatBackend {
    config: OpenAiCompatConfig,
    credentials: Arc<CredentialPool>,
    transport: Arc<dyn ChunkTransport>,
    auth: Option<Arc<dyn ChunkTransport>>,
}

impl OpenAiCompatBackend {
    /// Create a backend streaming through `transport`
    pub fn new(
        config: OpenAiCompatConfig,
        credentials: Arc<CredentialPool>,
        transport: Arc<dyn ChunkTransport>,
    ) -> Self {
        Self {
            config,
            credentials,
            transport,
            auth: None,
        }
    }

    /// Use `auth` for login-based provisioning
    #[must_use]
    pub fn with_auth_transport(mut self, auth: Arc<dyn ChunkTransport>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Turn e-mail/password accounts into pooled tokens
    ///
    /// Accounts already in the pool are skipped. A failed login still seeds
    /// the account, marked invalid so it is retried after the cooldown.
    /// Returns the number of accounts added.
    pub async fn provision(&self, accounts: &[(String, String)]) -> usize {
        let Some(auth) = &self.auth else {
            if !accounts.is_empty() {
                tracing::warn!(pool = %self.credentials.name(), "Accounts configured without an auth endpoint");
            }
            return 0;
        };

        let mut added = 0;
        for (email, password) in accounts {
            if self.credentials.contains_seed(email) {
                continue;
            }
            let mut credential = Credential::account(email, password);
            match register_token(auth.as_ref(), email, password).await {
                Ok((access_token, token_key)) => {
                    credential.secret = token_key;
                    credential.artifacts.access_token = Some(access_token);
                    added += self.credentials.seed([credential]);
                }
                Err(e) => {
                    tracing::warn!(pool = %self.credentials.name(), account = %email, error = %e, "Login provisioning failed");
                    let id = credential.id.clone();
                    added += self.credentials.seed([credential]);
                    self.credentials.invalidate(&id);
                }
            }
        }
        tracing::info!(pool = %self.credentials.name(), total = self.credentials.len(), "Accounts provisioned");
        added
    }

    fn request_body(request: &ChatRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "messages": [{ "role": "user", "content": request.prompt }],
            "temperature": request.params.temperature,
            "model": request.model.as_str(),
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
}

async fn register_token(auth: &dyn ChunkTransport, email: &str, password: &str) -> Result<(String, String)> {
    let login = auth
        .request_json(TransportRequest::new(
            "/auth/login",
            serde_json::json!({ "username": email, "password": password }),
        ))
        .await?;
    let access_token = login
        .get("access_token")
        .and_then(|t| t.as_str())
        .ok_or_else(|| GatewayError::CredentialRejected("login returned no access_token".into()))?
        .to_string();

    let registered = auth
        .request_json(TransportRequest::new(
            "/token/register",
            serde_json::json!({
                "unique_name": email,
                "access_token": access_token,
                "expires_in": 0,
                "site_limit": "",
                "show_conversations": true,
            }),
        ))
        .await?;
    let token_key = registered
        .get("token_key")
        .and_then(|t| t.as_str())
        .ok_or_else(|| GatewayError::CredentialRejected("register returned no token_key".into()))?
        .to_string();
    Ok((access_token, token_key))
}

/// Pool bookkeeping after an interaction
fn settle(credentials: &CredentialPool, id: &str, outcome: &Result<()>) {
    match outcome {
        Ok(()) => {
            credentials.record_success(id);
            credentials.release(id);
        }
        Err(e) if e.is_terminal() => credentials.invalidate(id),
        Err(_) => {
            credentials.record_failure(id);
            credentials.release(id);
        }
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        OPENAI_COMPAT
    }

    fn support(&self, model: ModelType) -> usize {
        match model {
            ModelType::Gpt35Turbo16k => 15000,
            ModelType::Gpt4 => 5000,
            ModelType::Gpt35Turbo => 4000,
            _ => 0,
        }
    }

    fn credentials(&self) -> Option<&Arc<CredentialPool>> {
        Some(&self.credentials)
    }

    async fn ask_stream(&self, request: ChatRequest, stream: EventStream) {
        if self.support(request.model) == 0 {
            stream.fail(GatewayError::UnsupportedModel(request.model.to_string()).to_string());
            return;
        }

        let credential = self.credentials.get();
        if credential.is_sentinel() {
            stream.fail(
                GatewayError::PoolExhausted {
                    pool: self.credentials.name().to_string(),
                }
                .to_string(),
            );
            return;
        }

        let transport_request = TransportRequest::new("/chat/completions", Self::request_body(&request))
            .with_bearer(&credential.secret);
        let body = match self.transport.send(transport_request).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(pool = %self.credentials.name(), credential = %credential.id, error = %e, "Chat request failed");
                stream.fail(e.to_string());
                settle(&self.credentials, &credential.id, &Err(e));
                return;
            }
        };

        let credentials = Arc::clone(&self.credentials);
        let format = self.config.format.clone();
        let stall_timeout = self.config.stall_timeout;
        tokio::spawn(async move {
            let outcome = pump(body, &stream, &format, stall_timeout).await;
            if let Err(e) = &outcome {
                tracing::warn!(pool = %credentials.name(), credential = %credential.id, error = %e, "Chat stream failed");
            }
            settle(&credentials, &credential.id, &outcome);
        });
    }
}
