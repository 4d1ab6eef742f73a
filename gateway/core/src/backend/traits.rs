//! Chat Backend Traits
//!
//! Trait definitions for chat backends. Every backend accepts the same
//! [`ChatRequest`] and reports its reply through an [`EventStream`], so
//! callers never see the upstream wire format.
//!
//! # Design Philosophy
//!
//! The `ChatBackend` trait provides a common interface for:
//! - Advertising which models a backend serves, and with what context size
//! - Streaming a reply as canonical events
//! - Collecting a reply into one response
//!
//! Implementations own their resource pools and do all failure bookkeeping
//! locally; errors surface only as a terminal `error` event.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::pool::CredentialPool;
use crate::streaming::{ChatResponse, EventStream};

/// Model identifiers understood by the gateway
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelType {
    /// GPT-3.5 Turbo
    #[serde(rename = "gpt-3.5-turbo")]
    Gpt35Turbo,
    /// GPT-3.5 Turbo with the 16k context window
    #[serde(rename = "gpt-3.5-turbo-16k")]
    Gpt35Turbo16k,
    /// GPT-4
    #[serde(rename = "gpt-4")]
    Gpt4,
    /// GPT-3.5 Turbo with web search
    #[serde(rename = "net-gpt-3.5-turbo")]
    NetGpt35Turbo,
    /// GPT-4 with web search
    #[serde(rename = "net-gpt-4")]
    NetGpt4,
    /// Llama 3.1 8B instruct
    #[serde(rename = "llama-3.1-8b")]
    Llama31_8b,
    /// Llama 3.1 70B instruct
    #[serde(rename = "llama-3.1-70b")]
    Llama31_70b,
}

impl ModelType {
    /// Every known model
    pub const ALL: [ModelType; 7] = [
        Self::Gpt35Turbo,
        Self::Gpt35Turbo16k,
        Self::Gpt4,
        Self::NetGpt35Turbo,
        Self::NetGpt4,
        Self::Llama31_8b,
        Self::Llama31_70b,
    ];

    /// Wire name of the model
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpt35Turbo => "gpt-3.5-turbo",
            Self::Gpt35Turbo16k => "gpt-3.5-turbo-16k",
            Self::Gpt4 => "gpt-4",
            Self::NetGpt35Turbo => "net-gpt-3.5-turbo",
            Self::NetGpt4 => "net-gpt-4",
            Self::Llama31_8b => "llama-3.1-8b",
            Self::Llama31_70b => "llama-3.1-70b",
        }
    }

    /// Whether answers are grounded in live web results
    #[must_use]
    pub fn is_networked(&self) -> bool {
        matches!(self, Self::NetGpt35Turbo | Self::NetGpt4)
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| GatewayError::UnsupportedModel(s.to_string()))
    }
}

/// Sampling parameters forwarded to backends that accept them
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationParams {
    /// Sampling temperature
    pub temperature: f32,
    /// Maximum tokens in the reply
    pub max_tokens: Option<u32>,
    /// Nucleus sampling
    pub top_p: Option<f32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_tokens: None,
            top_p: None,
        }
    }
}

/// A chat request
#[derive(Clone, Debug, PartialEq)]
pub struct ChatRequest {
    /// The user prompt
    pub prompt: String,
    /// Requested model
    pub model: ModelType,
    /// Sampling parameters
    pub params: GenerationParams,
}

impl ChatRequest {
    /// Create a request with default parameters
    pub fn new(prompt: impl Into<String>, model: ModelType) -> Self {
        Self {
            prompt: prompt.into(),
            model,
            params: GenerationParams::default(),
        }
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.params.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.params.max_tokens = Some(max_tokens);
        self
    }

    /// Set nucleus sampling
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.params.top_p = Some(top_p);
        self
    }
}

/// Chat backend trait
///
/// Implement this trait to put another upstream behind the gateway.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Backend name used for routing and logs
    fn name(&self) -> &str;

    /// Context size offered for `model`, or 0 when unsupported
    fn support(&self, model: ModelType) -> usize;

    /// Start a streaming reply
    ///
    /// Returns once the request is dispatched; decoding continues in the
    /// background and always ends with exactly one terminal event followed by
    /// `end()`.
    async fn ask_stream(&self, request: ChatRequest, stream: EventStream);

    /// Send a request and wait for the complete reply
    async fn ask(&self, request: ChatRequest) -> ChatResponse {
        let stream = EventStream::new();
        self.ask_stream(request, stream.clone()).await;
        stream.collect().await
    }

    /// Models this backend serves, with their context sizes
    fn models(&self) -> Vec<(ModelType, usize)> {
        ModelType::ALL
            .into_iter()
            .map(|m| (m, self.support(m)))
            .filter(|(_, size)| *size > 0)
            .collect()
    }

    /// Credential pool behind this backend, for administration
    fn credentials(&self) -> Option<&Arc<CredentialPool>> {
        None
    }

    /// Close any live sessions
    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_round_trip_names() {
        for model in ModelType::ALL {
            assert_eq!(model.as_str().parse::<ModelType>().unwrap(), model);
            assert_eq!(
                serde_json::to_string(&model).unwrap(),
                format!("\"{}\"", model.as_str())
            );
        }
        assert!("gpt-5".parse::<ModelType>().is_err());
    }

    #[test]
    fn test_networked_models() {
        assert!(ModelType::NetGpt4.is_networked());
        assert!(ModelType::NetGpt35Turbo.is_networked());
        assert!(!ModelType::Gpt4.is_networked());
    }

    #[test]
    fn test_request_builder() {
        let request = ChatRequest::new("hi", ModelType::Gpt4)
            .with_temperature(5.0)
            .with_max_tokens(2)
            .with_top_p(1.0);
        assert_eq!(request.params.temperature, 2.0);
        assert_eq!(request.params.max_tokens, Some(2));
        assert_eq!(request.params.top_p, Some(1.0));
    }
}
