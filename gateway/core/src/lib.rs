//! Gateway Core - Pooled Chat Backends Behind One Event Protocol
//!
//! This crate puts several third-party chat services behind a single
//! streaming interface. It owns the scarce resources those services need
//! (tokens, accounts, live browser sessions) and normalizes their wire formats
//! into one canonical event sequence.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         BackendRegistry                          │
//! │            route(model) ──► backend with largest context         │
//! └───────────────┬──────────────────┬──────────────────┬────────────┘
//!                 │                  │                  │
//!        ┌────────┴──────┐  ┌────────┴──────┐  ┌────────┴──────┐
//!        │ openai-compat │  │ frame-session │  │ session-http  │
//!        └────────┬──────┘  └────────┬──────┘  └────────┬──────┘
//!                 │                  │                  │
//!         CredentialPool     SessionWorkerPool  SessionWorkerPool
//!                 │          (automated pages)  (derived clients)
//!                 │                  │                  │
//!          chunked decoder    frame decoder      chunked decoder
//!                 └──────────────────┼──────────────────┘
//!                                    ▼
//!                      EventStream: message* (done | error)
//! ```
//!
//! # Module Overview
//!
//! - [`streaming`]: The [`EventStream`] every backend writes into
//! - [`pool`]: Credential pool, session worker pool, circuit breaker, watchdog
//! - [`backend`]: The [`ChatBackend`] trait, wire decoders and the backends
//! - [`registry`]: Backend construction from configuration and model routing
//! - [`config`]: TOML/environment/CLI configuration
//! - [`error`]: The [`GatewayError`] taxonomy
//!
//! # Quick Start
//!
//! ```ignore
//! use gateway_core::{load_config, BackendRegistry, ChatRequest, ModelType};
//!
//! let config = load_config()?;
//! let registry = BackendRegistry::from_config(&config, None).await?;
//! let backend = registry.route(ModelType::Gpt4).expect("no backend serves gpt-4");
//! let reply = backend.ask(ChatRequest::new("Hello!", ModelType::Gpt4)).await;
//! println!("{}", reply.content);
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod error;
pub mod pool;
pub mod registry;
pub mod streaming;

#[cfg(test)]
mod test_utils;

pub use backend::{ChatBackend, ChatRequest, GenerationParams, ModelType};
pub use error::{ErrorKind, GatewayError, Result, RetryClass};
pub use pool::{
    BreakerConfig, Credential, CredentialPool, PoolConfig, PoolStats, SessionWorkerPool, SnapshotStore,
};
pub use registry::BackendRegistry;
pub use streaming::{ChatEvent, ChatResponse, EventReader, EventStream};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides, ConfigSource,
    GatewayConfig, GatewayToml,
};
