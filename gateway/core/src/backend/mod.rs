//! Chat Backends
//!
//! Every backend implements [`ChatBackend`]: it reports how well it serves a
//! model and streams replies into an [`EventStream`](crate::streaming::EventStream).
//! Two decoders normalize the upstream wire formats:
//!
//! - [`chunked`]: `data:`-prefixed chunked text bodies ending in `[DONE]`
//! - [`frames`]: intercepted websocket frames carrying a cumulative answer
//!
//! # Available Backends
//!
//! - **openai-compat**: bearer-token pool over an OpenAI-compatible relay
//! - **frame-session**: pool of automated chat pages read via websocket frames
//! - **session-http**: pool of logged-in sessions that derive HTTP clients
//!
//! Session-backed backends drive pages through [`automation`]; a Chrome
//! DevTools driver is available with the `cdp` feature.

pub mod automation;
pub mod chunked;
pub mod frame_session;
pub mod frames;
pub mod openai_compat;
pub mod session_http;
pub mod transport;
mod traits;

#[cfg(feature = "cdp")]
pub mod cdp;

pub use frame_session::{FrameSessionBackend, FrameSessionFactory, FrameSite, FRAME_SESSION};
pub use openai_compat::{OpenAiCompatBackend, OpenAiCompatConfig, OPENAI_COMPAT};
pub use session_http::{SessionHttpBackend, SessionHttpConfig, SessionHttpFactory, SESSION_HTTP};
pub use traits::{ChatBackend, ChatRequest, GenerationParams, ModelType};
pub use transport::{ChunkTransport, HttpTransportConfig, ReqwestTransport, TransportRequest};
