//! Streaming Chat Output
//!
//! Every adapter writes its reply into an [`EventStream`]. Consumers either
//! register callbacks with [`EventStream::read`], pull events from an
//! [`EventReader`], or wait for the aggregated [`ChatResponse`].
//!
//! # Event Protocol
//!
//! ```text
//! message* ( done | error ) <closed>
//! ```
//!
//! # Example
//!
//! ```ignore
//! use gateway_core::streaming::EventStream;
//!
//! let stream = EventStream::new();
//! backend.ask_stream(request, stream.clone()).await;
//! let mut reader = stream.subscribe();
//! while let Some(event) = reader.next().await {
//!     println!("{event:?}");
//! }
//! ```

mod event_stream;

pub use event_stream::{ChatEvent, ChatResponse, EventReader, EventStream};
