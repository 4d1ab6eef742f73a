//! Resource Pools
//!
//! Two layers of pooling sit between the adapters and the upstream services:
//!
//! - [`CredentialPool`]: exclusive checkout of lightweight credentials with
//!   cooldown-based revalidation and a debounced JSON snapshot
//! - [`SessionWorkerPool`]: bounded set of heavyweight session workers, each
//!   bound to one credential, with background initialization and circuit
//!   breaking
//!
//! Interactions on a worker run under an [`InactivityWatchdog`]; a stall is
//! treated as a recoverable failure and fed through the [`BreakerConfig`].

mod breaker;
mod credential;
mod credential_pool;
mod snapshot;
mod watchdog;
mod worker_pool;

pub use breaker::{BreakerConfig, Verdict, DEFAULT_FAILURE_THRESHOLD, DEFAULT_STALL_TIMEOUT};
pub use credential::{Cookie, Credential, SessionArtifacts};
pub use credential_pool::{CredentialPool, PoolConfig, PoolStats, DEFAULT_COOLDOWN};
pub use snapshot::{SnapshotStore, DEFAULT_FLUSH_DEBOUNCE};
pub use watchdog::InactivityWatchdog;
pub use worker_pool::{
    DestroyMode, SessionWorkerPool, WorkerFactory, WorkerLease, WorkerPoolStats, WorkerState,
};
