//! Backend Registry
//!
//! Holds every configured backend and routes a model to the one offering the
//! largest context for it.
//!
//! ```text
//! GatewayConfig ──► from_config ──► [openai-compat, frame-session, session-http]
//!                                          │
//!           route(model) ──► highest support(model) > 0, first registered on ties
//! ```

use std::sync::Arc;

use crate::backend::automation::AutomationLauncher;
use crate::backend::{
    ChatBackend, ChunkTransport, FrameSessionBackend, FrameSessionFactory, HttpTransportConfig, ModelType,
    OpenAiCompatBackend, OpenAiCompatConfig, ReqwestTransport, SessionHttpBackend, SessionHttpFactory,
    FRAME_SESSION, OPENAI_COMPAT, SESSION_HTTP,
};
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::pool::{BreakerConfig, Credential, CredentialPool, PoolConfig, SessionWorkerPool, SnapshotStore};

/// Registered backends in registration order
#[derive(Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn ChatBackend>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

impl BackendRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend, replacing one registered under the same name
    pub fn register(&mut self, backend: Arc<dyn ChatBackend>) {
        if let Some(slot) = self.backends.iter_mut().find(|b| b.name() == backend.name()) {
            tracing::debug!(backend = %backend.name(), "Replacing registered backend");
            *slot = backend;
        } else {
            tracing::debug!(backend = %backend.name(), "Registered backend");
            self.backends.push(backend);
        }
    }

    /// Backend registered as `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ChatBackend>> {
        self.backends.iter().find(|b| b.name() == name).cloned()
    }

    /// Backend with the largest context for `model`
    #[must_use]
    pub fn route(&self, model: ModelType) -> Option<Arc<dyn ChatBackend>> {
        let mut best: Option<(&Arc<dyn ChatBackend>, usize)> = None;
        for backend in &self.backends {
            let support = backend.support(model);
            if support > 0 && best.map_or(true, |(_, top)| support > top) {
                best = Some((backend, support));
            }
        }
        best.map(|(backend, _)| Arc::clone(backend))
    }

    /// Names in registration order
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    /// Number of registered backends
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Every served model per backend
    #[must_use]
    pub fn support_table(&self) -> Vec<(String, ModelType, usize)> {
        self.backends
            .iter()
            .flat_map(|b| {
                b.models()
                    .into_iter()
                    .map(move |(model, size)| (b.name().to_string(), model, size))
            })
            .collect()
    }

    /// Credential pool of the backend registered as `name`
    #[must_use]
    pub fn credentials(&self, name: &str) -> Option<Arc<CredentialPool>> {
        self.backends
            .iter()
            .find(|b| b.name() == name)
            .and_then(|b| b.credentials().cloned())
    }

    /// Write every pool snapshot now
    pub fn flush_all(&self) {
        for backend in &self.backends {
            if let Some(pool) = backend.credentials() {
                if let Err(e) = pool.flush() {
                    tracing::warn!(pool = %pool.name(), error = %e, "Snapshot flush failed");
                }
            }
        }
    }

    /// Close live sessions and flush snapshots
    pub async fn shutdown(&self) {
        for backend in &self.backends {
            backend.shutdown().await;
        }
        self.flush_all();
    }

    /// Build every backend enabled in `config`
    ///
    /// Session-backed backends need `launcher`; without one they are skipped
    /// with a warning. OpenAI-compatible accounts are provisioned before the
    /// registry is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built (for example, an
    /// invalid proxy URL).
    pub async fn from_config(
        config: &GatewayConfig,
        launcher: Option<Arc<dyn AutomationLauncher>>,
    ) -> Result<Self> {
        let mut registry = Self::new();

        if config.openai_compat.enabled {
            registry.register(Arc::new(build_openai_compat(config).await?));
        }

        let frame = &config.frame_session;
        let session = &config.session_http;
        let wants_sessions = frame.pool_size > 0 || session.pool_size > 0;
        match launcher {
            Some(launcher) => {
                if frame.pool_size > 0 {
                    registry.register(Arc::new(build_frame_session(config, Arc::clone(&launcher))));
                }
                if session.pool_size > 0 {
                    registry.register(Arc::new(build_session_http(config, launcher)));
                }
            }
            None if wants_sessions => {
                tracing::warn!("Session backends configured but no automation driver available; skipping them");
            }
            None => {}
        }

        tracing::info!(backends = ?registry.names(), "Backend registry ready");
        Ok(registry)
    }
}

fn credential_pool(config: &GatewayConfig, name: &str, pool_config: PoolConfig) -> CredentialPool {
    match &config.pool.snapshot_dir {
        Some(dir) => CredentialPool::with_snapshot(
            name,
            pool_config,
            SnapshotStore::for_pool(dir, name, config.pool.flush_debounce),
        ),
        None => CredentialPool::new(name, pool_config),
    }
}

async fn build_openai_compat(config: &GatewayConfig) -> Result<OpenAiCompatBackend> {
    let settings = &config.openai_compat;
    let proxy = settings.proxy.clone().or_else(|| config.proxy.clone());

    let pool = credential_pool(
        config,
        OPENAI_COMPAT,
        PoolConfig::default().with_cooldown(settings.cooldown),
    );
    let seeded = pool.seed(settings.tokens.iter().map(Credential::new));
    tracing::debug!(pool = OPENAI_COMPAT, seeded, "Tokens seeded");

    let transport: Arc<dyn ChunkTransport> = Arc::new(ReqwestTransport::new(
        &HttpTransportConfig::new(&settings.base_url).with_proxy(proxy.clone()),
    )?);
    let mut backend = OpenAiCompatBackend::new(
        OpenAiCompatConfig {
            stall_timeout: settings.stall_timeout,
            ..OpenAiCompatConfig::default()
        },
        Arc::new(pool),
        transport,
    );

    if !settings.accounts.is_empty() {
        let auth: Arc<dyn ChunkTransport> = Arc::new(ReqwestTransport::new(
            &HttpTransportConfig::new(&settings.auth_base_url).with_proxy(proxy),
        )?);
        backend = backend.with_auth_transport(auth);
        let accounts: Vec<(String, String)> = settings
            .accounts
            .iter()
            .map(|a| (a.email.clone(), a.password.clone()))
            .collect();
        backend.provision(&accounts).await;
    }
    Ok(backend)
}

fn build_frame_session(config: &GatewayConfig, launcher: Arc<dyn AutomationLauncher>) -> FrameSessionBackend {
    let settings = &config.frame_session;
    let pool = credential_pool(
        config,
        FRAME_SESSION,
        PoolConfig::default()
            .with_cooldown(settings.cooldown)
            .with_max_failures(settings.failure_threshold),
    );
    pool.seed(settings.tokens.iter().map(Credential::new));

    let factory = FrameSessionFactory::new(launcher, settings.site.clone())
        .with_proxy(settings.proxy.clone().or_else(|| config.proxy.clone()))
        .with_screenshot_dir(settings.screenshot_dir.clone());
    let workers = SessionWorkerPool::new(
        factory,
        Arc::new(pool),
        settings.pool_size,
        BreakerConfig {
            failure_threshold: settings.failure_threshold,
            stall_timeout: settings.stall_timeout,
        },
    );
    FrameSessionBackend::new(workers)
        .with_stall_timeout(settings.stall_timeout)
        .with_acquire_wait(settings.acquire_wait)
}

fn build_session_http(config: &GatewayConfig, launcher: Arc<dyn AutomationLauncher>) -> SessionHttpBackend {
    let settings = &config.session_http;
    let pool = credential_pool(
        config,
        SESSION_HTTP,
        PoolConfig::default()
            .with_cooldown(settings.cooldown)
            .with_max_failures(settings.failure_threshold),
    );
    pool.seed(
        settings
            .accounts
            .iter()
            .map(|a| Credential::account(&a.email, &a.password)),
    );

    let mut site = settings.site.clone();
    if site.proxy.is_none() {
        site.proxy = config.proxy.clone();
    }
    let stall_timeout = site.stall_timeout;
    let mut factory = SessionHttpFactory::new(launcher, site);
    if let Some(login) = &settings.login {
        factory = factory.with_login(Arc::new(login.clone()));
    }
    let workers = SessionWorkerPool::new(
        factory,
        Arc::new(pool),
        settings.pool_size,
        BreakerConfig {
            failure_threshold: settings.failure_threshold,
            stall_timeout,
        },
    );
    SessionHttpBackend::new(workers)
}
