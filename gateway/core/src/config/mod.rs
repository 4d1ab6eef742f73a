//! TOML Configuration File Support
//!
//! Centralized configuration for the gateway, loaded from
//! `~/.config/chat-gateway/gateway.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied through [`ConfigOverrides`])
//! 2. Environment variables (`GATEWAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! List values in environment variables are `|`-separated.
//!
//! # Example Configuration
//!
//! ```toml
//! proxy = "http://127.0.0.1:8080"
//!
//! [pool]
//! snapshot_dir = "/var/lib/chat-gateway"
//! flush_debounce_ms = 500
//!
//! [openai_compat]
//! base_url = "https://ai.fakeopen.com/v1"
//! tokens = ["pk-one", "pk-two"]
//! cooldown_secs = 300
//!
//! [[openai_compat.accounts]]
//! email = "someone@example.com"
//! password = "hunter2"
//!
//! [frame_session]
//! tokens = ["eyJhbGciOi..."]
//! pool_size = 2
//! stall_timeout_secs = 5
//!
//! [session_http]
//! pool_size = 1
//! accounts = [{ email = "someone@example.com", password = "hunter2" }]
//!
//! [session_http.login]
//! url = "https://fireworks.ai/login"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::automation::FormLogin;
use crate::backend::{FrameSite, SessionHttpConfig};
use crate::pool::{DEFAULT_COOLDOWN, DEFAULT_FAILURE_THRESHOLD, DEFAULT_FLUSH_DEBOUNCE, DEFAULT_STALL_TIMEOUT};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// E-mail/password pair
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account e-mail, also the credential label
    pub email: String,
    /// Account password
    pub password: String,
}

/// Pool section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolToml {
    /// Directory holding one snapshot file per pool
    pub snapshot_dir: Option<PathBuf>,

    /// Snapshot write debounce in milliseconds
    pub flush_debounce_ms: Option<u64>,
}

/// OpenAI-compatible section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiCompatToml {
    /// Whether the backend is registered
    pub enabled: Option<bool>,

    /// Base URL of the chat-completions API
    pub base_url: Option<String>,

    /// Base URL of the login and token-registration API
    pub auth_base_url: Option<String>,

    /// Outbound proxy
    pub proxy: Option<String>,

    /// Bearer tokens
    pub tokens: Option<Vec<String>>,

    /// Accounts turned into tokens at startup
    pub accounts: Option<Vec<Account>>,

    /// Invalid-token cooldown in seconds
    pub cooldown_secs: Option<u64>,

    /// Streaming inactivity window in seconds
    pub stall_timeout_secs: Option<u64>,
}

/// Frame-session section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSessionToml {
    /// Session-cookie tokens
    pub tokens: Option<Vec<String>>,

    /// Maximum live pages (0 disables the backend)
    pub pool_size: Option<usize>,

    /// Consecutive failures before a page is destroyed
    pub failure_threshold: Option<u32>,

    /// Invalid-token cooldown in seconds
    pub cooldown_secs: Option<u64>,

    /// Frame inactivity window in seconds
    pub stall_timeout_secs: Option<u64>,

    /// Wait for a free page in seconds
    pub acquire_wait_secs: Option<u64>,

    /// Outbound proxy for the pages
    pub proxy: Option<String>,

    /// Where failure screenshots are written
    pub screenshot_dir: Option<PathBuf>,

    /// Chat page URL
    pub home_url: Option<String>,

    /// Session cookie name
    pub cookie_name: Option<String>,

    /// Session cookie domain
    pub cookie_domain: Option<String>,
}

/// Login form of the session-http section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginToml {
    /// Login page URL; the form login is only used when set
    pub url: Option<String>,

    /// E-mail input selector
    pub email_selector: Option<String>,

    /// Password input selector
    pub password_selector: Option<String>,

    /// Submit button selector
    pub submit_selector: Option<String>,

    /// Selector proving a successful login
    pub success_selector: Option<String>,

    /// Wait for each form element in seconds
    pub timeout_secs: Option<u64>,
}

/// Session-http section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionHttpToml {
    /// Accounts backing the workers
    pub accounts: Option<Vec<Account>>,

    /// Maximum live workers (0 disables the backend)
    pub pool_size: Option<usize>,

    /// Consecutive failures before a worker is destroyed
    pub failure_threshold: Option<u32>,

    /// Invalid-account cooldown in seconds
    pub cooldown_secs: Option<u64>,

    /// Streaming inactivity window in seconds
    pub stall_timeout_secs: Option<u64>,

    /// Wait for a free worker in seconds
    pub acquire_wait_secs: Option<u64>,

    /// Recheck window for restricted accounts in days
    pub restricted_recheck_days: Option<u64>,

    /// Outbound proxy when an account has none pinned
    pub proxy: Option<String>,

    /// Site home
    pub site_url: Option<String>,

    /// Page embedding the API key
    pub api_keys_url: Option<String>,

    /// Inference API base URL
    pub api_base: Option<String>,

    /// Form login used when an account has no stored cookies
    pub login: LoginToml,
}

/// Root of the TOML configuration file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Proxy used by every backend without its own
    pub proxy: Option<String>,

    /// Chrome DevTools endpoint for session-backed backends
    pub devtools_endpoint: Option<String>,

    /// Pool settings
    pub pool: PoolToml,

    /// OpenAI-compatible backend
    pub openai_compat: OpenAiCompatToml,

    /// Frame-session backend
    pub frame_session: FrameSessionToml,

    /// Session-http backend
    pub session_http: SessionHttpToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Snapshot persistence settings
#[derive(Clone, Debug)]
pub struct PoolSettings {
    /// Snapshot directory; `None` keeps pools in memory only
    pub snapshot_dir: Option<PathBuf>,
    /// Snapshot write debounce
    pub flush_debounce: Duration,
}

/// OpenAI-compatible backend settings
#[derive(Clone, Debug)]
pub struct OpenAiCompatSettings {
    /// Whether the backend is registered
    pub enabled: bool,
    /// Chat-completions base URL
    pub base_url: String,
    /// Login and registration base URL
    pub auth_base_url: String,
    /// Outbound proxy
    pub proxy: Option<String>,
    /// Bearer tokens
    pub tokens: Vec<String>,
    /// Accounts provisioned into tokens
    pub accounts: Vec<Account>,
    /// Invalid-token cooldown
    pub cooldown: Duration,
    /// Streaming inactivity window
    pub stall_timeout: Duration,
}

impl Default for OpenAiCompatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://ai.fakeopen.com/v1".to_string(),
            auth_base_url: "https://ai.fakeopen.com".to_string(),
            proxy: None,
            tokens: Vec::new(),
            accounts: Vec::new(),
            cooldown: DEFAULT_COOLDOWN,
            stall_timeout: Duration::from_secs(30),
        }
    }
}

/// Frame-session backend settings
#[derive(Clone, Debug)]
pub struct FrameSessionSettings {
    /// Session-cookie tokens
    pub tokens: Vec<String>,
    /// Maximum live pages; 0 disables the backend
    pub pool_size: usize,
    /// Consecutive failures before a page is destroyed
    pub failure_threshold: u32,
    /// Invalid-token cooldown
    pub cooldown: Duration,
    /// Frame inactivity window
    pub stall_timeout: Duration,
    /// Wait for a free page
    pub acquire_wait: Duration,
    /// Outbound proxy
    pub proxy: Option<String>,
    /// Failure screenshot directory
    pub screenshot_dir: PathBuf,
    /// Page selectors and timings
    pub site: FrameSite,
}

impl Default for FrameSessionSettings {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            pool_size: 0,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            acquire_wait: Duration::from_secs(30),
            proxy: None,
            screenshot_dir: PathBuf::from("screenshots"),
            site: FrameSite::default(),
        }
    }
}

/// Session-http backend settings
#[derive(Clone, Debug)]
pub struct SessionHttpSettings {
    /// Accounts backing the workers
    pub accounts: Vec<Account>,
    /// Maximum live workers; 0 disables the backend
    pub pool_size: usize,
    /// Consecutive failures before a worker is destroyed
    pub failure_threshold: u32,
    /// Invalid-account cooldown
    pub cooldown: Duration,
    /// Site endpoints, proxy and timings
    pub site: SessionHttpConfig,
    /// Form login for accounts without stored cookies
    pub login: Option<FormLogin>,
}

impl Default for SessionHttpSettings {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            pool_size: 0,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
            site: SessionHttpConfig::default(),
            login: None,
        }
    }
}

/// Centralized configuration for the gateway
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Snapshot persistence
    pub pool: PoolSettings,

    /// OpenAI-compatible backend
    pub openai_compat: OpenAiCompatSettings,

    /// Frame-session backend
    pub frame_session: FrameSessionSettings,

    /// Session-http backend
    pub session_http: SessionHttpSettings,

    /// Proxy for backends without their own
    pub proxy: Option<String>,

    /// Chrome DevTools endpoint for session-backed backends
    pub devtools_endpoint: Option<String>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            pool: PoolSettings {
                snapshot_dir: default_snapshot_dir(),
                flush_debounce: DEFAULT_FLUSH_DEBOUNCE,
            },
            openai_compat: OpenAiCompatSettings::default(),
            frame_session: FrameSessionSettings::default(),
            session_http: SessionHttpSettings::default(),
            proxy: None,
            devtools_endpoint: None,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check values that would make a backend unusable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.openai_compat.enabled && self.openai_compat.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "openai_compat.base_url must not be empty".to_string(),
            ));
        }
        if self.frame_session.pool_size > 0 && self.frame_session.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "frame_session.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.session_http.pool_size > 0 && self.session_http.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "session_http.failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chat-gateway/gateway.toml` or
/// `~/.config/chat-gateway/gateway.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("chat-gateway").join("gateway.toml"))
}

/// Default snapshot directory under the user's data directory
#[must_use]
pub fn default_snapshot_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("chat-gateway").join("pools"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// With `None`, only defaults and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read, parsed or
/// validated.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {
    let mut config = GatewayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: GatewayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut GatewayConfig, toml: &GatewayToml) {
    if toml.proxy.is_some() {
        config.proxy = toml.proxy.clone();
    }
    if toml.devtools_endpoint.is_some() {
        config.devtools_endpoint = toml.devtools_endpoint.clone();
    }

    // Pool settings
    if toml.pool.snapshot_dir.is_some() {
        config.pool.snapshot_dir = toml.pool.snapshot_dir.clone();
    }
    if let Some(ms) = toml.pool.flush_debounce_ms {
        config.pool.flush_debounce = Duration::from_millis(ms);
    }

    // OpenAI-compatible backend
    let openai = &mut config.openai_compat;
    if let Some(enabled) = toml.openai_compat.enabled {
        openai.enabled = enabled;
    }
    if let Some(ref url) = toml.openai_compat.base_url {
        openai.base_url = url.clone();
    }
    if let Some(ref url) = toml.openai_compat.auth_base_url {
        openai.auth_base_url = url.clone();
    }
    if toml.openai_compat.proxy.is_some() {
        openai.proxy = toml.openai_compat.proxy.clone();
    }
    if let Some(ref tokens) = toml.openai_compat.tokens {
        openai.tokens = tokens.clone();
    }
    if let Some(ref accounts) = toml.openai_compat.accounts {
        openai.accounts = accounts.clone();
    }
    if let Some(secs) = toml.openai_compat.cooldown_secs {
        openai.cooldown = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.openai_compat.stall_timeout_secs {
        openai.stall_timeout = Duration::from_secs(secs);
    }

    // Frame-session backend
    let frame = &mut config.frame_session;
    if let Some(ref tokens) = toml.frame_session.tokens {
        frame.tokens = tokens.clone();
    }
    if let Some(size) = toml.frame_session.pool_size {
        frame.pool_size = size;
    }
    if let Some(threshold) = toml.frame_session.failure_threshold {
        frame.failure_threshold = threshold;
    }
    if let Some(secs) = toml.frame_session.cooldown_secs {
        frame.cooldown = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.frame_session.stall_timeout_secs {
        frame.stall_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.frame_session.acquire_wait_secs {
        frame.acquire_wait = Duration::from_secs(secs);
    }
    if toml.frame_session.proxy.is_some() {
        frame.proxy = toml.frame_session.proxy.clone();
    }
    if let Some(ref dir) = toml.frame_session.screenshot_dir {
        frame.screenshot_dir = dir.clone();
    }
    if let Some(ref url) = toml.frame_session.home_url {
        frame.site.home_url = url.clone();
    }
    if let Some(ref name) = toml.frame_session.cookie_name {
        frame.site.cookie_name = name.clone();
    }
    if let Some(ref domain) = toml.frame_session.cookie_domain {
        frame.site.cookie_domain = domain.clone();
    }

    // Session-http backend
    let session = &mut config.session_http;
    if let Some(ref accounts) = toml.session_http.accounts {
        session.accounts = accounts.clone();
    }
    if let Some(size) = toml.session_http.pool_size {
        session.pool_size = size;
    }
    if let Some(threshold) = toml.session_http.failure_threshold {
        session.failure_threshold = threshold;
    }
    if let Some(secs) = toml.session_http.cooldown_secs {
        session.cooldown = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.session_http.stall_timeout_secs {
        session.site.stall_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.session_http.acquire_wait_secs {
        session.site.acquire_wait = Duration::from_secs(secs);
    }
    if let Some(days) = toml.session_http.restricted_recheck_days {
        session.site.restricted_recheck = Duration::from_secs(days * 24 * 60 * 60);
    }
    if toml.session_http.proxy.is_some() {
        session.site.proxy = toml.session_http.proxy.clone();
    }
    if let Some(ref url) = toml.session_http.site_url {
        session.site.site_url = url.clone();
    }
    if let Some(ref url) = toml.session_http.api_keys_url {
        session.site.api_keys_url = url.clone();
    }
    if let Some(ref url) = toml.session_http.api_base {
        session.site.api_base = url.clone();
    }
    if let Some(login) = form_login(&toml.session_http.login) {
        session.login = Some(login);
    }
}

/// Build a form login from its TOML table, if a login URL is configured
fn form_login(toml: &LoginToml) -> Option<FormLogin> {
    let url = toml.url.clone()?;
    let pick = |value: &Option<String>, default: &str| value.clone().unwrap_or_else(|| default.to_string());
    Some(FormLogin {
        url,
        email_selector: pick(&toml.email_selector, "input[type='email']"),
        password_selector: pick(&toml.password_selector, "input[type='password']"),
        submit_selector: pick(&toml.submit_selector, "button[type='submit']"),
        success_selector: pick(&toml.success_selector, "a[href*='account']"),
        timeout: Duration::from_secs(toml.timeout_secs.unwrap_or(30)),
    })
}

/// Split a `|`-separated environment list
fn env_list(value: &str) -> Vec<String> {
    value
        .split('|')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Zip `|`-separated e-mail and password lists into accounts
fn env_accounts(emails: &str, passwords: &str) -> Vec<Account> {
    let emails = env_list(emails);
    let passwords = env_list(passwords);
    if emails.len() != passwords.len() {
        tracing::warn!(
            emails = emails.len(),
            passwords = passwords.len(),
            "Account e-mail and password counts differ; extra entries ignored"
        );
    }
    emails
        .into_iter()
        .zip(passwords)
        .map(|(email, password)| Account { email, password })
        .collect()
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut GatewayConfig) {
    if let Ok(dir) = std::env::var("GATEWAY_SNAPSHOT_DIR") {
        config.pool.snapshot_dir = Some(PathBuf::from(dir));
        config.source = ConfigSource::Env;
    }
    if let Ok(proxy) = std::env::var("GATEWAY_PROXY") {
        config.proxy = Some(proxy);
        config.source = ConfigSource::Env;
    }
    if let Ok(endpoint) = std::env::var("GATEWAY_DEVTOOLS_ENDPOINT") {
        config.devtools_endpoint = Some(endpoint);
        config.source = ConfigSource::Env;
    }

    // OpenAI-compatible backend
    if let Ok(url) = std::env::var("GATEWAY_OPENAI_COMPAT_BASE_URL") {
        config.openai_compat.base_url = url;
        config.source = ConfigSource::Env;
    }
    if let Ok(tokens) = std::env::var("GATEWAY_OPENAI_COMPAT_TOKENS") {
        config.openai_compat.tokens = env_list(&tokens);
        config.source = ConfigSource::Env;
    }
    if let (Ok(emails), Ok(passwords)) = (
        std::env::var("GATEWAY_OPENAI_COMPAT_EMAILS"),
        std::env::var("GATEWAY_OPENAI_COMPAT_PASSWORDS"),
    ) {
        config.openai_compat.accounts = env_accounts(&emails, &passwords);
        config.source = ConfigSource::Env;
    }

    // Frame-session backend
    if let Ok(tokens) = std::env::var("GATEWAY_FRAME_SESSION_TOKENS") {
        config.frame_session.tokens = env_list(&tokens);
        config.source = ConfigSource::Env;
    }
    if let Ok(size) = std::env::var("GATEWAY_FRAME_SESSION_POOL_SIZE") {
        if let Ok(n) = size.parse::<usize>() {
            config.frame_session.pool_size = n;
            config.source = ConfigSource::Env;
        }
    }

    // Session-http backend
    if let (Ok(emails), Ok(passwords)) = (
        std::env::var("GATEWAY_SESSION_HTTP_EMAILS"),
        std::env::var("GATEWAY_SESSION_HTTP_PASSWORDS"),
    ) {
        config.session_http.accounts = env_accounts(&emails, &passwords);
        config.source = ConfigSource::Env;
    }
    if let Ok(size) = std::env::var("GATEWAY_SESSION_HTTP_POOL_SIZE") {
        if let Ok(n) = size.parse::<usize>() {
            config.session_http.pool_size = n;
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// CLI argument overrides
///
/// Applied last, on top of file and environment values.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Override snapshot directory
    pub snapshot_dir: Option<PathBuf>,

    /// Override the shared proxy
    pub proxy: Option<String>,

    /// Override the DevTools endpoint
    pub devtools_endpoint: Option<String>,

    /// Override the frame-session pool size
    pub frame_session_pool_size: Option<usize>,

    /// Override the session-http pool size
    pub session_http_pool_size: Option<usize>,
}

impl ConfigOverrides {
    /// Create empty overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set snapshot directory override
    #[must_use]
    pub fn with_snapshot_dir(mut self, dir: PathBuf) -> Self {
        self.snapshot_dir = Some(dir);
        self
    }

    /// Set proxy override
    #[must_use]
    pub fn with_proxy(mut self, proxy: String) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Set DevTools endpoint override
    #[must_use]
    pub fn with_devtools_endpoint(mut self, endpoint: String) -> Self {
        self.devtools_endpoint = Some(endpoint);
        self
    }

    /// Set frame-session pool size override
    #[must_use]
    pub fn with_frame_session_pool_size(mut self, size: usize) -> Self {
        self.frame_session_pool_size = Some(size);
        self
    }

    /// Set session-http pool size override
    #[must_use]
    pub fn with_session_http_pool_size(mut self, size: usize) -> Self {
        self.session_http_pool_size = Some(size);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut GatewayConfig) {
        if self.snapshot_dir.is_some()
            || self.proxy.is_some()
            || self.devtools_endpoint.is_some()
            || self.frame_session_pool_size.is_some()
            || self.session_http_pool_size.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref dir) = self.snapshot_dir {
            config.pool.snapshot_dir = Some(dir.clone());
        }
        if let Some(ref proxy) = self.proxy {
            config.proxy = Some(proxy.clone());
        }
        if let Some(ref endpoint) = self.devtools_endpoint {
            config.devtools_endpoint = Some(endpoint.clone());
        }
        if let Some(size) = self.frame_session_pool_size {
            config.frame_session.pool_size = size;
        }
        if let Some(size) = self.session_http_pool_size {
            config.session_http.pool_size = size;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
