//! Credential Records
//!
//! A credential is one account or token granting access to a backend, plus
//! the bookkeeping the pool needs to decide whether it may be handed out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Browser cookie captured from or injected into an automated session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    /// Cookie name
    pub name: String,
    /// Cookie value
    pub value: String,
    /// Domain the cookie is scoped to
    #[serde(default)]
    pub domain: String,
    /// Path the cookie is scoped to
    #[serde(default = "default_cookie_path")]
    pub path: String,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl Cookie {
    /// Create a cookie scoped to a domain
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_cookie_path(),
        }
    }
}

/// Material harvested from an authenticated session
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionArtifacts {
    /// Session cookies
    pub cookies: Vec<Cookie>,
    /// User agent of the session that produced the cookies
    pub user_agent: Option<String>,
    /// API key derived from the session
    pub api_key: Option<String>,
    /// Short-lived access token from a login exchange
    pub access_token: Option<String>,
    /// Outbound proxy the session is pinned to
    pub proxy: Option<String>,
}

impl SessionArtifacts {
    /// Render cookies as a `Cookie` request header value
    #[must_use]
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// One pooled credential
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    /// Unique identifier
    pub id: String,
    /// Account label, usually an e-mail address
    #[serde(default)]
    pub label: Option<String>,
    /// Token or secret presented to the backend
    #[serde(default)]
    pub secret: String,
    /// Password for login-based provisioning
    #[serde(default)]
    pub password: Option<String>,
    /// Consecutive failures since the last success
    #[serde(default)]
    pub failed_count: u32,
    /// Number of checkouts
    #[serde(default)]
    pub use_count: u64,
    /// Last checkout time
    #[serde(default)]
    pub last_use_time: Option<DateTime<Utc>>,
    /// Soft-invalidated after an auth failure
    #[serde(default)]
    pub invalid: bool,
    /// When an invalid credential may be reconsidered
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Cached model selection of the bound session
    #[serde(default)]
    pub model: Option<String>,
    /// Session material for automated backends
    #[serde(default)]
    pub artifacts: SessionArtifacts,
}

impl Credential {
    /// Create a credential from a secret with a fresh id
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            label: None,
            secret: secret.into(),
            password: None,
            failed_count: 0,
            use_count: 0,
            last_use_time: None,
            invalid: false,
            cooldown_until: None,
            model: None,
            artifacts: SessionArtifacts::default(),
        }
    }

    /// Create an account credential from a login pair
    pub fn account(label: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            password: Some(password.into()),
            ..Self::new(String::new())
        }
    }

    /// Set the account label
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// The empty credential returned when a pool is exhausted
    #[must_use]
    pub fn sentinel() -> Self {
        Self {
            id: String::new(),
            ..Self::new(String::new())
        }
    }

    /// Whether this is the exhaustion sentinel
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.id.is_empty()
    }

    /// Key used to detect duplicates when seeding
    #[must_use]
    pub fn seed_key(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.secret)
    }

    /// Whether the cooldown of an invalid credential has elapsed
    #[must_use]
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map_or(true, |until| now >= until)
    }
}
