//! Browser Automation Seams
//!
//! Session-backed adapters drive a real browser page. The page is reached
//! through these narrow traits so the adapters stay testable and the driver
//! (DevTools protocol, WebDriver, ...) stays swappable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{GatewayError, Result};
use crate::pool::{Cookie, Credential};

/// One automated browser page
#[async_trait]
pub trait AutomationSession: Send + Sync {
    /// Navigate and wait for the load event
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Inject cookies into the page's browser context
    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<()>;

    /// Read every cookie visible to the page
    async fn cookies(&self) -> Result<Vec<Cookie>>;

    /// Wait until an element matching `selector` exists
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<()>;

    /// Whether an element matching `selector` exists right now
    async fn exists(&self, selector: &str) -> Result<bool>;

    /// Click the first element matching `selector`
    async fn click(&self, selector: &str) -> Result<()>;

    /// Evaluate a script expression and return its JSON value
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    /// Focus `selector` and type `text` into it
    async fn insert_text(&self, selector: &str, text: &str) -> Result<()>;

    /// Press the Enter key on the focused element
    async fn press_enter(&self) -> Result<()>;

    /// Reload the current page
    async fn reload(&self) -> Result<()>;

    /// Save a PNG screenshot
    async fn screenshot(&self, path: &Path) -> Result<()>;

    /// Subscribe to websocket frames received by the page
    async fn intercept_frames(&self) -> Result<mpsc::Receiver<String>>;

    /// Close the page and its browser context
    async fn close(&self) -> Result<()>;
}

/// How to open a new automated page
#[derive(Clone, Debug, Default)]
pub struct LaunchOptions {
    /// First URL to load
    pub url: String,
    /// Outbound proxy for the page's context
    pub proxy: Option<String>,
    /// Cookies injected before the first navigation
    pub cookies: Vec<Cookie>,
}

/// Opens automated pages
#[async_trait]
pub trait AutomationLauncher: Send + Sync {
    /// Open a page
    async fn launch(&self, options: LaunchOptions) -> Result<Box<dyn AutomationSession>>;
}

// ============================================================================
// Anti-bot challenges
// ============================================================================

/// Detects and clears interstitial bot challenges
#[async_trait]
pub trait ChallengeHandler: Send + Sync {
    /// Whether the page is showing a challenge
    async fn is_challenged(&self, session: &dyn AutomationSession) -> Result<bool>;

    /// Clear the challenge or fail
    async fn resolve(&self, session: &dyn AutomationSession) -> Result<()>;
}

/// Handler for sites without challenges
#[derive(Clone, Copy, Debug, Default)]
pub struct NoChallenge;

#[async_trait]
impl ChallengeHandler for NoChallenge {
    async fn is_challenged(&self, _session: &dyn AutomationSession) -> Result<bool> {
        Ok(false)
    }

    async fn resolve(&self, _session: &dyn AutomationSession) -> Result<()> {
        Ok(())
    }
}

/// Detects a challenge by a marker element and waits for it to clear
#[derive(Clone, Debug)]
pub struct SelectorChallenge {
    /// Element present only while challenged
    pub marker: String,
    /// How long to wait for the challenge to clear
    pub wait: Duration,
    /// Poll interval while waiting
    pub poll: Duration,
}

impl SelectorChallenge {
    /// Challenge detected by `marker`
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            wait: Duration::from_secs(30),
            poll: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl ChallengeHandler for SelectorChallenge {
    async fn is_challenged(&self, session: &dyn AutomationSession) -> Result<bool> {
        session.exists(&self.marker).await
    }

    async fn resolve(&self, session: &dyn AutomationSession) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.wait;
        while session.exists(&self.marker).await? {
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::Automation(format!(
                    "challenge {} not cleared after {:?}",
                    self.marker, self.wait
                )));
            }
            tokio::time::sleep(self.poll).await;
        }
        tracing::info!(marker = %self.marker, "Challenge cleared");
        Ok(())
    }
}

// ============================================================================
// Login
// ============================================================================

/// Establishes a session when no cookies are stored
#[async_trait]
pub trait LoginHandler: Send + Sync {
    /// Log `credential` in on the current page
    async fn login(&self, session: &dyn AutomationSession, credential: &Credential) -> Result<()>;
}

/// Plain e-mail/password form login
#[derive(Clone, Debug)]
pub struct FormLogin {
    /// Login page URL
    pub url: String,
    /// E-mail input
    pub email_selector: String,
    /// Password input
    pub password_selector: String,
    /// Submit button
    pub submit_selector: String,
    /// Element that appears once logged in
    pub success_selector: String,
    /// How long to wait for each element
    pub timeout: Duration,
}

#[async_trait]
impl LoginHandler for FormLogin {
    async fn login(&self, session: &dyn AutomationSession, credential: &Credential) -> Result<()> {
        let (Some(email), Some(password)) = (&credential.label, &credential.password) else {
            return Err(GatewayError::CredentialRejected(
                "login requires an e-mail and password".to_string(),
            ));
        };
        session.navigate(&self.url).await?;
        session.wait_for(&self.email_selector, self.timeout).await?;
        session.insert_text(&self.email_selector, email).await?;
        session.insert_text(&self.password_selector, password).await?;
        session.click(&self.submit_selector).await?;
        session
            .wait_for(&self.success_selector, self.timeout)
            .await
            .map_err(|_| GatewayError::CredentialRejected(format!("login failed for {email}")))
    }
}

/// Save a screenshot of a failed session for later inspection
///
/// Returns the file path, or `None` if the capture itself failed.
pub async fn capture_failure(
    session: &dyn AutomationSession,
    dir: &Path,
    credential_id: &str,
) -> Option<PathBuf> {
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        tracing::warn!(dir = %dir.display(), error = %e, "Cannot create screenshot directory");
        return None;
    }
    let path = dir.join(format!(
        "{credential_id}-{}.png",
        chrono::Utc::now().format("%Y%m%dT%H%M%S")
    ));
    match session.screenshot(&path).await {
        Ok(()) => {
            tracing::info!(credential = %credential_id, path = %path.display(), "Saved failure screenshot");
            Some(path)
        }
        Err(e) => {
            tracing::warn!(credential = %credential_id, error = %e, "Failure screenshot not captured");
            None
        }
    }
}
