//! Chrome DevTools Protocol Driver
//!
//! [`AutomationLauncher`] over a running Chrome reachable at a DevTools
//! endpoint (`--remote-debugging-port`). Every launched page gets its own
//! browser context, so cookies and proxies never leak between credentials.
//!
//! ```text
//! CdpLauncher ──GET /json/version──► webSocketDebuggerUrl
//!      │
//!      └─ websocket ──► Target.createBrowserContext ──► Target.createTarget
//!                         ──► Target.attachToTarget (flatten) ──► CdpSession
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use super::automation::{AutomationLauncher, AutomationSession, LaunchOptions};
use crate::error::{GatewayError, Result};
use crate::pool::Cookie;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const FRAME_EVENT: &str = "Network.webSocketFrameReceived";

fn automation(context: &str, e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Automation(format!("{context}: {e}"))
}

// ============================================================================
// Wire messages
// ============================================================================

/// Decoded inbound protocol message
#[derive(Debug, PartialEq)]
enum Incoming {
    /// Reply to a command
    Reply { id: u64, result: std::result::Result<Value, String> },
    /// Unsolicited event
    Event {
        method: String,
        session: Option<String>,
        params: Value,
    },
}

fn parse_incoming(text: &str) -> Option<Incoming> {
    let mut message: Value = serde_json::from_str(text).ok()?;
    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        let result = match message.get("error") {
            Some(error) => Err(error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown protocol error")
                .to_string()),
            None => Ok(message.get_mut("result").map(Value::take).unwrap_or(Value::Null)),
        };
        return Some(Incoming::Reply { id, result });
    }
    let method = message.get("method")?.as_str()?.to_string();
    Some(Incoming::Event {
        method,
        session: message
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string),
        params: message.get_mut("params").map(Value::take).unwrap_or(Value::Null),
    })
}

fn cookie_param(cookie: &Cookie) -> Value {
    json!({
        "name": cookie.name,
        "value": cookie.value,
        "domain": cookie.domain,
        "path": cookie.path,
    })
}

fn cookie_from(value: &Value) -> Option<Cookie> {
    let mut cookie = Cookie::new(
        value.get("name")?.as_str()?,
        value.get("value")?.as_str()?,
        value.get("domain").and_then(Value::as_str).unwrap_or_default(),
    );
    if let Some(path) = value.get("path").and_then(Value::as_str) {
        cookie.path = path.to_string();
    }
    Some(cookie)
}

// ============================================================================
// Connection
// ============================================================================

struct Listener {
    method: String,
    session: String,
    tx: mpsc::UnboundedSender<Value>,
}

type PendingMap = HashMap<u64, oneshot::Sender<std::result::Result<Value, String>>>;

/// One websocket to the browser, multiplexing flattened sessions
struct Connection {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Arc<Mutex<PendingMap>>,
    listeners: Arc<Mutex<Vec<Listener>>>,
    next_id: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    async fn open(url: &str) -> Result<Self> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| automation("devtools connect failed", e))?;
        let (mut sink, mut source) = socket.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Arc<Mutex<PendingMap>> = Arc::default();
        let listeners: Arc<Mutex<Vec<Listener>>> = Arc::default();

        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    tracing::warn!(error = %e, "DevTools write failed");
                    break;
                }
            }
        });

        let reader = {
            let pending = Arc::clone(&pending);
            let listeners = Arc::clone(&listeners);
            tokio::spawn(async move {
                while let Some(message) = source.next().await {
                    let text = match message {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::warn!(error = %e, "DevTools read failed");
                            break;
                        }
                    };
                    match parse_incoming(&text) {
                        Some(Incoming::Reply { id, result }) => {
                            if let Some(tx) = pending.lock().remove(&id) {
                                let _ = tx.send(result);
                            }
                        }
                        Some(Incoming::Event { method, session, params }) => {
                            let session = session.unwrap_or_default();
                            listeners.lock().retain(|l| {
                                if l.method != method || l.session != session {
                                    return !l.tx.is_closed();
                                }
                                l.tx.send(params.clone()).is_ok()
                            });
                        }
                        None => tracing::trace!("Unparseable DevTools message"),
                    }
                }
                // Fail every in-flight call.
                pending.lock().clear();
                listeners.lock().clear();
            })
        };

        Ok(Self {
            outgoing,
            pending,
            listeners,
            next_id: AtomicU64::new(1),
            tasks: vec![writer, reader],
        })
    }

    async fn call(&self, session: Option<&str>, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut message = json!({ "id": id, "method": method, "params": params });
        if let Some(session) = session {
            message["sessionId"] = json!(session);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if self.outgoing.send(Message::Text(message.to_string())).is_err() {
            self.pending.lock().remove(&id);
            return Err(GatewayError::Automation("devtools connection closed".to_string()));
        }

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(reason))) => Err(automation(method, reason)),
            Ok(Err(_)) => Err(GatewayError::Automation("devtools connection closed".to_string())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(automation(method, "timed out"))
            }
        }
    }

    fn listen(&self, session: &str, method: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| !(l.method == method && l.session == session));
        listeners.push(Listener {
            method: method.to_string(),
            session: session.to_string(),
            tx,
        });
        rx
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

// ============================================================================
// Launcher
// ============================================================================

/// Opens pages on a Chrome instance reachable over the DevTools protocol
#[derive(Clone, Debug)]
pub struct CdpLauncher {
    endpoint: String,
    http: reqwest::Client,
}

impl CdpLauncher {
    /// Launcher for a DevTools HTTP endpoint such as `http://127.0.0.1:9222`
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn browser_url(&self) -> Result<String> {
        let version: Value = self
            .http
            .get(format!("{}/json/version", self.endpoint))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        version
            .get("webSocketDebuggerUrl")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Automation("endpoint reported no webSocketDebuggerUrl".to_string()))
    }
}

#[async_trait]
impl AutomationLauncher for CdpLauncher {
    async fn launch(&self, options: LaunchOptions) -> Result<Box<dyn AutomationSession>> {
        let connection = Arc::new(Connection::open(&self.browser_url().await?).await?);

        let mut context_params = json!({ "disposeOnDetach": true });
        if let Some(proxy) = &options.proxy {
            context_params["proxyServer"] = json!(proxy);
        }
        let context = connection
            .call(None, "Target.createBrowserContext", context_params)
            .await?;
        let context_id = context
            .get("browserContextId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let target = connection
            .call(
                None,
                "Target.createTarget",
                json!({ "url": "about:blank", "browserContextId": context_id }),
            )
            .await?;
        let target_id = target.get("targetId").and_then(Value::as_str).unwrap_or_default();
        let attached = connection
            .call(
                None,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Automation("attach returned no sessionId".to_string()))?
            .to_string();

        let session = CdpSession {
            connection,
            session_id,
            context_id,
        };
        for domain in ["Page.enable", "Network.enable", "Runtime.enable"] {
            session.send(domain, json!({})).await?;
        }
        session
            .send("Emulation.setDeviceMetricsOverride", json!({
                "width": 1920, "height": 1080, "deviceScaleFactor": 1, "mobile": false,
            }))
            .await?;
        if !options.cookies.is_empty() {
            session.set_cookies(&options.cookies).await?;
        }
        session.navigate(&options.url).await?;
        tracing::debug!(url = %options.url, "DevTools page launched");
        Ok(Box::new(session))
    }
}

// ============================================================================
// Session
// ============================================================================

/// One page attached through a flattened DevTools session
pub struct CdpSession {
    connection: Arc<Connection>,
    session_id: String,
    context_id: String,
}

impl std::fmt::Debug for CdpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdpSession")
            .field("session_id", &self.session_id)
            .field("context_id", &self.context_id)
            .finish_non_exhaustive()
    }
}

impl CdpSession {
    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.connection
            .call(Some(&self.session_id), method, params)
            .await
    }

    async fn wait_until_loaded(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + CALL_TIMEOUT;
        loop {
            if self.evaluate("document.readyState").await? == json!("complete") {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::Automation("page load timed out".to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn selector_literal(selector: &str) -> String {
    Value::String(selector.to_string()).to_string()
}

#[async_trait]
impl AutomationSession for CdpSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        let result = self.send("Page.navigate", json!({ "url": url })).await?;
        if let Some(error) = result.get("errorText").and_then(Value::as_str) {
            return Err(automation(url, error));
        }
        self.wait_until_loaded().await
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<()> {
        let cookies: Vec<Value> = cookies.iter().map(cookie_param).collect();
        self.send("Network.setCookies", json!({ "cookies": cookies }))
            .await
            .map(|_| ())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>> {
        let result = self.send("Network.getAllCookies", json!({})).await?;
        Ok(result
            .get("cookies")
            .and_then(Value::as_array)
            .map(|all| all.iter().filter_map(cookie_from).collect())
            .unwrap_or_default())
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.exists(selector).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::Automation(format!(
                    "timed out after {timeout:?} waiting for {selector}"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn exists(&self, selector: &str) -> Result<bool> {
        let script = format!("document.querySelector({}) !== null", selector_literal(selector));
        Ok(self.evaluate(&script).await?.as_bool().unwrap_or(false))
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); if (!el) return false; el.click(); return true; }})()",
            selector_literal(selector)
        );
        if self.evaluate(&script).await?.as_bool().unwrap_or(false) {
            Ok(())
        } else {
            Err(GatewayError::Automation(format!("no element to click: {selector}")))
        }
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        let mut result = self
            .send(
                "Runtime.evaluate",
                json!({ "expression": script, "returnByValue": true, "awaitPromise": true }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("script threw");
            return Err(automation("evaluate", text));
        }
        Ok(result
            .get_mut("result")
            .and_then(|r| r.get_mut("value"))
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    async fn insert_text(&self, selector: &str, text: &str) -> Result<()> {
        let focus = format!(
            "(() => {{ const el = document.querySelector({}); if (!el) return false; el.focus(); return true; }})()",
            selector_literal(selector)
        );
        if !self.evaluate(&focus).await?.as_bool().unwrap_or(false) {
            return Err(GatewayError::Automation(format!("no element to type into: {selector}")));
        }
        self.send("Input.insertText", json!({ "text": text }))
            .await
            .map(|_| ())
    }

    async fn press_enter(&self) -> Result<()> {
        for kind in ["keyDown", "keyUp"] {
            self.send(
                "Input.dispatchKeyEvent",
                json!({
                    "type": kind,
                    "key": "Enter",
                    "code": "Enter",
                    "windowsVirtualKeyCode": 13,
                    "text": "\r",
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.send("Page.reload", json!({})).await?;
        self.wait_until_loaded().await
    }

    async fn screenshot(&self, path: &Path) -> Result<()> {
        let result = self
            .send("Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        let data = result
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Automation("screenshot returned no data".to_string()))?;
        let png = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| automation("screenshot decode", e))?;
        tokio::fs::write(path, png).await?;
        Ok(())
    }

    async fn intercept_frames(&self) -> Result<mpsc::Receiver<String>> {
        let mut events = self.connection.listen(&self.session_id, FRAME_EVENT);
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(params) = events.recv().await {
                let Some(payload) = params
                    .get("response")
                    .and_then(|r| r.get("payloadData"))
                    .and_then(Value::as_str)
                else {
                    continue;
                };
                if tx.send(payload.to_string()).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .call(
                None,
                "Target.disposeBrowserContext",
                json!({ "browserContextId": self.context_id }),
            )
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_reply_and_error() {
        assert_eq!(
            parse_incoming(r#"{"id":7,"result":{"frameId":"F"}}"#),
            Some(Incoming::Reply {
                id: 7,
                result: Ok(json!({ "frameId": "F" }))
            })
        );
        assert_eq!(
            parse_incoming(r#"{"id":8,"error":{"code":-32000,"message":"No node"}}"#),
            Some(Incoming::Reply {
                id: 8,
                result: Err("No node".to_string())
            })
        );
    }

    #[test]
    fn test_parse_session_event() {
        let raw = r#"{"method":"Network.webSocketFrameReceived","sessionId":"S1","params":{"response":{"payloadData":"42[]"}}}"#;
        assert_eq!(
            parse_incoming(raw),
            Some(Incoming::Event {
                method: FRAME_EVENT.to_string(),
                session: Some("S1".to_string()),
                params: json!({ "response": { "payloadData": "42[]" } }),
            })
        );
        assert_eq!(parse_incoming("not json"), None);
    }

    #[test]
    fn test_cookie_conversion() {
        let cookie = cookie_from(&json!({
            "name": "sid", "value": "v", "domain": ".example.com", "path": "/app", "secure": true
        }))
        .unwrap();
        assert_eq!(cookie.path, "/app");
        assert_eq!(cookie_param(&cookie)["domain"], ".example.com");
        assert!(cookie_from(&json!({ "value": "v" })).is_none());
    }

    #[test]
    fn test_selector_literal_escapes_quotes() {
        assert_eq!(selector_literal(r#"a[title="x"]"#), r#""a[title=\"x\"]""#);
    }
}
