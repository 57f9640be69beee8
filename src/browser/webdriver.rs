//! [`PageDriver`] over the W3C WebDriver HTTP protocol (chromedriver,
//! geckodriver, Selenium Grid).

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{
    DomNode, DriverError, DriverFactory, DriverResult, ElementAction, Locator, PageDriver,
    VisualRegion,
};

/// Key under which W3C drivers return element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Interactive elements with a unique selector and their accessible names.
const DOM_SNAPSHOT_JS: &str = r#"
const sel = (el) => {
  if (el.id && document.querySelectorAll('#' + CSS.escape(el.id)).length === 1) {
    return '#' + CSS.escape(el.id);
  }
  const parts = [];
  while (el && el.nodeType === 1 && el !== document.documentElement) {
    let part = el.tagName.toLowerCase();
    const parent = el.parentElement;
    if (parent) {
      const same = Array.from(parent.children).filter(c => c.tagName === el.tagName);
      if (same.length > 1) part += ':nth-of-type(' + (same.indexOf(el) + 1) + ')';
    }
    parts.unshift(part);
    el = parent;
  }
  return parts.join(' > ');
};
const query = 'a,button,input,textarea,select,[role],[onclick],[contenteditable="true"]';
return Array.from(document.querySelectorAll(query)).slice(0, 500).map(el => {
  const rect = el.getBoundingClientRect();
  const style = window.getComputedStyle(el);
  const attrs = {};
  for (const a of el.attributes) attrs[a.name] = a.value;
  const label = el.labels && el.labels.length ? el.labels[0].innerText : null;
  return {
    tag: el.tagName.toLowerCase(),
    role: el.getAttribute('role'),
    text: (el.innerText || '').trim().slice(0, 200),
    label: label,
    attributes: attrs,
    selector: sel(el),
    visible: rect.width > 0 && rect.height > 0 && style.visibility !== 'hidden' && style.display !== 'none'
  };
});
"#;

/// Visible text blocks with viewport coordinates.
const VISUAL_REGIONS_JS: &str = r#"
const out = [];
const walker = document.createTreeWalker(document.body, NodeFilter.SHOW_TEXT);
let node;
while ((node = walker.nextNode()) && out.length < 1000) {
  const text = node.textContent.trim();
  if (!text) continue;
  const range = document.createRange();
  range.selectNodeContents(node);
  const r = range.getBoundingClientRect();
  if (r.width <= 0 || r.height <= 0) continue;
  if (r.bottom < 0 || r.right < 0 || r.top > window.innerHeight || r.left > window.innerWidth) continue;
  out.push({ text: text.slice(0, 200), x: r.left, y: r.top, width: r.width, height: r.height });
}
return out;
"#;

/// Click the first visible consent or close control inside an overlay.
const DISMISS_OVERLAY_JS: &str = r#"
const words = ['accept all', 'accept', 'agree', 'got it', 'no thanks', 'dismiss', 'close', 'ok'];
const containers = document.querySelectorAll(
  '[role="dialog"],[aria-modal="true"],[class*="cookie"],[id*="cookie"],[class*="consent"],[id*="consent"],[class*="modal"],[class*="popup"]'
);
for (const box of containers) {
  const style = window.getComputedStyle(box);
  if (style.display === 'none' || style.visibility === 'hidden') continue;
  for (const el of box.querySelectorAll('button,a,[role="button"],input[type="button"],input[type="submit"]')) {
    const name = ((el.innerText || el.value || el.getAttribute('aria-label') || '') + '').trim().toLowerCase();
    if (words.some(w => name === w || name.startsWith(w + ' '))) {
      el.click();
      return true;
    }
  }
}
return false;
"#;

#[derive(Debug, Deserialize)]
struct WireError {
    error: String,
    #[serde(default)]
    message: String,
}

/// Map a W3C error code to a driver error.
fn map_wire_error(code: &str, message: &str) -> DriverError {
    let detail = if message.is_empty() {
        code.to_string()
    } else {
        message.lines().next().unwrap_or(message).to_string()
    };
    match code {
        "no such element" | "no such frame" | "no such alert" | "invalid selector" => {
            DriverError::ElementNotFound(format!("{code}: {detail}"))
        }
        "element not interactable"
        | "element click intercepted"
        | "stale element reference"
        | "invalid element state"
        | "move target out of bounds"
        | "unexpected alert open"
        | "javascript error" => DriverError::NotInteractable(format!("{code}: {detail}")),
        "timeout" | "script timeout" => DriverError::Timeout(detail),
        "invalid session id" | "session not created" | "no such window" => {
            DriverError::Unavailable(detail)
        }
        // Chrome reports a crashed or unreachable browser as "unknown error".
        _ if session_lost(&detail) => DriverError::Unavailable(format!("{code}: {detail}")),
        _ => DriverError::Protocol(format!("{code}: {detail}")),
    }
}

fn session_lost(detail: &str) -> bool {
    let detail = detail.to_ascii_lowercase();
    ["not reachable", "session deleted", "disconnected", "tab crashed"]
        .iter()
        .any(|marker| detail.contains(marker))
}

fn transport_error(e: reqwest::Error) -> DriverError {
    if e.is_timeout() {
        DriverError::Timeout(e.to_string())
    } else {
        DriverError::Unavailable(e.to_string())
    }
}

/// Unwrap the `value` envelope of a WebDriver response.
async fn read_value(response: reqwest::Response) -> DriverResult<Value> {
    let status = response.status();
    let body: Value = response.json().await.map_err(transport_error)?;
    let value = body.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }
    match serde_json::from_value::<WireError>(value) {
        Ok(err) => Err(map_wire_error(&err.error, &err.message)),
        Err(_) => Err(DriverError::Protocol(format!("HTTP {status}"))),
    }
}

fn element_id(value: &Value) -> DriverResult<String> {
    value
        .get(ELEMENT_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DriverError::Protocol("response carried no element reference".into()))
}

/// Pointer actions for a single left click at viewport coordinates.
fn click_at(x: f64, y: f64) -> Value {
    json!({
        "actions": [{
            "type": "pointer",
            "id": "mouse",
            "parameters": { "pointerType": "mouse" },
            "actions": [
                {
                    "type": "pointerMove",
                    "origin": "viewport",
                    "x": x.round() as i64,
                    "y": y.round() as i64,
                    "duration": 0
                },
                { "type": "pointerDown", "button": 0 },
                { "type": "pointerUp", "button": 0 }
            ]
        }]
    })
}

fn type_text(text: &str) -> Value {
    let keys: Vec<Value> = text
        .chars()
        .flat_map(|c| {
            let c = c.to_string();
            [
                json!({ "type": "keyDown", "value": c }),
                json!({ "type": "keyUp", "value": c }),
            ]
        })
        .collect();
    json!({
        "actions": [{ "type": "key", "id": "keyboard", "actions": keys }]
    })
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Creates one WebDriver session per run against a remote endpoint.
pub struct WebDriverFactory {
    client: Client,
    endpoint: String,
    headless: bool,
}

impl WebDriverFactory {
    pub fn new(endpoint: &str, headless: bool, command_timeout: Duration) -> DriverResult<Self> {
        let client = Client::builder()
            .timeout(command_timeout)
            .build()
            .map_err(|e| DriverError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            headless,
        })
    }

    fn capabilities(&self) -> Value {
        let mut args = vec!["--no-sandbox", "--disable-dev-shm-usage", "--window-size=1280,800"];
        if self.headless {
            args.push("--headless=new");
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args },
                    "unhandledPromptBehavior": "ignore"
                }
            }
        })
    }
}

#[async_trait]
impl DriverFactory for WebDriverFactory {
    async fn open(&self) -> DriverResult<Box<dyn PageDriver>> {
        let response = self
            .client
            .post(format!("{}/session", self.endpoint))
            .json(&self.capabilities())
            .send()
            .await
            .map_err(transport_error)?;
        let value = read_value(response).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DriverError::Protocol("new session response carried no sessionId".into())
            })?;

        debug!(%session_id, endpoint = %self.endpoint, "webdriver session opened");
        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            session_url: format!("{}/session/{}", self.endpoint, session_id),
            closed: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct WebDriverSession {
    client: Client,
    session_url: String,
    closed: bool,
}

impl WebDriverSession {
    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> DriverResult<Value> {
        let url = if path.is_empty() {
            self.session_url.clone()
        } else {
            format!("{}/{}", self.session_url, path)
        };
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(transport_error)?;
        read_value(response).await
    }

    async fn execute(&self, script: &str) -> DriverResult<Value> {
        self.command(
            Method::POST,
            "execute/sync",
            Some(json!({ "script": script, "args": [] })),
        )
        .await
    }

    async fn find(&self, selector: &str) -> DriverResult<String> {
        let value = self
            .command(
                Method::POST,
                "element",
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await?;
        element_id(&value)
    }
}

#[async_trait]
impl PageDriver for WebDriverSession {
    async fn navigate(&mut self, url: &str) -> DriverResult<()> {
        self.command(Method::POST, "url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn current_url(&mut self) -> DriverResult<String> {
        let value = self.command(Method::GET, "url", None).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DriverError::Protocol("current url is not a string".into()))
    }

    async fn perform(&mut self, locator: &Locator, action: &ElementAction) -> DriverResult<()> {
        match locator {
            Locator::Css { selector } => {
                let element = self.find(selector).await?;
                match action {
                    ElementAction::Click => {
                        let path = format!("element/{element}/click");
                        self.command(Method::POST, &path, Some(json!({}))).await?;
                    }
                    ElementAction::Fill(text) => {
                        let path = format!("element/{element}/clear");
                        self.command(Method::POST, &path, Some(json!({}))).await?;
                        self.command(
                            Method::POST,
                            &format!("element/{element}/value"),
                            Some(json!({ "text": text })),
                        )
                        .await?;
                    }
                }
            }
            Locator::Point { x, y } => {
                self.command(Method::POST, "actions", Some(click_at(*x, *y))).await?;
                if let ElementAction::Fill(text) = action {
                    self.command(Method::POST, "actions", Some(type_text(text))).await?;
                }
                // Release held input state so the next action starts clean.
                self.command(Method::DELETE, "actions", None).await?;
            }
        }
        Ok(())
    }

    async fn dom_snapshot(&mut self) -> DriverResult<Vec<DomNode>> {
        let value = self.execute(DOM_SNAPSHOT_JS).await?;
        serde_json::from_value(value)
            .map_err(|e| DriverError::Protocol(format!("malformed dom snapshot: {e}")))
    }

    async fn visual_regions(&mut self) -> DriverResult<Vec<VisualRegion>> {
        let value = self.execute(VISUAL_REGIONS_JS).await?;
        serde_json::from_value(value)
            .map_err(|e| DriverError::Protocol(format!("malformed text regions: {e}")))
    }

    async fn page_content(&mut self) -> DriverResult<String> {
        let value = self.command(Method::GET, "source", None).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DriverError::Protocol("page source is not a string".into()))
    }

    async fn screenshot(&mut self) -> DriverResult<Vec<u8>> {
        let value = self.command(Method::GET, "screenshot", None).await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| DriverError::Protocol("screenshot is not a string".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| DriverError::Protocol(format!("screenshot is not base64: {e}")))
    }

    async fn dismiss_popups(&mut self) -> DriverResult<usize> {
        let mut dismissed = 0;

        match self.command(Method::POST, "alert/dismiss", Some(json!({}))).await {
            Ok(_) => dismissed += 1,
            Err(e) if e.is_infrastructure() => return Err(e),
            // No alert open.
            Err(_) => {}
        }

        if self.execute(DISMISS_OVERLAY_JS).await?.as_bool() == Some(true) {
            dismissed += 1;
        }
        if dismissed > 0 {
            debug!(dismissed, "popups dismissed");
        }
        Ok(dismissed)
    }

    async fn close(&mut self) -> DriverResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.command(Method::DELETE, "", None).await.map(|_| ())
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if !self.closed {
            warn!(session = %self.session_url, "webdriver session dropped without close");
        }
    }
}
