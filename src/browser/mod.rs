//! Browser automation seam.
//!
//! The worker never talks to a browser directly: it drives a [`PageDriver`]
//! obtained from a [`DriverFactory`]. Locating elements is the job of the
//! strategy resolver; drivers only execute primitives against a [`Locator`].

pub mod webdriver;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("browser unavailable: {0}")]
    Unavailable(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("element not interactable: {0}")]
    NotInteractable(String),

    #[error("browser operation timed out: {0}")]
    Timeout(String),

    #[error("webdriver protocol error: {0}")]
    Protocol(String),
}

impl DriverError {
    /// True when the browser session itself is gone rather than a single
    /// interaction having missed its target. Everything else is a miss the
    /// resolver can recover from by trying the next tier.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, DriverError::Unavailable(_))
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// How to reach an element. Serialized as the `action_data` of a session
/// memory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Locator {
    Css { selector: String },
    Point { x: f64, y: f64 },
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css {
            selector: selector.into(),
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Locator::Css { selector } => write!(f, "css:{selector}"),
            Locator::Point { x, y } => write!(f, "point:{x:.0},{y:.0}"),
        }
    }
}

/// Interaction to perform once an element is located.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementAction {
    Click,
    Fill(String),
}

impl ElementAction {
    pub fn kind(&self) -> &'static str {
        match self {
            ElementAction::Click => "click",
            ElementAction::Fill(_) => "fill",
        }
    }
}

/// An element from a structural snapshot of the live page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomNode {
    pub tag: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub text: String,
    /// Text of an associated `<label>`, if any.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Unique CSS selector for this node, computed by the driver.
    pub selector: String,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

/// A rendered, visible block of text with its viewport bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualRegion {
    pub text: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl VisualRegion {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// One browser page driven by the executor.
#[async_trait]
pub trait PageDriver: Send {
    async fn navigate(&mut self, url: &str) -> DriverResult<()>;

    async fn current_url(&mut self) -> DriverResult<String>;

    async fn perform(&mut self, locator: &Locator, action: &ElementAction) -> DriverResult<()>;

    async fn dom_snapshot(&mut self) -> DriverResult<Vec<DomNode>>;

    async fn visual_regions(&mut self) -> DriverResult<Vec<VisualRegion>>;

    /// Full page source, used by `verify` steps.
    async fn page_content(&mut self) -> DriverResult<String>;

    /// PNG bytes of the current viewport.
    async fn screenshot(&mut self) -> DriverResult<Vec<u8>>;

    /// Dismiss dialogs and consent overlays. Returns how many were closed.
    async fn dismiss_popups(&mut self) -> DriverResult<usize>;

    async fn close(&mut self) -> DriverResult<()>;
}

/// Opens a fresh page for every run.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn open(&self) -> DriverResult<Box<dyn PageDriver>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_serializes_tagged() {
        let json = serde_json::to_value(Locator::css("#submit")).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "css", "selector": "#submit"}));

        let point: Locator = serde_json::from_str(r#"{"kind":"point","x":10.0,"y":20.5}"#).unwrap();
        assert_eq!(point, Locator::Point { x: 10.0, y: 20.5 });
    }

    #[test]
    fn test_infrastructure_classification() {
        assert!(DriverError::Unavailable("session gone".into()).is_infrastructure());
        assert!(!DriverError::ElementNotFound("#x".into()).is_infrastructure());
        assert!(!DriverError::Timeout("click".into()).is_infrastructure());
        assert!(!DriverError::Protocol("unknown error: boom".into()).is_infrastructure());
    }

    #[test]
    fn test_region_center() {
        let region = VisualRegion {
            text: "Sign in".into(),
            x: 100.0,
            y: 40.0,
            width: 80.0,
            height: 20.0,
        };
        assert_eq!(region.center(), (140.0, 50.0));
    }
}
