use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// ========================= Core Types =========================

/// How an element is looked up on the page. Opaque to everything but the driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Locator {
    Css { selector: String },
    XPath { expr: String },
    Text { pattern: String },
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css { selector: selector.into() }
    }

    pub fn text(pattern: impl Into<String>) -> Self {
        Locator::Text { pattern: pattern.into() }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css { selector } => write!(f, "{selector}"),
            Locator::XPath { expr } => write!(f, "xpath:{expr}"),
            Locator::Text { pattern } => write!(f, "text:{pattern}"),
        }
    }
}

/// One probe tried during action resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyCandidate {
    pub locator: Locator,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl StrategyCandidate {
    pub fn new(locator: Locator, timeout: Duration) -> Self {
        Self { locator, timeout }
    }

    pub fn css(selector: impl Into<String>, timeout: Duration) -> Self {
        Self::new(Locator::css(selector), timeout)
    }
}

impl fmt::Display for StrategyCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.locator.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Return as soon as the navigation is committed.
    Commit,
    /// Wait for the load event.
    Load,
    /// Wait for the load event, then give in-flight requests a moment to settle.
    #[default]
    NetworkIdle,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("browser unavailable: {0}")]
    Unavailable(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("transport error: {0}")]
    Transport(String),
}

// ========================= Collaborator Contract =========================

/// Hands out the session page to one run at a time.
///
/// The page outlives the run: dropping the handle gives it back so the next
/// run continues where this one left off. `open` waits while another run
/// holds the page, and reopens it if it was closed or has died.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn open(&self, headless: bool) -> Result<Box<dyn Page>, DriverError>;
}

#[async_trait]
pub trait Page: Send + Sync {
    async fn navigate(&self, url: &str, wait: WaitPolicy) -> Result<(), DriverError>;

    /// Resolves to `true` once an element matching the candidate exists,
    /// `false` if none appeared within `timeout`.
    async fn wait_for_probe(
        &self,
        candidate: &StrategyCandidate,
        timeout: Duration,
    ) -> Result<bool, DriverError>;

    async fn click(&self, candidate: &StrategyCandidate) -> Result<(), DriverError>;

    async fn type_text(&self, candidate: &StrategyCandidate, text: &str) -> Result<(), DriverError>;

    /// Sends one key (e.g. `"Enter"`) to the element the candidate matches.
    async fn press_key(&self, candidate: &StrategyCandidate, key: &str) -> Result<(), DriverError>;

    /// PNG bytes of the current viewport.
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;

    /// Discards the page for good; the next `open` starts a fresh one.
    async fn close(&self) -> Result<(), DriverError>;
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ========================= Test Doubles =========================
