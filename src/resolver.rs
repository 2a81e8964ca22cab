use crate::driver::{Page, StrategyCandidate, WaitPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

// ========================= Core Types =========================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ActionIntent {
    Click,
    TypeText(String),
    Navigate(String),
    Screenshot,
}

impl ActionIntent {
    /// Short name safe to log; never includes typed text.
    pub fn kind(&self) -> &'static str {
        match self {
            ActionIntent::Click => "click",
            ActionIntent::TypeText(_) => "type",
            ActionIntent::Navigate(_) => "navigate",
            ActionIntent::Screenshot => "screenshot",
        }
    }
}

/// Classified failure reasons, as reported to watchers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("unknown run")]
    UnknownRun,
    #[error("no strategy matched")]
    NoStrategyMatched,
    #[error("capture failed")]
    CaptureFailed,
    #[error("perception unavailable")]
    PerceptionUnavailable,
    #[error("driver transport error")]
    DriverTransportError,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ActionOutcome {
    pub succeeded: bool,
    pub strategy_used: Option<StrategyCandidate>,
    pub error: Option<ErrorKind>,
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
}

impl ActionOutcome {
    fn success(strategy_used: Option<StrategyCandidate>) -> Self {
        Self { succeeded: true, strategy_used, ..Default::default() }
    }

    fn failure(kind: ErrorKind) -> Self {
        Self { succeeded: false, error: Some(kind), ..Default::default() }
    }
}

// ========================= Resolver =========================

#[derive(Clone, Debug)]
pub struct ResolverConfig {
    /// Upper bound on the effect (click/type/navigate) once a probe matched.
    pub action_timeout: Duration,
    pub navigate_wait: WaitPolicy,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { action_timeout: Duration::from_secs(10), navigate_wait: WaitPolicy::NetworkIdle }
    }
}

/// Turns an intent plus an ordered candidate list into one outcome.
/// Candidates are tried strictly in order and the first viable one wins.
#[derive(Clone, Debug, Default)]
pub struct ActionResolver {
    cfg: ResolverConfig,
}

impl ActionResolver {
    pub fn new(cfg: ResolverConfig) -> Self {
        Self { cfg }
    }

    pub async fn resolve(
        &self,
        page: &dyn Page,
        intent: &ActionIntent,
        candidates: &[StrategyCandidate],
    ) -> ActionOutcome {
        match intent {
            ActionIntent::Navigate(url) => self.navigate(page, url).await,
            ActionIntent::Screenshot => match page.screenshot().await {
                Ok(png) => ActionOutcome { screenshot: Some(png), ..ActionOutcome::success(None) },
                Err(e) => {
                    warn!(error = %e, "screenshot failed");
                    ActionOutcome::failure(ErrorKind::CaptureFailed)
                }
            },
            ActionIntent::Click | ActionIntent::TypeText(_) => {
                self.probe_in_order(page, intent, candidates).await
            }
        }
    }

    /// Presses `key` on an element a previous action already resolved; no probing.
    pub async fn press_key(&self, page: &dyn Page, candidate: &StrategyCandidate, key: &str) -> ActionOutcome {
        match timeout(self.cfg.action_timeout, page.press_key(candidate, key)).await {
            Ok(Ok(())) => ActionOutcome::success(Some(candidate.clone())),
            Ok(Err(e)) => {
                warn!(%key, candidate = %candidate, error = %e, "key press failed");
                ActionOutcome::failure(ErrorKind::DriverTransportError)
            }
            Err(_) => {
                warn!(%key, candidate = %candidate, "key press timed out");
                ActionOutcome::failure(ErrorKind::DriverTransportError)
            }
        }
    }

    async fn navigate(&self, page: &dyn Page, url: &str) -> ActionOutcome {
        match timeout(self.cfg.action_timeout, page.navigate(url, self.cfg.navigate_wait)).await {
            Ok(Ok(())) => {
                info!(%url, "navigated");
                ActionOutcome::success(None)
            }
            Ok(Err(e)) => {
                warn!(%url, error = %e, "navigation failed");
                ActionOutcome::failure(ErrorKind::DriverTransportError)
            }
            Err(_) => {
                warn!(%url, "navigation timed out");
                ActionOutcome::failure(ErrorKind::DriverTransportError)
            }
        }
    }

    async fn probe_in_order(
        &self,
        page: &dyn Page,
        intent: &ActionIntent,
        candidates: &[StrategyCandidate],
    ) -> ActionOutcome {
        for (idx, candidate) in candidates.iter().enumerate() {
            let viable = match timeout(candidate.timeout, page.wait_for_probe(candidate, candidate.timeout)).await {
                Ok(Ok(found)) => found,
                Ok(Err(e)) => {
                    debug!(candidate = %candidate, error = %e, "probe errored");
                    false
                }
                Err(_) => false,
            };
            if !viable {
                debug!(idx, candidate = %candidate, "candidate not viable");
                continue;
            }

            match timeout(self.cfg.action_timeout, Self::apply(page, intent, candidate)).await {
                Ok(Ok(())) => {
                    info!(intent = intent.kind(), candidate = %candidate, "action resolved");
                    return ActionOutcome::success(Some(candidate.clone()));
                }
                Ok(Err(e)) => {
                    debug!(intent = intent.kind(), candidate = %candidate, error = %e, "action failed on candidate");
                }
                Err(_) => {
                    debug!(intent = intent.kind(), candidate = %candidate, "action timed out on candidate");
                }
            }
        }
        warn!(intent = intent.kind(), tried = candidates.len(), "no strategy matched");
        ActionOutcome::failure(ErrorKind::NoStrategyMatched)
    }

    async fn apply(
        page: &dyn Page,
        intent: &ActionIntent,
        candidate: &StrategyCandidate,
    ) -> Result<(), crate::driver::DriverError> {
        match intent {
            ActionIntent::Click => page.click(candidate).await,
            ActionIntent::TypeText(text) => page.type_text(candidate, text).await,
            // resolve() routes these before probing
            ActionIntent::Navigate(_) | ActionIntent::Screenshot => Ok(()),
        }
    }
}

// ========================= Built-in Candidates =========================

pub mod candidates {
    use crate::driver::StrategyCandidate;
    use std::time::Duration;

    pub const PROBE_TIMEOUT: Duration = Duration::from_millis(2000);

    fn list(selectors: &[&str], timeout: Duration) -> Vec<StrategyCandidate> {
        selectors.iter().map(|s| StrategyCandidate::css(*s, timeout)).collect()
    }

    pub fn click(timeout: Duration) -> Vec<StrategyCandidate> {
        list(&["button", "a", "input[type=\"submit\"]", ".btn", ".button"], timeout)
    }

    pub fn type_text(timeout: Duration) -> Vec<StrategyCandidate> {
        list(&["input[type=\"text\"]", "input[type=\"email\"]", "textarea", "input"], timeout)
    }

    pub fn email(timeout: Duration) -> Vec<StrategyCandidate> {
        list(&["input[type=\"email\"]", "input[name=\"email\"]", "input[type=\"text\"]", "#email"], timeout)
    }

    pub fn password(timeout: Duration) -> Vec<StrategyCandidate> {
        list(&["input[type=\"password\"]", "input[name=\"password\"]", "#password"], timeout)
    }

    pub fn search_box(timeout: Duration) -> Vec<StrategyCandidate> {
        list(
            &["input[name=\"q\"]", "textarea[name=\"q\"]", "input[name=\"search_query\"]", "input[type=\"search\"]"],
            timeout,
        )
    }

    pub fn submit(timeout: Duration) -> Vec<StrategyCandidate> {
        let mut out = list(&["button[type=\"submit\"]", "input[type=\"submit\"]"], timeout);
        out.push(StrategyCandidate::new(crate::driver::Locator::text("Login"), timeout));
        out.push(StrategyCandidate::css(".login-button", timeout));
        out
    }
}
