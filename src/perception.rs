//! Single-pass capture → analyze → classify → act → verify loop.
//!
//! One call to [`PerceptionLoop::execute`] drives one run from its first step
//! to its terminal step. Everything the loop learns is reported as steps
//! through the [`RunRegistry`]; nothing is thrown across the run boundary.
//! Every step the loop emits carries the phase it was emitted from.

use crate::classify::{KeywordClassifier, LoginProfile, TaskClassifier, TaskPlan};
use crate::driver::{Driver, Page, StrategyCandidate};
use crate::registry::{RunId, RunRegistry, RunState, StepKind, StepPayload};
use crate::resolver::{candidates, ActionIntent, ActionOutcome, ActionResolver, ErrorKind};
use crate::snapshots::SnapshotStore;
use crate::vision::{Perception, PerceptionRequest};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct LoopConfig {
    pub headless: bool,
    pub analysis_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            headless: true,
            analysis_timeout: Duration::from_secs(120),
            probe_timeout: candidates::PROBE_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Capturing,
    Analyzing,
    Classifying,
    Acting,
    Verifying,
    Completed,
    Failed,
}

enum Verdict {
    Completed(StepPayload),
    Failed { kind: Option<ErrorKind>, msg: String },
}

impl Verdict {
    fn failed(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Verdict::Failed { kind: Some(kind), msg: msg.into() }
    }

    /// A page that cannot even be captured is not worth handing to the next run.
    fn discards_page(&self) -> bool {
        matches!(self, Verdict::Failed { kind: Some(ErrorKind::CaptureFailed), .. })
    }
}

pub struct PerceptionLoop {
    registry: Arc<RunRegistry>,
    driver: Arc<dyn Driver>,
    perception: Arc<dyn Perception>,
    classifier: Arc<dyn TaskClassifier>,
    resolver: ActionResolver,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    cfg: LoopConfig,
}

impl PerceptionLoop {
    pub fn new(
        registry: Arc<RunRegistry>,
        driver: Arc<dyn Driver>,
        perception: Arc<dyn Perception>,
        cfg: LoopConfig,
    ) -> Self {
        Self {
            registry,
            driver,
            perception,
            classifier: Arc::new(KeywordClassifier::default()),
            resolver: ActionResolver::default(),
            snapshot_store: None,
            cfg,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn TaskClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_resolver(mut self, resolver: ActionResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Allocates a run and drives it on its own task. Returns immediately.
    pub fn start(self: &Arc<Self>, task: String, headless: Option<bool>) -> RunId {
        let run_id = self.registry.create_run();
        let this = Arc::clone(self);
        let id = run_id.clone();
        tokio::spawn(async move {
            let worker = {
                let this = Arc::clone(&this);
                let id = id.clone();
                tokio::spawn(async move { this.execute(&id, &task, headless).await })
            };
            // A panicking run must still reach its terminal step.
            if let Err(e) = worker.await {
                error!(run = %id, error = %e, "run task aborted");
                this.finish(&id, Verdict::Failed { kind: None, msg: "run aborted unexpectedly".into() });
            }
        });
        run_id
    }

    /// Drives one run. Waits for the session page if another run holds it;
    /// the page is handed back, not closed, when the run ends.
    pub async fn execute(&self, run_id: &RunId, task: &str, headless: Option<bool>) {
        let headless = headless.unwrap_or(self.cfg.headless);
        info!(run = %run_id, %task, headless, "run started");
        let verdict = match self.driver.open(headless).await {
            Ok(page) => {
                let verdict = self.drive(run_id, task, page.as_ref()).await;
                if verdict.discards_page() {
                    if let Err(e) = page.close().await {
                        warn!(run = %run_id, error = %e, "page close failed");
                    }
                }
                verdict
            }
            Err(e) => Verdict::failed(
                ErrorKind::DriverTransportError,
                format!("could not open a browser page: {e}"),
            ),
        };
        self.finish(run_id, verdict);
    }

    async fn drive(&self, run_id: &RunId, task: &str, page: &dyn Page) -> Verdict {
        // Literal destinations need no perception at all.
        match self.classifier.classify(task, None) {
            TaskPlan::Act(ActionIntent::Navigate(url)) => {
                return self.navigate_directly(run_id, page, &url).await;
            }
            plan @ TaskPlan::Search { .. } => return self.carry_out(run_id, page, plan, None).await,
            _ => {}
        }

        self.emit(run_id, Phase::Capturing, StepKind::Info, StepPayload::new("capturing page"));
        let png = match page.screenshot().await {
            Ok(png) => png,
            Err(e) => {
                return Verdict::failed(ErrorKind::CaptureFailed, format!("could not capture the page: {e}"))
            }
        };
        let capture_path = self.persist(run_id, "capture", &png).await;

        let mut analyzing = StepPayload::new("analyzing snapshot").with("bytes", png.len());
        if let Some(path) = capture_path {
            analyzing = analyzing.with("snapshot", path);
        }
        self.emit(run_id, Phase::Analyzing, StepKind::Info, analyzing);
        let analysis = self.analyze(run_id, task, png).await;

        let plan = self.classifier.classify(task, analysis.as_deref());
        debug!(run = %run_id, phase = ?Phase::Classifying, ?plan, "task classified");
        self.carry_out(run_id, page, plan, analysis).await
    }

    /// Acting and Verifying for an already classified plan.
    async fn carry_out(&self, run_id: &RunId, page: &dyn Page, plan: TaskPlan, analysis: Option<String>) -> Verdict {
        let done = match plan {
            TaskPlan::Describe => {
                let text = analysis.unwrap_or_else(|| "no analysis available; nothing to do".to_string());
                return Verdict::Completed(StepPayload::new(text).with("intent", "describe"));
            }
            TaskPlan::Act(intent) => {
                let cands = self.candidates_for(&intent);
                match self.act(run_id, page, intent.kind(), &intent, &cands).await {
                    Ok(outcome) => {
                        if let Some(png) = &outcome.screenshot {
                            if let Some(path) = self.persist(run_id, "screenshot", png).await {
                                debug!(run = %run_id, %path, "screenshot saved");
                            }
                        }
                        StepPayload::new(completion_message(&intent, &outcome)).with("intent", intent.kind())
                    }
                    Err(verdict) => return verdict,
                }
            }
            TaskPlan::Login(profile) => match self.login(run_id, page, &profile).await {
                Ok(()) => StepPayload::new("logged in").with("intent", "login"),
                Err(verdict) => return verdict,
            },
            TaskPlan::Search { url, term } => match self.search(run_id, page, &url, &term).await {
                Ok(()) => StepPayload::new(format!("searched {url} for \"{term}\"")).with("intent", "search"),
                Err(verdict) => return verdict,
            },
        };

        self.verify(run_id, page).await;
        let done = match analysis {
            Some(text) => done.with("analysis", text),
            None => done,
        };
        Verdict::Completed(done)
    }

    async fn navigate_directly(&self, run_id: &RunId, page: &dyn Page, url: &str) -> Verdict {
        let outcome = self
            .resolver
            .resolve(page, &ActionIntent::Navigate(url.to_string()), &[])
            .await;
        if !outcome.succeeded {
            let kind = outcome.error.unwrap_or(ErrorKind::DriverTransportError);
            return Verdict::failed(kind, format!("could not navigate to {url}"));
        }
        let msg = format!("navigated to {url}");
        self.emit(run_id, Phase::Acting, StepKind::Info, StepPayload::new(msg.clone()).with("url", url));
        Verdict::Completed(StepPayload::new(msg).with("intent", "navigate"))
    }

    async fn analyze(&self, run_id: &RunId, task: &str, png: Vec<u8>) -> Option<String> {
        let req = PerceptionRequest { task_text: task.to_string(), image: png };
        let reason = match timeout(self.cfg.analysis_timeout, self.perception.analyze(req)).await {
            Ok(Ok(analysis)) => return Some(analysis.analysis_text),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no answer within {}s", self.cfg.analysis_timeout.as_secs()),
        };
        warn!(run = %run_id, %reason, "perception unavailable, falling back to task text");
        self.emit(
            run_id,
            Phase::Analyzing,
            StepKind::Error,
            StepPayload::new("vision analysis unavailable; using task text only")
                .with("error", kind_value(ErrorKind::PerceptionUnavailable))
                .with("reason", reason),
        );
        None
    }

    /// Runs one intent through the resolver and reports it as an action-result step.
    async fn act(
        &self,
        run_id: &RunId,
        page: &dyn Page,
        label: &str,
        intent: &ActionIntent,
        cands: &[StrategyCandidate],
    ) -> Result<ActionOutcome, Verdict> {
        let outcome = self.resolver.resolve(page, intent, cands).await;
        self.report(run_id, label, intent.kind(), outcome)
    }

    fn report(&self, run_id: &RunId, label: &str, kind: &str, outcome: ActionOutcome) -> Result<ActionOutcome, Verdict> {
        let msg = if outcome.succeeded { format!("{label}: ok") } else { format!("{label}: failed") };
        let mut payload = StepPayload::new(msg).with("intent", kind);
        if let Ok(Value::Object(detail)) = serde_json::to_value(&outcome) {
            payload.detail.extend(detail);
        }
        self.emit(run_id, Phase::Acting, StepKind::ActionResult, payload);

        if outcome.succeeded {
            return Ok(outcome);
        }
        let kind = outcome.error.unwrap_or(ErrorKind::NoStrategyMatched);
        let msg = match kind {
            ErrorKind::NoStrategyMatched => format!("{label}: no matching element found on the page"),
            ErrorKind::CaptureFailed => format!("{label}: could not capture the page"),
            _ => format!("{label}: browser did not respond"),
        };
        Err(Verdict::failed(kind, msg))
    }

    async fn login(&self, run_id: &RunId, page: &dyn Page, profile: &LoginProfile) -> Result<(), Verdict> {
        let probe = self.cfg.probe_timeout;
        let plan = [
            ("open login page", ActionIntent::Navigate(profile.url.clone()), Vec::new()),
            ("enter email", ActionIntent::TypeText(profile.email.clone()), candidates::email(probe)),
            ("enter password", ActionIntent::TypeText(profile.password.clone()), candidates::password(probe)),
            ("submit", ActionIntent::Click, candidates::submit(probe)),
        ];
        for (label, intent, cands) in &plan {
            self.act(run_id, page, label, intent, cands).await?;
        }
        Ok(())
    }

    /// Opens the site, types the term into its search box and presses Enter there.
    async fn search(&self, run_id: &RunId, page: &dyn Page, url: &str, term: &str) -> Result<(), Verdict> {
        let open = ActionIntent::Navigate(url.to_string());
        self.act(run_id, page, "open search page", &open, &[]).await?;

        let query = ActionIntent::TypeText(term.to_string());
        let typed = self
            .act(run_id, page, "enter search term", &query, &candidates::search_box(self.cfg.probe_timeout))
            .await?;
        let Some(search_box) = typed.strategy_used else {
            return Err(Verdict::failed(ErrorKind::NoStrategyMatched, "enter search term: no search box"));
        };
        let pressed = self.resolver.press_key(page, &search_box, "Enter").await;
        self.report(run_id, "submit search", "press_key", pressed)?;
        Ok(())
    }

    async fn verify(&self, run_id: &RunId, page: &dyn Page) {
        let mut payload = StepPayload::new("verifying result");
        match page.screenshot().await {
            Ok(png) => {
                if let Some(path) = self.persist(run_id, "verify", &png).await {
                    payload = payload.with("snapshot", path);
                }
            }
            Err(e) => debug!(run = %run_id, error = %e, "verification capture failed"),
        }
        self.emit(run_id, Phase::Verifying, StepKind::Info, payload);
    }

    fn candidates_for(&self, intent: &ActionIntent) -> Vec<StrategyCandidate> {
        match intent {
            ActionIntent::Click => candidates::click(self.cfg.probe_timeout),
            ActionIntent::TypeText(_) => candidates::type_text(self.cfg.probe_timeout),
            ActionIntent::Navigate(_) | ActionIntent::Screenshot => Vec::new(),
        }
    }

    async fn persist(&self, run_id: &RunId, label: &str, png: &[u8]) -> Option<String> {
        let store = self.snapshot_store.as_ref()?;
        match store.save(run_id.as_str(), label, png).await {
            Ok(path) => Some(path.display().to_string()),
            Err(e) => {
                warn!(run = %run_id, error = %e, "snapshot not saved");
                None
            }
        }
    }

    fn finish(&self, run_id: &RunId, verdict: Verdict) {
        let result = match verdict {
            Verdict::Completed(payload) => {
                debug!(run = %run_id, phase = ?Phase::Completed, "phase");
                self.registry.end_run(run_id, RunState::Completed, payload)
            }
            Verdict::Failed { kind, msg } => {
                let mut payload = StepPayload::new(msg);
                if let Some(kind) = kind {
                    payload = payload.with("error", kind_value(kind));
                }
                self.emit(run_id, Phase::Failed, StepKind::Error, payload.clone());
                self.registry.end_run(run_id, RunState::Failed, payload)
            }
        };
        if let Err(e) = result {
            debug!(run = %run_id, error = %e, "run already finished");
        }
    }

    fn emit(&self, run_id: &RunId, phase: Phase, kind: StepKind, payload: StepPayload) {
        debug!(run = %run_id, ?phase, ?kind, "phase");
        let payload = payload.with("phase", serde_json::to_value(phase).unwrap_or(Value::Null));
        if let Err(e) = self.registry.append_step(run_id, kind, payload) {
            warn!(run = %run_id, error = %e, "step dropped");
        }
    }
}

fn kind_value(kind: ErrorKind) -> Value {
    serde_json::to_value(kind).unwrap_or(Value::Null)
}

fn completion_message(intent: &ActionIntent, outcome: &ActionOutcome) -> String {
    let via = outcome
        .strategy_used
        .as_ref()
        .map(|c| format!(" via {c}"))
        .unwrap_or_default();
    match intent {
        ActionIntent::Click => format!("clicked{via}"),
        ActionIntent::TypeText(_) => format!("typed text{via}"),
        ActionIntent::Navigate(url) => format!("navigated to {url}"),
        ActionIntent::Screenshot => "screenshot captured".to_string(),
    }
}
