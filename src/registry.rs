//! Run lifecycle and step fan-out.
//!
//! Every run owns an append-only step log. Subscribers read it through their
//! own cursor, so a watcher that attaches late replays the backlog before it
//! sees live steps, and a slow watcher never holds back a fast one.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

// ========================= Core Types =========================

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        RunId(s)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Info,
    ActionResult,
    Error,
    /// The single terminal step of a run.
    Done,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepPayload {
    pub msg: String,
    #[serde(flatten)]
    pub detail: Map<String, Value>,
}

impl StepPayload {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into(), detail: Map::new() }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub seq: u64,
    pub kind: StepKind,
    pub payload: StepPayload,
    pub at: DateTime<Utc>,
}

impl Step {
    pub fn is_terminal(&self) -> bool {
        self.kind == StepKind::Done
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: RunId,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub steps: usize,
    pub subscribers: usize,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown run: {0}")]
    UnknownRun(RunId),
    #[error("run already ended: {0}")]
    AlreadyEnded(RunId),
    #[error("{0:?} is not a final state")]
    NotTerminal(RunState),
}

// ========================= Per-run Channel =========================

struct RunLog {
    state: RunState,
    steps: Vec<Step>,
    subscribers: HashSet<u64>,
    next_subscriber: u64,
    ended_at: Option<Instant>,
}

struct RunSlot {
    id: RunId,
    created_at: DateTime<Utc>,
    log: Mutex<RunLog>,
    /// Carries the log length; bumped on every append so cursors wake up.
    len_tx: watch::Sender<usize>,
}

impl RunSlot {
    fn new(id: RunId) -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            id,
            created_at: Utc::now(),
            log: Mutex::new(RunLog {
                state: RunState::Pending,
                steps: Vec::new(),
                subscribers: HashSet::new(),
                next_subscriber: 0,
                ended_at: None,
            }),
            len_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, log: &mut RunLog, kind: StepKind, payload: StepPayload) -> u64 {
        let seq = log.steps.len() as u64;
        log.steps.push(Step { seq, kind, payload, at: Utc::now() });
        self.len_tx.send_replace(log.steps.len());
        seq
    }

    fn summary(&self) -> RunSummary {
        let log = self.lock();
        RunSummary {
            run_id: self.id.clone(),
            state: log.state,
            created_at: self.created_at,
            steps: log.steps.len(),
            subscribers: log.subscribers.len(),
        }
    }
}

/// Read cursor over one run's step log.
///
/// Yields the backlog first, then live steps, and `None` once the terminal
/// step has been delivered. Dropping it detaches from the run.
pub struct Subscriber {
    run_id: RunId,
    slot: Arc<RunSlot>,
    len_rx: watch::Receiver<usize>,
    cursor: usize,
    token: u64,
    attached: bool,
}

impl Subscriber {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub async fn next(&mut self) -> Option<Step> {
        loop {
            if !self.attached {
                return None;
            }
            self.len_rx.borrow_and_update();
            {
                let log = self.slot.lock();
                if let Some(step) = log.steps.get(self.cursor) {
                    self.cursor += 1;
                    return Some(step.clone());
                }
                if log.state.is_terminal() {
                    return None;
                }
            }
            if self.len_rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Idempotent; the run keeps going.
    pub fn unsubscribe(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        self.slot.lock().subscribers.remove(&self.token);
        debug!(run = %self.run_id, token = self.token, "subscriber detached");
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ========================= Registry =========================

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// How long an ended run stays queryable once nobody is watching it.
    pub retention: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { retention: Duration::from_secs(300) }
    }
}

#[derive(Default)]
pub struct RunRegistry {
    runs: DashMap<RunId, Arc<RunSlot>>,
    cfg: RegistryConfig,
}

impl RunRegistry {
    pub fn new(cfg: RegistryConfig) -> Self {
        Self { runs: DashMap::new(), cfg }
    }

    pub fn create_run(&self) -> RunId {
        loop {
            let id = RunId(nanoid!());
            if let Entry::Vacant(slot) = self.runs.entry(id.clone()) {
                slot.insert(Arc::new(RunSlot::new(id.clone())));
                info!(run = %id, "run created");
                return id;
            }
        }
    }

    fn slot(&self, id: &RunId) -> Result<Arc<RunSlot>, RegistryError> {
        self.runs
            .get(id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| RegistryError::UnknownRun(id.clone()))
    }

    /// Appends a non-terminal step and returns its sequence number.
    pub fn append_step(
        &self,
        id: &RunId,
        kind: StepKind,
        payload: StepPayload,
    ) -> Result<u64, RegistryError> {
        let slot = self.slot(id)?;
        let mut log = slot.lock();
        if log.state.is_terminal() || kind == StepKind::Done {
            return Err(RegistryError::UnknownRun(id.clone()));
        }
        if log.state == RunState::Pending {
            log.state = RunState::Running;
        }
        let seq = slot.push(&mut log, kind, payload);
        debug!(run = %id, seq, ?kind, "step appended");
        Ok(seq)
    }

    pub fn subscribe(&self, id: &RunId) -> Result<Subscriber, RegistryError> {
        let slot = self.slot(id)?;
        let token = {
            let mut log = slot.lock();
            let token = log.next_subscriber;
            log.next_subscriber += 1;
            log.subscribers.insert(token);
            token
        };
        let len_rx = slot.len_tx.subscribe();
        debug!(run = %id, token, "subscriber attached");
        Ok(Subscriber { run_id: id.clone(), slot, len_rx, cursor: 0, token, attached: true })
    }

    pub fn unsubscribe(&self, subscriber: &mut Subscriber) {
        subscriber.unsubscribe();
    }

    /// Appends the terminal step. Only the first call for a run has any effect,
    /// and `final_state` must be `Completed` or `Failed`.
    pub fn end_run(
        &self,
        id: &RunId,
        final_state: RunState,
        payload: StepPayload,
    ) -> Result<u64, RegistryError> {
        if !final_state.is_terminal() {
            return Err(RegistryError::NotTerminal(final_state));
        }
        let slot = self.slot(id)?;
        let mut log = slot.lock();
        if log.state.is_terminal() {
            return Err(RegistryError::AlreadyEnded(id.clone()));
        }
        log.state = final_state;
        log.ended_at = Some(Instant::now());
        let payload = payload.with("state", serde_json::to_value(final_state).unwrap_or(Value::Null));
        let seq = slot.push(&mut log, StepKind::Done, payload);
        info!(run = %id, state = ?final_state, steps = seq + 1, "run ended");
        Ok(seq)
    }

    pub fn state(&self, id: &RunId) -> Result<RunState, RegistryError> {
        Ok(self.slot(id)?.lock().state)
    }

    pub fn status(&self, id: &RunId) -> Result<RunSummary, RegistryError> {
        Ok(self.slot(id)?.summary())
    }

    pub fn steps(&self, id: &RunId) -> Result<Vec<Step>, RegistryError> {
        Ok(self.slot(id)?.lock().steps.clone())
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Drops ended runs past their retention window that nobody is watching.
    pub fn sweep(&self) -> usize {
        let retention = self.cfg.retention;
        let before = self.runs.len();
        self.runs.retain(|_, slot| {
            let log = slot.lock();
            match log.ended_at {
                Some(ended) => !(log.subscribers.is_empty() && ended.elapsed() >= retention),
                None => true,
            }
        });
        let removed = before.saturating_sub(self.runs.len());
        if removed > 0 {
            debug!(removed, "swept ended runs");
        }
        removed
    }

    /// Periodic `sweep` on a background task; stops once the registry is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                match weak.upgrade() {
                    Some(registry) => {
                        registry.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn info(msg: &str) -> StepPayload {
        StepPayload::new(msg)
    }

    async fn drain(sub: &mut Subscriber) -> Vec<Step> {
        let mut out = Vec::new();
        while let Some(step) = sub.next().await {
            out.push(step);
        }
        out
    }

    #[test]
    fn ids_are_unique_across_concurrent_creation() {
        let registry = Arc::new(RunRegistry::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&registry);
                std::thread::spawn(move || (0..200).map(|_| r.create_run()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(registry.len(), 1600);
    }

    #[test]
    fn new_run_is_pending_then_running() {
        let registry = RunRegistry::default();
        let id = registry.create_run();
        assert_eq!(registry.state(&id).unwrap(), RunState::Pending);
        registry.append_step(&id, StepKind::Info, info("launching")).unwrap();
        assert_eq!(registry.state(&id).unwrap(), RunState::Running);
    }

    #[test]
    fn sequence_numbers_are_gapless() {
        let registry = RunRegistry::default();
        let id = registry.create_run();
        for i in 0..5 {
            assert_eq!(registry.append_step(&id, StepKind::Info, info("tick")).unwrap(), i);
        }
        assert_eq!(registry.end_run(&id, RunState::Completed, info("ok")).unwrap(), 5);
        let seqs: Vec<u64> = registry.steps(&id).unwrap().iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn unknown_and_ended_runs_reject_appends() {
        let registry = RunRegistry::default();
        let ghost = RunId::from("ghost");
        assert_eq!(
            registry.append_step(&ghost, StepKind::Info, info("x")),
            Err(RegistryError::UnknownRun(ghost.clone()))
        );
        assert!(registry.subscribe(&ghost).is_err());

        let id = registry.create_run();
        registry.end_run(&id, RunState::Failed, info("boom")).unwrap();
        assert_eq!(
            registry.append_step(&id, StepKind::Info, info("late")),
            Err(RegistryError::UnknownRun(id.clone()))
        );
    }

    #[tokio::test]
    async fn late_subscriber_gets_backlog_then_live_steps() {
        let registry = Arc::new(RunRegistry::default());
        let id = registry.create_run();
        for msg in ["one", "two", "three"] {
            registry.append_step(&id, StepKind::Info, info(msg)).unwrap();
        }

        let mut sub = registry.subscribe(&id).unwrap();
        let producer = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                registry.append_step(&id, StepKind::ActionResult, info("four")).unwrap();
                registry.end_run(&id, RunState::Completed, info("done")).unwrap();
            })
        };

        let steps = drain(&mut sub).await;
        producer.await.unwrap();
        let msgs: Vec<&str> = steps.iter().map(|s| s.payload.msg.as_str()).collect();
        assert_eq!(msgs, vec!["one", "two", "three", "four", "done"]);
        assert!(steps.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn subscribers_are_independent() {
        let registry = RunRegistry::default();
        let id = registry.create_run();
        let mut fast = registry.subscribe(&id).unwrap();
        registry.append_step(&id, StepKind::Info, info("a")).unwrap();
        assert_eq!(fast.next().await.unwrap().payload.msg, "a");

        let mut slow = registry.subscribe(&id).unwrap();
        registry.append_step(&id, StepKind::Info, info("b")).unwrap();
        registry.end_run(&id, RunState::Completed, info("end")).unwrap();

        let fast_rest: Vec<_> = drain(&mut fast).await.into_iter().map(|s| s.payload.msg).collect();
        let slow_all: Vec<_> = drain(&mut slow).await.into_iter().map(|s| s.payload.msg).collect();
        assert_eq!(fast_rest, vec!["b", "end"]);
        assert_eq!(slow_all, vec!["a", "b", "end"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_end_run_appends_one_terminal_step() {
        let registry = Arc::new(RunRegistry::default());
        let id = registry.create_run();
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                let state = if i % 2 == 0 { RunState::Completed } else { RunState::Failed };
                tokio::spawn(async move { registry.end_run(&id, state, info("end")).is_ok() })
            })
            .collect();
        let mut winners = 0;
        for t in tasks {
            if t.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        let terminal = registry.steps(&id).unwrap().iter().filter(|s| s.is_terminal()).count();
        assert_eq!(terminal, 1);
        assert_eq!(
            registry.end_run(&id, RunState::Completed, info("again")),
            Err(RegistryError::AlreadyEnded(id.clone()))
        );
    }

    #[tokio::test]
    async fn terminal_step_records_final_state() {
        let registry = RunRegistry::default();
        let id = registry.create_run();
        registry.end_run(&id, RunState::Failed, info("no strategy matched")).unwrap();
        let steps = registry.steps(&id).unwrap();
        assert_eq!(steps[0].kind, StepKind::Done);
        assert_eq!(steps[0].payload.detail["state"], "failed");
        assert_eq!(registry.state(&id).unwrap(), RunState::Failed);
    }

    #[test]
    fn end_run_rejects_running_and_pending() {
        let registry = RunRegistry::default();
        let id = registry.create_run();
        for state in [RunState::Pending, RunState::Running] {
            assert_eq!(
                registry.end_run(&id, state, info("not yet")),
                Err(RegistryError::NotTerminal(state))
            );
        }
        assert!(!registry.state(&id).unwrap().is_terminal());
        assert!(registry.steps(&id).unwrap().is_empty());
        registry.end_run(&id, RunState::Completed, info("ok")).unwrap();
    }

    #[test]
    fn unsubscribe_is_idempotent_and_does_not_touch_run() {
        let registry = RunRegistry::default();
        let id = registry.create_run();
        let mut sub = registry.subscribe(&id).unwrap();
        assert_eq!(registry.status(&id).unwrap().subscribers, 1);
        registry.unsubscribe(&mut sub);
        registry.unsubscribe(&mut sub);
        assert!(!sub.is_attached());
        assert_eq!(registry.status(&id).unwrap().subscribers, 0);
        registry.append_step(&id, StepKind::Info, info("still going")).unwrap();
        assert_eq!(registry.state(&id).unwrap(), RunState::Running);
    }

    #[test]
    fn dropping_subscriber_detaches() {
        let registry = RunRegistry::default();
        let id = registry.create_run();
        {
            let _a = registry.subscribe(&id).unwrap();
            let _b = registry.subscribe(&id).unwrap();
            assert_eq!(registry.status(&id).unwrap().subscribers, 2);
        }
        assert_eq!(registry.status(&id).unwrap().subscribers, 0);
    }

    #[test]
    fn sweep_respects_retention_and_watchers() {
        let registry = RunRegistry::new(RegistryConfig { retention: Duration::ZERO });
        let live = registry.create_run();
        let watched = registry.create_run();
        let idle = registry.create_run();
        registry.end_run(&watched, RunState::Completed, info("ok")).unwrap();
        registry.end_run(&idle, RunState::Completed, info("ok")).unwrap();
        let sub = registry.subscribe(&watched).unwrap();

        assert_eq!(registry.sweep(), 1);
        assert!(registry.status(&idle).is_err());
        assert!(registry.status(&live).is_ok());
        assert!(registry.status(&watched).is_ok());

        drop(sub);
        assert_eq!(registry.sweep(), 1);
        assert!(registry.status(&watched).is_err());
    }

    #[test]
    fn sweep_keeps_runs_inside_retention() {
        let registry = RunRegistry::default();
        let id = registry.create_run();
        registry.end_run(&id, RunState::Completed, info("ok")).unwrap();
        assert_eq!(registry.sweep(), 0);
        assert!(registry.status(&id).is_ok());
    }

    #[tokio::test]
    async fn subscriber_sees_end_of_stream_after_terminal() {
        let registry = RunRegistry::default();
        let id = registry.create_run();
        registry.end_run(&id, RunState::Completed, info("ok")).unwrap();
        let mut sub = registry.subscribe(&id).unwrap();
        assert!(sub.next().await.unwrap().is_terminal());
        assert!(sub.next().await.is_none());
    }
}
