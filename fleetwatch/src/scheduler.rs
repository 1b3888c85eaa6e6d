//! Poll scheduler: independent repeating tasks, each bound to a set of entities and an
//! interval. Every tick fans out one fetch per entity and forwards each result as it
//! settles. A task never overlaps itself, and results arriving after `stop` are dropped.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::types::{EntityId, RawSample};

pub type FetchFn =
    Arc<dyn Fn(EntityId) -> BoxFuture<'static, Result<Vec<RawSample>, SourceError>> + Send + Sync>;

pub type SinkFn = Arc<dyn Fn(&EntityId, FetchOutcome) + Send + Sync>;

pub fn fetch_fn<F, Fut>(f: F) -> FetchFn
where
    F: Fn(EntityId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<RawSample>, SourceError>> + Send + 'static,
{
    Arc::new(move |entity: EntityId| f(entity).boxed())
}

pub fn sink_fn<F>(f: F) -> SinkFn
where
    F: Fn(&EntityId, FetchOutcome) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Result of one entity fetch within a cycle.
#[derive(Debug)]
pub enum FetchOutcome {
    Samples(Vec<RawSample>),
    /// The fetch worked but nothing has been collected for this entity.
    Empty,
    Failed(SourceError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub ok: usize,
    pub empty: usize,
    pub failed: usize,
    /// Results that arrived after the task was stopped.
    pub dropped: usize,
}

/// Open/closed flag of one task. Deliveries run under the gate's lock, so once `close`
/// returns no sink call of that task is running or will start.
#[derive(Debug)]
pub struct TaskGate {
    open: AtomicBool,
    delivering: Mutex<()>,
}

impl Default for TaskGate {
    fn default() -> Self {
        Self {
            open: AtomicBool::new(true),
            delivering: Mutex::new(()),
        }
    }
}

impl TaskGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Blocks until an in-progress delivery finishes.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        drop(self.delivering.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Run `f` unless the gate is closed. Returns whether it ran.
    fn deliver(&self, f: impl FnOnce()) -> bool {
        let _held = self.delivering.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_open() {
            return false;
        }
        f();
        true
    }
}

/// One poll cycle: fetch every entity concurrently, deliver results on arrival, return
/// once all fetches have settled.
pub async fn run_cycle(
    task: &str,
    entities: &[EntityId],
    fetch: &FetchFn,
    sink: &SinkFn,
    gate: &TaskGate,
) -> CycleReport {
    let mut pending: FuturesUnordered<_> = entities
        .iter()
        .map(|entity| {
            let fut = fetch(entity.clone());
            async move { (entity, fut.await) }
        })
        .collect();

    let mut report = CycleReport::default();
    while let Some((entity, result)) = pending.next().await {
        if !gate.is_open() {
            report.dropped += 1;
            continue;
        }
        let outcome = match result {
            Ok(rows) if rows.is_empty() => {
                report.empty += 1;
                FetchOutcome::Empty
            }
            Ok(rows) => {
                report.ok += 1;
                FetchOutcome::Samples(rows)
            }
            Err(e) => {
                warn!(task, entity = %entity, error = %e, "fetch failed");
                report.failed += 1;
                FetchOutcome::Failed(e)
            }
        };
        if !gate.deliver(|| sink(entity, outcome)) {
            report.dropped += 1;
        }
    }
    report
}

struct TaskHandle {
    gate: Arc<TaskGate>,
    join: JoinHandle<()>,
    entities: Vec<EntityId>,
    interval: Duration,
}

impl TaskHandle {
    fn cancel(self) {
        self.gate.close();
        self.join.abort();
    }
}

/// Owns named polling tasks. Must be used from within a tokio runtime.
#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<HashMap<String, TaskHandle>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin polling `entities` every `interval`. The first cycle runs immediately.
    /// Starting an id that is already running replaces it.
    pub fn start(
        &self,
        task: &str,
        entities: Vec<EntityId>,
        interval: Duration,
        fetch: FetchFn,
        sink: SinkFn,
    ) {
        let interval = interval.max(Duration::from_millis(1));
        let gate = Arc::new(TaskGate::new());
        let join = tokio::spawn({
            let task = task.to_string();
            let entities = entities.clone();
            let gate = gate.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if !gate.is_open() {
                        break;
                    }
                    let r = run_cycle(&task, &entities, &fetch, &sink, &gate).await;
                    debug!(
                        task = %task,
                        ok = r.ok,
                        empty = r.empty,
                        failed = r.failed,
                        dropped = r.dropped,
                        "poll cycle complete"
                    );
                }
            }
        });

        info!(task, entities = entities.len(), ?interval, "polling started");
        let handle = TaskHandle {
            gate,
            join,
            entities,
            interval,
        };
        let previous = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.to_string(), handle);
        if let Some(old) = previous {
            old.cancel();
        }
    }

    /// Cancel the timer; in-flight results are discarded. Once this returns the task's sink
    /// is not running and will not run again. Returns whether it was running.
    pub fn stop(&self, task: &str) -> bool {
        let handle = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task);
        match handle {
            Some(h) => {
                h.cancel();
                info!(task, "polling stopped");
                true
            }
            None => false,
        }
    }

    pub fn restart(
        &self,
        task: &str,
        entities: Vec<EntityId>,
        interval: Duration,
        fetch: FetchFn,
        sink: SinkFn,
    ) {
        self.stop(task);
        self.start(task, entities, interval, fetch, sink);
    }

    pub fn is_running(&self, task: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(task)
    }

    /// Entities and interval a running task is bound to.
    pub fn binding(&self, task: &str) -> Option<(Vec<EntityId>, Duration)> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task)
            .map(|h| (h.entities.clone(), h.interval))
    }

    pub fn stop_all(&self) {
        let drained: Vec<TaskHandle> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, h)| h)
            .collect();
        for h in drained {
            h.cancel();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}
