//! What the rendering layer talks to: selection changes start and stop polling tasks,
//! reads return normalized samples, windowed series, chart domains and rankings.
//!
//! Each polling task writes to its own store, so one series never has two writers.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::info;

use crate::aggregate::{normalize, Aggregator};
use crate::config::PollIntervals;
use crate::domain::domain;
use crate::history::HistoryStore;
use crate::install::{default_final_roles, InstallStatus, InstallTracker};
use crate::ranking::{top_n, RankedProcess};
use crate::scheduler::{fetch_fn, sink_fn, FetchFn, FetchOutcome, Scheduler, SinkFn};
use crate::source::{MetricSource, RoleSource};
use crate::types::{Axis, EntityId, Metric, Sample};
use crate::window::{filter, RankWindow, TimeWindow, Windowed};

pub mod tasks {
    pub const FLEET: &str = "fleet";
    pub const LIVE: &str = "live";
    pub const CHART: &str = "chart";
    pub const PROCESSES: &str = "processes";
    pub const CONTAINERS: &str = "containers";
}

/// How far back the chart task looks when it has nothing yet.
const CHART_BACKFILL_HOURS: i64 = 24;

/// Reachability of an entity as seen by the latest fetch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EntityStatus {
    /// No fetch has settled yet.
    #[default]
    Pending,
    /// Reachable, but nothing has been collected for it.
    NoData,
    Live { last_ok: DateTime<Utc> },
    /// Last fetch failed; previously collected data is kept.
    Unreachable { error: String, since: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Channel {
    Fleet,
    Live,
    Chart,
    Containers,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerOverview {
    pub server: EntityId,
    pub latest: Option<Sample>,
    /// As seen by the fleet summary task alone.
    pub status: EntityStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetOverview {
    pub servers: Vec<ServerOverview>,
    /// Means over servers that are reachable and have a sample.
    pub avg_cpu: Option<f64>,
    pub avg_mem: Option<f64>,
    pub avg_disk: Option<f64>,
}

struct Inner {
    source: Arc<dyn MetricSource>,
    fleet: Aggregator,
    live: Aggregator,
    chart: Aggregator,
    containers: Aggregator,
    process_records: RwLock<HashMap<EntityId, Vec<Sample>>>,
    /// Per polling task, so one task's failure does not mask another's success.
    status: RwLock<HashMap<(Channel, EntityId), EntityStatus>>,
    selected: RwLock<Option<String>>,
    rank_windows: RwLock<(RankWindow, RankWindow)>,
}

impl Inner {
    fn agg(&self, ch: Channel) -> &Aggregator {
        match ch {
            Channel::Fleet => &self.fleet,
            Channel::Live => &self.live,
            Channel::Chart => &self.chart,
            Channel::Containers => &self.containers,
        }
    }

    fn set_status(&self, ch: Channel, entity: &EntityId, st: EntityStatus) {
        self.status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((ch, entity.clone()), st);
    }

    fn channel_status(&self, ch: Channel, entity: &EntityId) -> EntityStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(ch, entity.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Status of the most specific task tracking `entity`: the live panel while a server
    /// is selected, then the fleet summary, then the chart.
    fn status(&self, entity: &EntityId) -> EntityStatus {
        let order: &[Channel] = match entity {
            EntityId::Container { .. } => &[Channel::Containers],
            _ => &[Channel::Live, Channel::Fleet, Channel::Chart],
        };
        let map = self.status.read().unwrap_or_else(PoisonError::into_inner);
        order
            .iter()
            .find_map(|ch| map.get(&(*ch, entity.clone())))
            .cloned()
            .unwrap_or_default()
    }

    /// Drop the series and status `ch` holds for `entity`.
    fn forget(&self, ch: Channel, entity: &EntityId) {
        self.agg(ch).store().clear(entity);
        self.status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(ch, entity.clone()));
    }

    /// Drop everything `ch` holds except for `keep`. Status is pruned too, including
    /// entities that never produced a sample.
    fn retain(&self, ch: Channel, keep: &[EntityId]) {
        let store = self.agg(ch).store();
        for id in store.entities() {
            if !keep.contains(&id) {
                store.clear(&id);
            }
        }
        self.status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(c, id), _| *c != ch || keep.contains(id));
    }

    fn apply(&self, ch: Channel, entity: &EntityId, outcome: FetchOutcome) {
        let now = Utc::now();
        match outcome {
            FetchOutcome::Samples(rows) => {
                self.agg(ch).ingest(entity, &rows, now);
                self.set_status(ch, entity, EntityStatus::Live { last_ok: now });
            }
            FetchOutcome::Empty => {
                // Incremental fetches come back empty once caught up
                let st = if self.agg(ch).store().len(entity) > 0 {
                    EntityStatus::Live { last_ok: now }
                } else {
                    EntityStatus::NoData
                };
                self.set_status(ch, entity, st);
            }
            FetchOutcome::Failed(e) => {
                let since = match self.channel_status(ch, entity) {
                    EntityStatus::Unreachable { since, .. } => since,
                    _ => now,
                };
                self.set_status(
                    ch,
                    entity,
                    EntityStatus::Unreachable {
                        error: e.to_string(),
                        since,
                    },
                );
            }
        }
    }

    fn rank_span(&self) -> ChronoDuration {
        let (cpu, ram) = *self
            .rank_windows
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        cpu.duration().max(ram.duration())
    }

    fn selected(&self) -> Option<String> {
        self.selected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct Dashboard {
    inner: Arc<Inner>,
    scheduler: Scheduler,
    intervals: PollIntervals,
    roles: Arc<dyn RoleSource>,
    final_roles: Vec<String>,
    installs: Mutex<HashMap<String, Arc<InstallTracker>>>,
}

impl Dashboard {
    pub fn new(
        source: Arc<dyn MetricSource>,
        roles: Arc<dyn RoleSource>,
        intervals: PollIntervals,
    ) -> Self {
        let store = || Aggregator::new(Arc::new(HistoryStore::new()));
        Self {
            inner: Arc::new(Inner {
                source,
                fleet: store(),
                live: store(),
                chart: store(),
                containers: store(),
                process_records: RwLock::new(HashMap::new()),
                status: RwLock::new(HashMap::new()),
                selected: RwLock::new(None),
                rank_windows: RwLock::new((RankWindow::Min1, RankWindow::Min1)),
            }),
            scheduler: Scheduler::new(),
            intervals,
            roles,
            final_roles: default_final_roles(),
            installs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_final_roles(mut self, roles: Vec<String>) -> Self {
        self.final_roles = roles;
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn latest_fetch(&self) -> FetchFn {
        let src = self.inner.source.clone();
        fetch_fn(move |entity| {
            let src = src.clone();
            async move { src.fetch_samples(&entity, None).await }
        })
    }

    fn chart_fetch(&self) -> FetchFn {
        let inner = self.inner.clone();
        fetch_fn(move |entity| {
            let inner = inner.clone();
            async move {
                let since = inner
                    .chart
                    .store()
                    .newest_timestamp(&entity)
                    .unwrap_or_else(|| Utc::now() - ChronoDuration::hours(CHART_BACKFILL_HOURS));
                inner.source.fetch_samples(&entity, Some(since)).await
            }
        })
    }

    fn process_fetch(&self) -> FetchFn {
        let inner = self.inner.clone();
        fetch_fn(move |entity| {
            let inner = inner.clone();
            async move {
                let since = Utc::now() - inner.rank_span();
                inner.source.fetch_samples(&entity, Some(since)).await
            }
        })
    }

    fn ingest_sink(&self, ch: Channel) -> SinkFn {
        let inner = self.inner.clone();
        sink_fn(move |entity: &EntityId, outcome: FetchOutcome| {
            inner.apply(ch, entity, outcome)
        })
    }

    fn process_sink(&self) -> SinkFn {
        let inner = self.inner.clone();
        sink_fn(move |entity: &EntityId, outcome: FetchOutcome| {
            let now = Utc::now();
            let records: Vec<Sample> = match outcome {
                FetchOutcome::Samples(rows) => rows.iter().map(|r| normalize(r, now)).collect(),
                FetchOutcome::Empty => Vec::new(),
                // keep the last ranking input on failure
                FetchOutcome::Failed(_) => return,
            };
            inner
                .process_records
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(entity.clone(), records);
        })
    }

    // ---------- Selection ----------

    /// Poll the fleet summary for exactly these servers.
    pub fn watch_fleet<S: AsRef<str>>(&self, addresses: &[S]) {
        let ids: Vec<EntityId> = addresses
            .iter()
            .map(|a| EntityId::server(a.as_ref()))
            .collect();
        self.scheduler.restart(
            tasks::FLEET,
            ids.clone(),
            self.intervals.fleet(),
            self.latest_fetch(),
            self.ingest_sink(Channel::Fleet),
        );
        self.inner.retain(Channel::Fleet, &ids);
    }

    pub fn unwatch_fleet(&self) {
        self.scheduler.stop(tasks::FLEET);
        self.inner.retain(Channel::Fleet, &[]);
    }

    /// Make `address` the inspected server: live panel, history chart and process rankings
    /// follow it. Series of a previously selected server are dropped.
    pub fn select_server(&self, address: &str) {
        let previous = self
            .inner
            .selected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(address.to_string());
        info!(%address, "server selected");
        let id = vec![EntityId::server(address)];
        self.scheduler.restart(
            tasks::LIVE,
            id.clone(),
            self.intervals.live(),
            self.latest_fetch(),
            self.ingest_sink(Channel::Live),
        );
        self.scheduler.restart(
            tasks::CHART,
            id.clone(),
            self.intervals.chart(),
            self.chart_fetch(),
            self.ingest_sink(Channel::Chart),
        );
        self.scheduler.restart(
            tasks::PROCESSES,
            id,
            self.intervals.processes(),
            self.process_fetch(),
            self.process_sink(),
        );
        // restart closed the old tasks, so nothing refills these
        if let Some(prev) = previous.filter(|p| p != address) {
            self.forget_selected(&prev);
        }
    }

    pub fn deselect(&self) {
        for t in [tasks::LIVE, tasks::CHART, tasks::PROCESSES] {
            self.scheduler.stop(t);
        }
        let previous = self
            .inner
            .selected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(prev) = previous {
            self.forget_selected(&prev);
        }
    }

    fn forget_selected(&self, address: &str) {
        let id = EntityId::server(address);
        self.inner.forget(Channel::Live, &id);
        self.inner.forget(Channel::Chart, &id);
        self.inner
            .process_records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn selected(&self) -> Option<String> {
        self.inner.selected()
    }

    /// Poll the container table of one server.
    pub fn watch_containers<S: AsRef<str>>(&self, address: &str, containers: &[S]) {
        let ids: Vec<EntityId> = containers
            .iter()
            .map(|c| EntityId::container(address, c.as_ref()))
            .collect();
        self.scheduler.restart(
            tasks::CONTAINERS,
            ids.clone(),
            self.intervals.containers(),
            self.latest_fetch(),
            self.ingest_sink(Channel::Containers),
        );
        self.inner.retain(Channel::Containers, &ids);
    }

    pub fn unwatch_containers(&self) {
        self.scheduler.stop(tasks::CONTAINERS);
        self.inner.retain(Channel::Containers, &[]);
    }

    /// Windows the CPU and RAM rankings average over. Refetches right away.
    pub fn set_rank_windows(&self, cpu: RankWindow, ram: RankWindow) {
        *self
            .inner
            .rank_windows
            .write()
            .unwrap_or_else(PoisonError::into_inner) = (cpu, ram);
        if let Some(addr) = self.inner.selected() {
            self.scheduler.restart(
                tasks::PROCESSES,
                vec![EntityId::server(addr)],
                self.intervals.processes(),
                self.process_fetch(),
                self.process_sink(),
            );
        }
    }

    pub fn rank_windows(&self) -> (RankWindow, RankWindow) {
        *self
            .inner
            .rank_windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// One fetch for the selected server outside the timer. Merged by timestamp, so it
    /// composes with timer cycles. Dropped if the selection changed meanwhile.
    pub async fn refresh_live(&self) -> Option<EntityStatus> {
        let address = self.inner.selected()?;
        let id = EntityId::server(&address);
        let result = self.inner.source.fetch_samples(&id, None).await;
        if self.inner.selected().as_deref() != Some(address.as_str()) {
            return None;
        }
        let outcome = match result {
            Ok(rows) if rows.is_empty() => FetchOutcome::Empty,
            Ok(rows) => FetchOutcome::Samples(rows),
            Err(e) => FetchOutcome::Failed(e),
        };
        self.inner.apply(Channel::Live, &id, outcome);
        Some(self.inner.channel_status(Channel::Live, &id))
    }

    // ---------- Reads ----------

    /// Most recent normalized sample: the live panel for the selected server, otherwise
    /// the fleet summary.
    pub fn live_sample(&self, entity: &EntityId) -> Option<Sample> {
        match entity {
            EntityId::Container { .. } => self.inner.containers.store().latest(entity),
            _ => self
                .inner
                .live
                .store()
                .latest(entity)
                .or_else(|| self.inner.fleet.store().latest(entity)),
        }
    }

    /// Live-panel history of an entity since it was selected.
    pub fn live_series(&self, entity: &EntityId) -> Vec<Sample> {
        self.inner.live.store().all(entity)
    }

    pub fn series(&self, entity: &EntityId, window: TimeWindow) -> Windowed {
        self.series_at(entity, window, Utc::now())
    }

    pub fn series_at(&self, entity: &EntityId, window: TimeWindow, now: DateTime<Utc>) -> Windowed {
        let all = match entity {
            EntityId::Container { .. } => self.inner.containers.store().all(entity),
            _ => self.inner.chart.store().all(entity),
        };
        filter(&all, window, now)
    }

    pub fn domain(values: &[f64]) -> (f64, f64) {
        domain(values)
    }

    /// Chart range for one axis of a windowed series.
    pub fn series_domain(&self, entity: &EntityId, window: TimeWindow, axis: Axis) -> (f64, f64) {
        let values: Vec<f64> = self
            .series(entity, window)
            .samples
            .iter()
            .map(|s| s.percent(axis))
            .collect();
        domain(&values)
    }

    pub fn top_processes(
        &self,
        entity: &EntityId,
        metric: Metric,
        window: RankWindow,
        n: usize,
    ) -> Vec<RankedProcess> {
        self.top_processes_at(entity, metric, window, n, Utc::now())
    }

    pub fn top_processes_at(
        &self,
        entity: &EntityId,
        metric: Metric,
        window: RankWindow,
        n: usize,
        now: DateTime<Utc>,
    ) -> Vec<RankedProcess> {
        let cutoff = now - window.duration();
        let records = self
            .inner
            .process_records
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(all) = records.get(entity) else {
            return Vec::new();
        };
        let in_window: Vec<Sample> = all
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect();
        top_n(&in_window, metric, n)
    }

    /// Live-panel status while `entity` is selected, otherwise the fleet or container
    /// task's view. `Pending` for entities no task tracks.
    pub fn status(&self, entity: &EntityId) -> EntityStatus {
        self.inner.status(entity)
    }

    pub fn fleet_overview(&self) -> FleetOverview {
        let ids = self
            .scheduler
            .binding(tasks::FLEET)
            .map(|(ids, _)| ids)
            .unwrap_or_default();
        let servers: Vec<ServerOverview> = ids
            .into_iter()
            .map(|server| ServerOverview {
                latest: self.inner.fleet.store().latest(&server),
                status: self.inner.channel_status(Channel::Fleet, &server),
                server,
            })
            .collect();
        let usable: Vec<&Sample> = servers
            .iter()
            .filter(|s| !matches!(s.status, EntityStatus::Unreachable { .. }))
            .filter_map(|s| s.latest.as_ref())
            .collect();
        let mean = |axis: Axis| {
            (!usable.is_empty())
                .then(|| usable.iter().map(|s| s.percent(axis)).sum::<f64>() / usable.len() as f64)
        };
        FleetOverview {
            avg_cpu: mean(Axis::Cpu),
            avg_mem: mean(Axis::Memory),
            avg_disk: mean(Axis::Disk),
            servers,
        }
    }

    // ---------- Installation ----------

    /// Start (or restart) tracking agent installation on `address`.
    pub fn start_install(&self, address: &str) -> watch::Receiver<InstallStatus> {
        let tracker = Arc::new(InstallTracker::new(
            address,
            self.roles.clone(),
            self.intervals.install(),
            self.final_roles.clone(),
        ));
        let rx = tracker.subscribe();
        tracker.start();
        let old = self
            .installs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string(), tracker);
        if let Some(old) = old {
            old.stop();
        }
        rx
    }

    pub fn install_state(&self, address: &str) -> Option<InstallStatus> {
        self.installs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .map(|t| t.status())
    }

    pub fn retry_install(&self, address: &str) -> bool {
        let tracker = self
            .installs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned();
        tracker.is_some_and(|t| t.retry())
    }

    pub fn shutdown(&self) {
        self.scheduler.stop_all();
        for (_, t) in self
            .installs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            t.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::types::{RawProcess, RawProcesses, RawSample};
    use futures::future::BoxFuture;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    /// Latest-row fetches return an increasing cpu value per entity; windowed fetches
    /// return `windowed` rows. Entities in `failing_after` fail from that call on.
    #[derive(Default)]
    struct FakeGateway {
        calls: Mutex<HashMap<EntityId, usize>>,
        cpu_steps: Vec<f64>,
        failing_after: HashMap<EntityId, usize>,
        windowed: Vec<RawSample>,
        windowed_calls: AtomicUsize,
    }

    fn base() -> DateTime<Utc> {
        crate::testutil::base()
    }

    impl MetricSource for FakeGateway {
        fn fetch_samples<'a>(
            &'a self,
            entity: &'a EntityId,
            since: Option<DateTime<Utc>>,
        ) -> BoxFuture<'a, Result<Vec<RawSample>, SourceError>> {
            Box::pin(async move {
                if since.is_some() {
                    self.windowed_calls.fetch_add(1, Ordering::SeqCst);
                    return Ok(self.windowed.clone());
                }
                let n = {
                    let mut calls = self.calls.lock().unwrap();
                    let c = calls.entry(entity.clone()).or_insert(0);
                    *c += 1;
                    *c
                };
                if self.failing_after.get(entity).is_some_and(|k| n >= *k) {
                    return Err(SourceError::Remote("unreachable".into()));
                }
                let cpu = self
                    .cpu_steps
                    .get(n - 1)
                    .copied()
                    .unwrap_or(n as f64);
                Ok(vec![RawSample {
                    cpu_usada: Some(cpu),
                    created_at: Some(base() + ChronoDuration::seconds(3 * n as i64)),
                    ..Default::default()
                }])
            })
        }
    }

    struct NoRoles;

    impl RoleSource for NoRoles {
        fn begin_install<'a>(&'a self, _: &'a str) -> BoxFuture<'a, Result<(), SourceError>> {
            Box::pin(async { Err(SourceError::Closed) })
        }
        fn fetch_role<'a>(
            &'a self,
            _: &'a str,
        ) -> BoxFuture<'a, Result<Option<String>, SourceError>> {
            Box::pin(async { Ok(None) })
        }
    }

    fn dashboard(gw: FakeGateway) -> Dashboard {
        Dashboard::new(Arc::new(gw), Arc::new(NoRoles), PollIntervals::default())
    }

    #[tokio::test(start_paused = true)]
    async fn two_live_cycles_leave_two_samples() {
        let dash = dashboard(FakeGateway {
            cpu_steps: vec![40.0, 60.0],
            ..Default::default()
        });
        let a = EntityId::server("10.0.0.1");
        dash.select_server("10.0.0.1");
        sleep(Duration::from_millis(4_000)).await;

        let series = dash.live_series(&a);
        assert_eq!(series.len(), 2);
        assert!(series[0].timestamp < series[1].timestamp);
        assert_eq!(series[0].cpu_percent, 40.0);
        assert_eq!(dash.live_sample(&a).unwrap().cpu_percent, 60.0);
        assert!(matches!(dash.status(&a), EntityStatus::Live { .. }));
        dash.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn failing_server_keeps_its_series() {
        let b = EntityId::server("b");
        let dash = dashboard(FakeGateway {
            failing_after: HashMap::from([(b.clone(), 2)]),
            ..Default::default()
        });
        dash.watch_fleet(&["a", "b", "c"]);
        sleep(Duration::from_secs(15)).await;

        let fleet = dash.inner.fleet.store();
        assert_eq!(fleet.len(&EntityId::server("a")), 2);
        assert_eq!(fleet.len(&EntityId::server("c")), 2);
        assert_eq!(fleet.len(&b), 1);
        assert_eq!(dash.live_sample(&b).unwrap().cpu_percent, 1.0);
        assert!(matches!(
            dash.status(&b),
            EntityStatus::Unreachable { ref error, .. } if error.contains("unreachable")
        ));

        let overview = dash.fleet_overview();
        assert_eq!(overview.servers.len(), 3);
        assert_eq!(overview.avg_cpu, Some(2.0));
        dash.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_window_is_no_data_not_failure() {
        let dash = dashboard(FakeGateway::default());
        let a = EntityId::server("a");
        dash.select_server("a");
        sleep(Duration::from_millis(100)).await;
        let w = dash.series(&a, TimeWindow::H1);
        assert!(w.samples.is_empty());
        assert_eq!(w.coverage, crate::window::Coverage::NoData);
        assert!(dash.top_processes(&a, Metric::CpuPercent, RankWindow::Min1, 3).is_empty());
        dash.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn switching_servers_drops_previous_series() {
        let dash = dashboard(FakeGateway::default());
        let a = EntityId::server("a");
        dash.select_server("a");
        sleep(Duration::from_millis(100)).await;
        assert_eq!(dash.live_series(&a).len(), 1);

        dash.select_server("b");
        sleep(Duration::from_millis(100)).await;
        assert!(dash.live_series(&a).is_empty());
        assert_eq!(dash.live_series(&EntityId::server("b")).len(), 1);
        let (ids, _) = dash.scheduler().binding(tasks::LIVE).unwrap();
        assert_eq!(ids, vec![EntityId::server("b")]);

        dash.deselect();
        assert!(dash.selected().is_none());
        assert!(!dash.scheduler().is_running(tasks::CHART));
        assert!(dash.live_series(&EntityId::server("b")).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rankings_follow_their_own_windows() {
        let now = Utc::now();
        let snap = |age_s: i64, pid: f64, cpu: f64, ram: f64| RawSample {
            processes: Some(RawProcesses {
                by_cpu: vec![RawProcess {
                    pid: Some(pid),
                    command: Some(format!("p{pid}")),
                    cpu_percent: Some(cpu),
                    ram_percent: Some(ram),
                    ..Default::default()
                }],
            }),
            created_at: Some(now - ChronoDuration::seconds(age_s)),
            ..Default::default()
        };
        let dash = dashboard(FakeGateway {
            // pid 1 was busy 5 minutes ago, pid 2 is busy now
            windowed: vec![snap(300, 1.0, 90.0, 10.0), snap(10, 2.0, 20.0, 50.0)],
            ..Default::default()
        });
        let a = EntityId::server("a");
        dash.select_server("a");
        dash.set_rank_windows(RankWindow::Min1, RankWindow::Min10);
        sleep(Duration::from_millis(100)).await;

        let (cpu_w, ram_w) = dash.rank_windows();
        let cpu = dash.top_processes_at(&a, Metric::CpuPercent, cpu_w, 3, now);
        assert_eq!(cpu.iter().map(|p| p.pid).collect::<Vec<_>>(), vec![2]);
        let ram = dash.top_processes_at(&a, Metric::RamPercent, ram_w, 3, now);
        assert_eq!(ram.iter().map(|p| p.pid).collect::<Vec<_>>(), vec![2, 1]);
        let cpu10 = dash.top_processes_at(&a, Metric::CpuPercent, RankWindow::Min10, 3, now);
        assert_eq!(cpu10[0].pid, 1);
        dash.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn manual_refresh_merges_by_timestamp() {
        let dash = dashboard(FakeGateway::default());
        let a = EntityId::server("a");
        assert!(dash.refresh_live().await.is_none());
        dash.select_server("a");
        sleep(Duration::from_millis(100)).await;
        let st = dash.refresh_live().await;
        assert!(matches!(st, Some(EntityStatus::Live { .. })));
        let ts: HashSet<_> = dash.live_series(&a).iter().map(|s| s.timestamp).collect();
        assert_eq!(ts.len(), dash.live_series(&a).len());
        assert_eq!(ts.len(), 2);
        dash.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn unwatching_prunes_status() {
        let ids: Vec<String> = (0..100).map(|i| format!("c{i}")).collect();
        let dash = dashboard(FakeGateway {
            failing_after: ids
                .iter()
                .map(|c| (EntityId::container("h", c.as_str()), 1))
                .collect(),
            ..Default::default()
        });
        let c0 = EntityId::container("h", "c0");
        dash.watch_containers("h", &ids);
        sleep(Duration::from_millis(100)).await;
        assert!(matches!(dash.status(&c0), EntityStatus::Unreachable { .. }));

        dash.watch_containers("h", &ids[..10]);
        assert_eq!(dash.inner.status.read().unwrap().len(), 10);
        assert_eq!(
            dash.status(&EntityId::container("h", "c50")),
            EntityStatus::Pending
        );

        dash.unwatch_containers();
        assert!(dash.inner.status.read().unwrap().is_empty());
        assert_eq!(dash.status(&c0), EntityStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn rewatched_server_starts_pending() {
        let a = EntityId::server("a");
        let dash = dashboard(FakeGateway {
            failing_after: HashMap::from([(a.clone(), 1)]),
            ..Default::default()
        });
        dash.watch_fleet(&["a"]);
        sleep(Duration::from_millis(100)).await;
        assert!(matches!(dash.status(&a), EntityStatus::Unreachable { .. }));
        dash.unwatch_fleet();
        dash.watch_fleet(&["a"]);
        assert_eq!(dash.fleet_overview().servers[0].status, EntityStatus::Pending);
        dash.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn live_failure_does_not_drop_server_from_fleet() {
        let dash = dashboard(FakeGateway::default());
        let a = EntityId::server("a");
        dash.watch_fleet(&["a"]);
        dash.select_server("a");
        sleep(Duration::from_millis(100)).await;
        dash.inner
            .apply(Channel::Live, &a, FetchOutcome::Failed(SourceError::Closed));

        assert!(matches!(dash.status(&a), EntityStatus::Unreachable { .. }));
        let overview = dash.fleet_overview();
        assert!(matches!(overview.servers[0].status, EntityStatus::Live { .. }));
        assert!(overview.avg_cpu.is_some());

        dash.deselect();
        assert!(matches!(dash.status(&a), EntityStatus::Live { .. }));
        dash.shutdown();
    }

    #[tokio::test]
    async fn install_connection_error_is_reported() {
        let dash = dashboard(FakeGateway::default());
        let mut rx = dash.start_install("10.0.0.9");
        while !rx.borrow_and_update().state.is_terminal() {
            rx.changed().await.unwrap();
        }
        let st = dash.install_state("10.0.0.9").unwrap();
        assert!(matches!(st.state, crate::install::InstallState::Error(_)));
        assert!(dash.install_state("10.0.0.10").is_none());
        assert!(!dash.retry_install("10.0.0.10"));
        dash.shutdown();
    }
}
