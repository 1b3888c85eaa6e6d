//! Turns raw gateway rows into normalized samples and merges them into a history store.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

use crate::history::HistoryStore;
use crate::types::{EntityId, ProcessSample, RawProcess, RawSample, Sample};

/// Percentage of `used` over `total`.
///
/// When `total` is not positive the source is assumed to already report a percentage in
/// `used`. A missing `used` is recovered from `total - free` when both are present.
/// The same rule applies to every axis; the result is clamped to `0..=100`.
pub fn percent_of(total: Option<f64>, used: Option<f64>, free: Option<f64>) -> f64 {
    let total = total.unwrap_or(0.0);
    let used = match (used, free) {
        (Some(u), _) => u,
        (None, Some(f)) if total > 0.0 => total - f,
        _ => 0.0,
    };
    let pct = if total > 0.0 {
        used / total * 100.0
    } else {
        used
    };
    if pct.is_finite() {
        pct.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn normalize_process(p: &RawProcess) -> ProcessSample {
    ProcessSample {
        pid: p.pid.map(|v| v.max(0.0) as u32).unwrap_or(0),
        user: p.user.clone().unwrap_or_default(),
        command: p.command.clone().unwrap_or_default(),
        cpu_percent: p.cpu_percent.unwrap_or(0.0),
        ram_percent: p.ram_percent.unwrap_or(0.0),
        rss_kb: p.rss_kb.map(|v| v.max(0.0) as u64).unwrap_or(0),
    }
}

/// Normalize one raw row. `observed_at` stands in for a missing `created_at`.
pub fn normalize(raw: &RawSample, observed_at: DateTime<Utc>) -> Sample {
    let v = |x: Option<f64>| x.unwrap_or(0.0);
    let processes = raw
        .processes
        .as_ref()
        .map(|p| p.by_cpu.iter().map(normalize_process).collect())
        .unwrap_or_default();

    Sample {
        timestamp: raw.created_at.unwrap_or(observed_at),
        cpu_total: v(raw.cpu_total),
        cpu_used: v(raw.cpu_usada),
        cpu_free: v(raw.cpu_livre),
        mem_total_kb: v(raw.mem_total),
        mem_used_kb: v(raw.mem_usada),
        mem_free_kb: v(raw.mem_livre),
        disk_total_kb: v(raw.disco_total),
        disk_used_kb: v(raw.disco_usado),
        disk_free_kb: v(raw.disco_livre),
        cpu_percent: percent_of(raw.cpu_total, raw.cpu_usada, raw.cpu_livre),
        mem_percent: percent_of(raw.mem_total, raw.mem_usada, raw.mem_livre),
        disk_percent: percent_of(raw.disco_total, raw.disco_usado, raw.disco_livre),
        processes,
    }
}

/// Normalizes fetch results and appends them to one store. The only state it touches is
/// the series of the entity being ingested.
#[derive(Clone)]
pub struct Aggregator {
    store: Arc<HistoryStore>,
}

impl Aggregator {
    pub fn new(store: Arc<HistoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<HistoryStore> {
        &self.store
    }

    /// Returns how many samples were merged. Rows without `created_at` all land on
    /// `observed_at`, so only the last of them is kept.
    pub fn ingest(
        &self,
        entity: &EntityId,
        rows: &[RawSample],
        observed_at: DateTime<Utc>,
    ) -> usize {
        let untimed = rows.iter().filter(|r| r.created_at.is_none()).count();
        if untimed > 1 {
            warn!(%entity, rows = untimed, "rows without created_at, keeping the last one");
        }
        let mut skip = untimed.saturating_sub(1);
        let mut merged = 0;
        for raw in rows {
            if raw.created_at.is_none() && skip > 0 {
                skip -= 1;
                continue;
            }
            self.store.append(entity, normalize(raw, observed_at));
            merged += 1;
        }
        merged
    }
}
