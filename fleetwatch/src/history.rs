//! Per-entity ordered history of samples, partitioned by entity so concurrent writers for
//! different entities never contend on the same series.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::types::{EntityId, Sample};

pub const DEFAULT_SERIES_CAP: usize = 20_000;

pub fn push_capped<T>(dq: &mut VecDeque<T>, v: T, cap: usize) {
    if dq.len() == cap {
        dq.pop_front();
    }
    dq.push_back(v);
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Samples for one entity, ascending by timestamp, at most one per timestamp.
#[derive(Debug, Clone)]
pub struct Series {
    samples: VecDeque<Sample>,
    cap: usize,
}

impl Series {
    pub fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// Insert in timestamp order; a sample with an existing timestamp replaces the old one.
    pub fn append(&mut self, sample: Sample) {
        // Common case: strictly newer than everything held
        if self
            .samples
            .back()
            .is_none_or(|last| last.timestamp < sample.timestamp)
        {
            push_capped(&mut self.samples, sample, self.cap);
            return;
        }
        match self
            .samples
            .binary_search_by(|s| s.timestamp.cmp(&sample.timestamp))
        {
            Ok(i) => self.samples[i] = sample,
            Err(i) => {
                self.samples.insert(i, sample);
                if self.samples.len() > self.cap {
                    self.samples.pop_front();
                }
            }
        }
    }

    /// Contiguous suffix with `timestamp >= since`.
    pub fn range(&self, since: DateTime<Utc>) -> Vec<Sample> {
        let start = self.samples.partition_point(|s| s.timestamp < since);
        self.samples.range(start..).cloned().collect()
    }

    pub fn to_vec(&self) -> Vec<Sample> {
        self.samples.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Shared store of series keyed by entity. The outer lock is only held to find or create
/// a partition; each series has its own lock.
#[derive(Debug)]
pub struct HistoryStore {
    series: RwLock<HashMap<EntityId, Arc<Mutex<Series>>>>,
    cap: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SERIES_CAP)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            cap,
        }
    }

    fn partition(&self, entity: &EntityId) -> Option<Arc<Mutex<Series>>> {
        self.series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
            .cloned()
    }

    fn partition_or_create(&self, entity: &EntityId) -> Arc<Mutex<Series>> {
        if let Some(p) = self.partition(entity) {
            return p;
        }
        let mut map = self.series.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(entity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Series::new(self.cap))))
            .clone()
    }

    pub fn append(&self, entity: &EntityId, sample: Sample) {
        let part = self.partition_or_create(entity);
        lock(&part).append(sample);
    }

    pub fn range(&self, entity: &EntityId, since: DateTime<Utc>) -> Vec<Sample> {
        self.partition(entity)
            .map(|p| lock(&p).range(since))
            .unwrap_or_default()
    }

    pub fn all(&self, entity: &EntityId) -> Vec<Sample> {
        self.partition(entity)
            .map(|p| lock(&p).to_vec())
            .unwrap_or_default()
    }

    pub fn latest(&self, entity: &EntityId) -> Option<Sample> {
        self.partition(entity)
            .and_then(|p| lock(&p).latest().cloned())
    }

    pub fn newest_timestamp(&self, entity: &EntityId) -> Option<DateTime<Utc>> {
        self.partition(entity)
            .and_then(|p| lock(&p).latest().map(|s| s.timestamp))
    }

    pub fn len(&self, entity: &EntityId) -> usize {
        self.partition(entity).map(|p| lock(&p).len()).unwrap_or(0)
    }

    pub fn clear(&self, entity: &EntityId) {
        self.series
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(entity);
    }

    pub fn entities(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
