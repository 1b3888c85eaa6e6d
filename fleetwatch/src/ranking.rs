//! Top-N process ranking over a window of point-in-time snapshots.

use serde::Serialize;
use std::collections::HashMap;

use crate::types::{Metric, Sample};
use crate::util::truncate_middle;

pub const DEFAULT_TOP_N: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedProcess {
    pub pid: u32,
    pub command: String,
    /// User seen on the most recent occurrence.
    pub user: String,
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub rss_kb: u64,
    /// Snapshots the process appeared in.
    pub occurrences: usize,
}

impl RankedProcess {
    pub fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::CpuPercent => self.cpu_percent,
            Metric::RamPercent => self.ram_percent,
        }
    }

    pub fn display_command(&self, max: usize) -> String {
        truncate_middle(&self.command, max)
    }
}

#[derive(Default)]
struct Acc {
    user: String,
    cpu: f64,
    ram: f64,
    rss: f64,
    n: usize,
}

/// Group processes by `(pid, command)` across `records`, average their percentages and
/// return the `n` highest by `metric`. Equal values order by pid, then command.
pub fn top_n(records: &[Sample], metric: Metric, n: usize) -> Vec<RankedProcess> {
    let mut ordered: Vec<&Sample> = records.iter().collect();
    ordered.sort_by_key(|s| s.timestamp);

    let mut index: HashMap<(u32, &str), usize> = HashMap::new();
    let mut groups: Vec<((u32, &str), Acc)> = Vec::new();
    for p in ordered.iter().flat_map(|s| s.processes.iter()) {
        let key = (p.pid, p.command.as_str());
        let i = *index.entry(key).or_insert_with(|| {
            groups.push((key, Acc::default()));
            groups.len() - 1
        });
        let acc = &mut groups[i].1;
        acc.user.clone_from(&p.user);
        acc.cpu += p.cpu_percent;
        acc.ram += p.ram_percent;
        acc.rss += p.rss_kb as f64;
        acc.n += 1;
    }

    let mut ranked: Vec<RankedProcess> = groups
        .into_iter()
        .map(|((pid, command), acc)| {
            let k = acc.n as f64;
            RankedProcess {
                pid,
                command: command.to_string(),
                user: acc.user,
                cpu_percent: acc.cpu / k,
                ram_percent: acc.ram / k,
                rss_kb: (acc.rss / k).round() as u64,
                occurrences: acc.n,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.value(metric)
            .total_cmp(&a.value(metric))
            .then_with(|| a.pid.cmp(&b.pid))
            .then_with(|| a.command.cmp(&b.command))
    });
    ranked.truncate(n);
    ranked
}
