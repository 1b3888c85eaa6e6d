//! Relative time windows for charts and rankings, and the filter that applies them.

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::str::FromStr;

use crate::types::Sample;
use crate::util::compact_duration;

/// Chart window selectable in the server panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TimeWindow {
    #[default]
    Min30,
    H1,
    H3,
    H6,
    H12,
    H24,
}

impl TimeWindow {
    pub const ALL: [TimeWindow; 6] = [
        TimeWindow::Min30,
        TimeWindow::H1,
        TimeWindow::H3,
        TimeWindow::H6,
        TimeWindow::H12,
        TimeWindow::H24,
    ];

    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Min30 => Duration::minutes(30),
            TimeWindow::H1 => Duration::hours(1),
            TimeWindow::H3 => Duration::hours(3),
            TimeWindow::H6 => Duration::hours(6),
            TimeWindow::H12 => Duration::hours(12),
            TimeWindow::H24 => Duration::hours(24),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TimeWindow::Min30 => "30min",
            TimeWindow::H1 => "1h",
            TimeWindow::H3 => "3h",
            TimeWindow::H6 => "6h",
            TimeWindow::H12 => "12h",
            TimeWindow::H24 => "24h",
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TimeWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimeWindow::ALL
            .into_iter()
            .find(|w| w.label() == s.trim())
            .ok_or_else(|| format!("unknown window '{s}' (expected 30min, 1h, 3h, 6h, 12h or 24h)"))
    }
}

/// Window over which process rankings are averaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RankWindow {
    #[default]
    Min1,
    Min10,
    Min30,
}

impl RankWindow {
    pub fn duration(&self) -> Duration {
        match self {
            RankWindow::Min1 => Duration::minutes(1),
            RankWindow::Min10 => Duration::minutes(10),
            RankWindow::Min30 => Duration::minutes(30),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RankWindow::Min1 => "1min",
            RankWindow::Min10 => "10min",
            RankWindow::Min30 => "30min",
        }
    }
}

impl FromStr for RankWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1min" => Ok(RankWindow::Min1),
            "10min" => Ok(RankWindow::Min10),
            "30min" => Ok(RankWindow::Min30),
            other => Err(format!("unknown ranking window '{other}'")),
        }
    }
}

/// How much of the requested window the data actually covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// Nothing collected for this entity yet.
    NoData,
    Full,
    /// Oldest sample is newer than the cutoff; `available` is the span actually held.
    Partial { available: Duration },
}

impl Coverage {
    /// Text for the "fewer data than requested" banner.
    pub fn notice(&self) -> Option<String> {
        match self {
            Coverage::Partial { available } => Some(format!(
                "data available only for the last {}",
                compact_duration(*available)
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Windowed {
    pub samples: Vec<Sample>,
    pub coverage: Coverage,
}

/// Samples with `timestamp >= now - window`, ascending. `series` must be ascending.
pub fn filter(series: &[Sample], window: TimeWindow, now: DateTime<Utc>) -> Windowed {
    let (Some(oldest), Some(newest)) = (series.first(), series.last()) else {
        return Windowed {
            samples: Vec::new(),
            coverage: Coverage::NoData,
        };
    };
    let cutoff = now - window.duration();
    let start = series.partition_point(|s| s.timestamp < cutoff);
    let span = newest.timestamp - oldest.timestamp;
    let coverage = if oldest.timestamp > cutoff && span < window.duration() {
        Coverage::Partial { available: span }
    } else {
        Coverage::Full
    };
    Windowed {
        samples: series[start..].to_vec(),
        coverage,
    }
}
