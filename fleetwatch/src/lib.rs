//! Fleet telemetry engine: polls a metrics gateway on independent timers, keeps
//! normalized per-entity history and answers the read paths a dashboard renders from.

pub mod aggregate;
pub mod config;
pub mod dashboard;
pub mod domain;
pub mod error;
pub mod history;
pub mod install;
pub mod ranking;
pub mod scheduler;
pub mod source;
pub mod types;
pub mod util;
pub mod window;

#[cfg(test)]
mod testutil;

pub use dashboard::{Dashboard, EntityStatus};
pub use error::{ConfigError, SourceError};
pub use types::{EntityId, Metric, Sample};
pub use window::{RankWindow, TimeWindow};
