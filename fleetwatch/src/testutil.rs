//! Fixtures shared by unit tests.

use chrono::{DateTime, Duration, Utc};

use crate::types::{ProcessSample, Sample};

pub fn base() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn at(min: i64) -> DateTime<Utc> {
    base() + Duration::minutes(min)
}

pub fn sample(ts: DateTime<Utc>, cpu: f64) -> Sample {
    Sample {
        timestamp: ts,
        cpu_total: 0.0,
        cpu_used: cpu,
        cpu_free: 0.0,
        mem_total_kb: 0.0,
        mem_used_kb: 0.0,
        mem_free_kb: 0.0,
        disk_total_kb: 0.0,
        disk_used_kb: 0.0,
        disk_free_kb: 0.0,
        cpu_percent: cpu,
        mem_percent: 0.0,
        disk_percent: 0.0,
        processes: vec![],
    }
}

pub fn proc(pid: u32, command: &str, cpu: f64, ram: f64) -> ProcessSample {
    ProcessSample {
        pid,
        user: "root".into(),
        command: command.into(),
        cpu_percent: cpu,
        ram_percent: ram,
        rss_kb: 0,
    }
}
