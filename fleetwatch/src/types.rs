//! Types that mirror the metrics gateway's JSON schema, plus the normalized forms
//! handed to the rendering layer.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Something telemetry is collected for. Containers and processes are scoped to a
/// server address but are otherwise independent entities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityId {
    Server { address: String },
    Container { address: String, container: String },
    Process { address: String, pid: u32 },
}

impl EntityId {
    pub fn server(address: impl Into<String>) -> Self {
        EntityId::Server {
            address: address.into(),
        }
    }

    pub fn container(address: impl Into<String>, container: impl Into<String>) -> Self {
        EntityId::Container {
            address: address.into(),
            container: container.into(),
        }
    }

    pub fn process(address: impl Into<String>, pid: u32) -> Self {
        EntityId::Process {
            address: address.into(),
            pid,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            EntityId::Server { address }
            | EntityId::Container { address, .. }
            | EntityId::Process { address, .. } => address,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Server { address } => write!(f, "{address}"),
            EntityId::Container { address, container } => write!(f, "{address}/{container}"),
            EntityId::Process { address, pid } => write!(f, "{address}#{pid}"),
        }
    }
}

// ---------- Raw payloads (as served by the gateway) ----------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawProcess {
    #[serde(default, deserialize_with = "lenient_number")]
    pub pid: Option<f64>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub cpu_percent: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub ram_percent: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub rss_kb: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawProcesses {
    #[serde(default)]
    pub by_cpu: Vec<RawProcess>,
}

/// One row from a metrics-read endpoint. Every field is optional on the wire; the
/// aggregator decides what absence means.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSample {
    #[serde(default, deserialize_with = "lenient_number")]
    pub cpu_total: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub cpu_usada: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub cpu_livre: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub mem_total: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub mem_usada: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub mem_livre: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub disco_total: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub disco_usado: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub disco_livre: Option<f64>,
    #[serde(default)]
    pub processes: Option<RawProcesses>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleReply {
    #[serde(default)]
    pub role: Option<String>,
}

// Numbers arrive as JSON numbers, numeric strings (numeric columns) or null.
fn lenient_number<'de, D>(d: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Num {
        F(f64),
        S(String),
    }
    let v = match Option::<Num>::deserialize(d)? {
        Some(Num::F(v)) => Some(v),
        Some(Num::S(s)) => s.trim().parse::<f64>().ok(),
        None => None,
    };
    Ok(v.filter(|x| x.is_finite()))
}

// RFC 3339, or a bare `timestamp without time zone` taken as UTC.
fn lenient_timestamp<'de, D>(d: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(s) = Option::<String>::deserialize(d)? else {
        return Ok(None);
    };
    if let Ok(t) = DateTime::parse_from_rfc3339(&s) {
        return Ok(Some(t.with_timezone(&Utc)));
    }
    let naive = NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S%.f"));
    Ok(naive.ok().map(|n| n.and_utc()))
}

// ---------- Normalized forms ----------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub user: String,
    pub command: String,
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub rss_kb: u64,
}

/// One normalized observation. Percentages are derived once, at ingest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub cpu_total: f64,
    pub cpu_used: f64,
    pub cpu_free: f64,
    pub mem_total_kb: f64,
    pub mem_used_kb: f64,
    pub mem_free_kb: f64,
    pub disk_total_kb: f64,
    pub disk_used_kb: f64,
    pub disk_free_kb: f64,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub disk_percent: f64,
    pub processes: Vec<ProcessSample>,
}

impl Sample {
    pub fn percent(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Cpu => self.cpu_percent,
            Axis::Memory => self.mem_percent,
            Axis::Disk => self.disk_percent,
        }
    }
}

/// Resource axes charted per sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Cpu,
    Memory,
    Disk,
}

/// Axis a process ranking is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    CpuPercent,
    RamPercent,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::CpuPercent => "cpu_percent",
            Metric::RamPercent => "ram_percent",
        }
    }
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" | "cpu_percent" => Ok(Metric::CpuPercent),
            "ram" | "mem" | "ram_percent" => Ok(Metric::RamPercent),
            other => Err(format!("unknown metric '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_sample_accepts_strings_nulls_and_missing_fields() {
        let js = r#"{
            "cpu_total": "4", "cpu_usada": 1.5, "cpu_livre": null,
            "mem_usada": "abc",
            "processes": {"by_cpu": [{"pid": 7, "user": "root", "command": "nginx",
                                      "cpu_percent": "2.5", "ram_percent": 1, "rss_kb": 2048}]},
            "created_at": "2024-05-01T12:00:00.123456+00:00"
        }"#;
        let raw: RawSample = serde_json::from_str(js).unwrap();
        assert_eq!(raw.cpu_total, Some(4.0));
        assert_eq!(raw.cpu_usada, Some(1.5));
        assert_eq!(raw.cpu_livre, None);
        assert_eq!(raw.mem_usada, None);
        assert_eq!(raw.disco_total, None);
        let procs = raw.processes.unwrap().by_cpu;
        assert_eq!(procs[0].cpu_percent, Some(2.5));
        assert_eq!(procs[0].pid, Some(7.0));
        assert!(raw.created_at.is_some());
    }

    #[test]
    fn naive_timestamps_are_read_as_utc() {
        let raw: RawSample =
            serde_json::from_str(r#"{"created_at": "2024-05-01T12:00:00.5"}"#).unwrap();
        let ts = raw.created_at.unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-05-01T12:00:00.500+00:00");

        let bad: RawSample = serde_json::from_str(r#"{"created_at": "yesterday"}"#).unwrap();
        assert!(bad.created_at.is_none());
    }

    #[test]
    fn entity_ids_serialize_tagged() {
        let id = EntityId::container("10.0.0.5", "web");
        let js = serde_json::to_string(&id).unwrap();
        assert_eq!(
            js,
            r#"{"kind":"container","address":"10.0.0.5","container":"web"}"#
        );
        assert_eq!(id.to_string(), "10.0.0.5/web");
        assert_eq!(EntityId::process("h", 42).address(), "h");
    }

    #[test]
    fn metric_parses_short_and_long_names() {
        assert_eq!("cpu".parse::<Metric>().unwrap(), Metric::CpuPercent);
        assert_eq!("ram_percent".parse::<Metric>().unwrap(), Metric::RamPercent);
        assert!("disk".parse::<Metric>().is_err());
    }
}
