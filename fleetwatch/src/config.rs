//! Connection profiles: JSON mapping of profile name -> gateway settings.
//! Stored under XDG config dir: $XDG_CONFIG_HOME/fleetwatch/profiles.json
//! (fallback: platform config dir).

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::PathBuf, time::Duration};

use crate::error::ConfigError;
use crate::install::default_final_roles;

/// Polling cadence per task, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollIntervals {
    pub fleet_secs: u64,
    pub live_secs: u64,
    pub chart_secs: u64,
    pub processes_secs: u64,
    pub containers_secs: u64,
    pub install_secs: u64,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            fleet_secs: 10,
            live_secs: 3,
            chart_secs: 60,
            processes_secs: 60,
            containers_secs: 10,
            install_secs: 5,
        }
    }
}

impl PollIntervals {
    pub fn fleet(&self) -> Duration {
        Duration::from_secs(self.fleet_secs)
    }
    pub fn live(&self) -> Duration {
        Duration::from_secs(self.live_secs)
    }
    pub fn chart(&self) -> Duration {
        Duration::from_secs(self.chart_secs)
    }
    pub fn processes(&self) -> Duration {
        Duration::from_secs(self.processes_secs)
    }
    pub fn containers(&self) -> Duration {
        Duration::from_secs(self.containers_secs)
    }
    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }
}

fn default_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub intervals: PollIntervals,
    #[serde(default = "default_final_roles")]
    pub final_roles: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ProfileEntry {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
            intervals: PollIntervals::default(),
            final_roles: default_final_roles(),
            request_timeout_secs: default_timeout_secs(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileEntry>,
    #[serde(default)]
    pub version: u32,
}

pub fn config_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join("fleetwatch")
    } else {
        dirs_next::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fleetwatch")
    }
}

pub fn profiles_path() -> PathBuf {
    config_dir().join("profiles.json")
}

/// Missing or unreadable files load as empty.
pub fn load_profiles() -> ProfilesFile {
    match fs::read_to_string(profiles_path()) {
        Ok(s) => serde_json::from_str(&s).unwrap_or_default(),
        Err(_) => ProfilesFile::default(),
    }
}

pub fn save_profiles(p: &ProfilesFile) -> Result<(), ConfigError> {
    let path = profiles_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let data = serde_json::to_vec_pretty(p)?;
    fs::write(&path, data).map_err(|source| ConfigError::Io { path, source })
}

#[derive(Debug, PartialEq)]
pub enum ResolveProfile {
    /// Use the provided runtime inputs (not persisted).
    Direct(ProfileEntry),
    /// Loaded from an existing profile entry.
    Loaded(ProfileEntry),
    /// Caller should offer a choice among these profile names.
    PromptSelect(Vec<String>),
    /// Named profile does not exist and no url was given.
    Missing(String),
    /// Nothing to go on.
    None,
}

pub struct ProfileRequest {
    pub profile_name: Option<String>,
    pub url: Option<String>,
    pub token: Option<String>,
}

impl ProfileRequest {
    pub fn resolve(self, pf: &ProfilesFile) -> ResolveProfile {
        match (self.url, self.profile_name) {
            (Some(url), name) => {
                // Keep tuned intervals of an existing profile when only the url/token change
                let mut entry = name
                    .and_then(|n| pf.profiles.get(&n).cloned())
                    .unwrap_or_else(|| ProfileEntry::new(url.clone(), None));
                entry.url = url;
                if self.token.is_some() {
                    entry.token = self.token;
                }
                ResolveProfile::Direct(entry)
            }
            (None, Some(name)) => match pf.profiles.get(&name) {
                Some(entry) => {
                    let mut entry = entry.clone();
                    if self.token.is_some() {
                        entry.token = self.token;
                    }
                    ResolveProfile::Loaded(entry)
                }
                None => ResolveProfile::Missing(name),
            },
            (None, None) if pf.profiles.is_empty() => ResolveProfile::None,
            (None, None) => ResolveProfile::PromptSelect(pf.profiles.keys().cloned().collect()),
        }
    }
}
