//! Agent installation progress, driven by polling a server's provisioning role.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::source::RoleSource;

pub const ROLE_LOGIN: &str = "login";
pub const ROLE_IDENTIFIED: &str = "identificado";
pub const ROLE_AGENT: &str = "agente";

pub fn default_final_roles() -> Vec<String> {
    vec!["ativo".into(), "instalado".into()]
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InstallState {
    #[default]
    Connecting,
    Collecting,
    Installing,
    Completed,
    Error(String),
}

impl InstallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstallState::Completed | InstallState::Error(_))
    }

    pub fn label(&self) -> &str {
        match self {
            InstallState::Connecting => "connecting",
            InstallState::Collecting => "collecting",
            InstallState::Installing => "installing",
            InstallState::Completed => "completed",
            InstallState::Error(_) => "error",
        }
    }
}

/// Next state after observing `role`. Terminal states never change; unknown roles keep
/// the current state.
pub fn transition(state: &InstallState, role: &str, final_roles: &[String]) -> InstallState {
    if state.is_terminal() {
        return state.clone();
    }
    match role {
        ROLE_LOGIN => InstallState::Collecting,
        ROLE_IDENTIFIED | ROLE_AGENT => InstallState::Installing,
        r if final_roles.iter().any(|f| f == r) => InstallState::Completed,
        _ => state.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstallStatus {
    pub state: InstallState,
    /// Last role observed, if any.
    pub role: Option<String>,
}

impl InstallStatus {
    /// Installing with the agent sub-step already reported done.
    pub fn agent_ready(&self) -> bool {
        self.state == InstallState::Installing && self.role.as_deref() == Some(ROLE_AGENT)
    }
}

/// Tracks one server's installation. `start` connects and polls until a terminal state;
/// a failed connection can be retried with `retry`.
pub struct InstallTracker {
    address: String,
    source: Arc<dyn RoleSource>,
    interval: Duration,
    final_roles: Arc<[String]>,
    status: Arc<watch::Sender<InstallStatus>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl InstallTracker {
    pub fn new(
        address: impl Into<String>,
        source: Arc<dyn RoleSource>,
        interval: Duration,
        final_roles: Vec<String>,
    ) -> Self {
        let (tx, _rx) = watch::channel(InstallStatus::default());
        Self {
            address: address.into(),
            source,
            interval: interval.max(Duration::from_millis(1)),
            final_roles: final_roles.into(),
            status: Arc::new(tx),
            join: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn status(&self) -> InstallStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InstallStatus> {
        self.status.subscribe()
    }

    pub fn start(&self) {
        self.stop();
        self.status.send_replace(InstallStatus::default());

        let address = self.address.clone();
        let source = self.source.clone();
        let status = self.status.clone();
        let final_roles = self.final_roles.clone();
        let interval = self.interval;

        let join = tokio::spawn(async move {
            if let Err(e) = source.begin_install(&address).await {
                warn!(%address, error = %e, "installation connection failed");
                status.send_replace(InstallStatus {
                    state: InstallState::Error(e.to_string()),
                    role: None,
                });
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let role = match source.fetch_role(&address).await {
                    Ok(Some(role)) => role,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(%address, error = %e, "role poll failed");
                        continue;
                    }
                };
                let current = status.borrow().clone();
                let next = transition(&current.state, &role, &final_roles);
                if next != current.state {
                    info!(
                        %address,
                        from = current.state.label(),
                        to = next.label(),
                        %role,
                        "install progress"
                    );
                }
                let done = next == InstallState::Completed;
                status.send_replace(InstallStatus {
                    state: next,
                    role: Some(role),
                });
                if done {
                    break;
                }
            }
        });
        *self.join.lock().unwrap_or_else(PoisonError::into_inner) = Some(join);
    }

    /// Re-enter `Connecting` after an error. Returns false unless the tracker had failed.
    pub fn retry(&self) -> bool {
        if !matches!(self.status().state, InstallState::Error(_)) {
            return false;
        }
        self.start();
        true
    }

    pub fn stop(&self) {
        if let Some(j) = self.join.lock().unwrap_or_else(PoisonError::into_inner).take() {
            j.abort();
        }
    }
}

impl Drop for InstallTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use futures::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    struct Scripted {
        fail_connect: AtomicUsize,
        roles: Mutex<VecDeque<&'static str>>,
        polls: AtomicUsize,
    }

    impl Scripted {
        fn new(fail_connect: usize, roles: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                fail_connect: AtomicUsize::new(fail_connect),
                roles: Mutex::new(roles.iter().copied().collect()),
                polls: AtomicUsize::new(0),
            })
        }
    }

    impl RoleSource for Scripted {
        fn begin_install<'a>(
            &'a self,
            _address: &'a str,
        ) -> BoxFuture<'a, Result<(), SourceError>> {
            Box::pin(async move {
                let left = self.fail_connect.load(Ordering::SeqCst);
                if left > 0 {
                    self.fail_connect.store(left - 1, Ordering::SeqCst);
                    return Err(SourceError::Connect {
                        url: "ssh://10.0.0.7".into(),
                        reason: "auth failed".into(),
                    });
                }
                Ok(())
            })
        }

        fn fetch_role<'a>(
            &'a self,
            _address: &'a str,
        ) -> BoxFuture<'a, Result<Option<String>, SourceError>> {
            Box::pin(async move {
                self.polls.fetch_add(1, Ordering::SeqCst);
                let mut q = self.roles.lock().unwrap();
                let role = if q.len() > 1 { q.pop_front() } else { q.front().copied() };
                Ok(role.map(String::from))
            })
        }
    }

    fn finals() -> Vec<String> {
        default_final_roles()
    }

    #[test]
    fn role_mapping() {
        let f = finals();
        let s = InstallState::Connecting;
        assert_eq!(transition(&s, "login", &f), InstallState::Collecting);
        assert_eq!(transition(&s, "identificado", &f), InstallState::Installing);
        assert_eq!(
            transition(&InstallState::Installing, "agente", &f),
            InstallState::Installing
        );
        assert_eq!(transition(&s, "ativo", &f), InstallState::Completed);
        assert_eq!(transition(&s, "whatever", &f), InstallState::Connecting);
    }

    #[test]
    fn terminal_states_stick() {
        let f = finals();
        assert_eq!(
            transition(&InstallState::Completed, "login", &f),
            InstallState::Completed
        );
        let err = InstallState::Error("boom".into());
        assert_eq!(transition(&err, "ativo", &f), err);
    }

    #[tokio::test(start_paused = true)]
    async fn walks_through_states_and_stops_polling() {
        let src = Scripted::new(0, &["login", "identificado", "agente", "instalado"]);
        let tracker =
            InstallTracker::new("10.0.0.7", src.clone(), Duration::from_secs(5), finals());
        let mut rx = tracker.subscribe();
        tracker.start();

        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            let st = rx.borrow().clone();
            seen.push((st.state.clone(), st.agent_ready()));
            if st.state.is_terminal() {
                break;
            }
        }
        assert_eq!(
            seen.last().map(|(s, _)| s.clone()),
            Some(InstallState::Completed)
        );
        assert!(seen.contains(&(InstallState::Collecting, false)));
        assert!(seen.contains(&(InstallState::Installing, true)));

        let polls = src.polls.load(Ordering::SeqCst);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(src.polls.load(Ordering::SeqCst), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_failure_is_terminal_until_retry() {
        let src = Scripted::new(1, &["login"]);
        let tracker =
            InstallTracker::new("10.0.0.7", src.clone(), Duration::from_secs(5), finals());
        assert!(!tracker.retry());
        tracker.start();
        sleep(Duration::from_secs(12)).await;
        assert!(matches!(
            tracker.status().state,
            InstallState::Error(ref m) if m.contains("auth failed")
        ));
        assert_eq!(src.polls.load(Ordering::SeqCst), 0);

        assert!(tracker.retry());
        sleep(Duration::from_secs(1)).await;
        assert_eq!(tracker.status().state, InstallState::Collecting);
        assert_eq!(tracker.status().role.as_deref(), Some("login"));
    }
}
