use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use helmsync_core::ReleaseRecord;

use crate::{BackendClient, BackendError, ReleaseStatus, StatusOutcome};

/// One recorded `install` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallCall {
    pub name: String,
    pub repo: String,
    pub namespace: String,
}

#[derive(Debug, Default)]
struct MockState {
    releases: BTreeMap<String, ReleaseStatus>,
    install_failures: HashMap<String, BackendError>,
    uninstall_failures: HashMap<String, BackendError>,
    unavailable: bool,
    next_id: u64,
    installs: Vec<InstallCall>,
    uninstalls: Vec<String>,
    status_queries: Vec<String>,
}

/// In-memory backend for tests. Release ids are `<chart>-<n>`.
#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every install of `chart` fail with `err` until cleared.
    pub fn fail_install(&self, chart: &str, err: BackendError) {
        self.state().install_failures.insert(chart.to_string(), err);
    }

    pub fn clear_install_failure(&self, chart: &str) {
        self.state().install_failures.remove(chart);
    }

    /// Make every uninstall of `release` fail with `err`; the release stays put.
    pub fn fail_uninstall(&self, release: &str, err: BackendError) {
        self.state().uninstall_failures.insert(release.to_string(), err);
    }

    /// While set, every call reports the backend as unreachable.
    pub fn set_unavailable(&self, on: bool) {
        self.state().unavailable = on;
    }

    /// Seed a release as if it had been installed earlier.
    pub fn add_release(&self, release: &str, status: &str, report: &str) {
        self.state().releases.insert(
            release.to_string(),
            ReleaseStatus { status: status.to_string(), resources_report: report.to_string() },
        );
    }

    pub fn set_report(&self, release: &str, report: &str) {
        if let Some(st) = self.state().releases.get_mut(release) {
            st.resources_report = report.to_string();
        }
    }

    /// Drop a release behind the engine's back (manual `helm uninstall`).
    pub fn remove_release(&self, release: &str) {
        self.state().releases.remove(release);
    }

    pub fn releases(&self) -> Vec<String> {
        self.state().releases.keys().cloned().collect()
    }

    pub fn installs(&self) -> Vec<InstallCall> {
        self.state().installs.clone()
    }

    pub fn uninstalls(&self) -> Vec<String> {
        self.state().uninstalls.clone()
    }

    pub fn status_queries(&self) -> Vec<String> {
        self.state().status_queries.clone()
    }

    /// Forget recorded calls, keep releases.
    pub fn reset_calls(&self) {
        let mut st = self.state();
        st.installs.clear();
        st.uninstalls.clear();
        st.status_queries.clear();
    }
}

#[async_trait::async_trait]
impl BackendClient for MockBackend {
    async fn install(&self, name: &str, repo: &str, namespace: &str) -> ReleaseRecord {
        let mut st = self.state();
        st.installs.push(InstallCall { name: name.to_string(), repo: repo.to_string(), namespace: namespace.to_string() });
        if st.unavailable {
            return ReleaseRecord::failed(name, BackendError::Unavailable("mock backend offline".into()).to_string());
        }
        if let Some(err) = st.install_failures.get(name) {
            return ReleaseRecord::failed(name, err.to_string());
        }
        st.next_id += 1;
        let release = format!("{}-{}", name, st.next_id);
        st.releases.insert(release.clone(), ReleaseStatus { status: "DEPLOYED".into(), resources_report: String::new() });
        ReleaseRecord::installed(name, release, "DEPLOYED")
    }

    async fn uninstall(&self, release: &str) -> Result<bool, BackendError> {
        let mut st = self.state();
        st.uninstalls.push(release.to_string());
        if st.unavailable {
            return Err(BackendError::Unavailable("mock backend offline".into()));
        }
        if let Some(err) = st.uninstall_failures.get(release) {
            return Err(err.clone());
        }
        Ok(st.releases.remove(release).is_some())
    }

    async fn query_status(&self, release: &str) -> StatusOutcome {
        let mut st = self.state();
        st.status_queries.push(release.to_string());
        if st.unavailable {
            return StatusOutcome::Unavailable("mock backend offline".into());
        }
        match st.releases.get(release) {
            Some(s) => StatusOutcome::Found(s.clone()),
            None => StatusOutcome::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_tracks_releases_and_calls() {
        let be = MockBackend::new();
        let rec = be.install("nginx", "r1", "default").await;
        assert_eq!(rec.release_id(), Some("nginx-1"));
        assert!(matches!(be.query_status("nginx-1").await, StatusOutcome::Found(s) if s.status == "DEPLOYED"));
        assert_eq!(be.uninstall("nginx-1").await, Ok(true));
        assert_eq!(be.query_status("nginx-1").await, StatusOutcome::NotFound);
        assert_eq!(be.uninstall("nginx-1").await, Ok(false));
        assert_eq!(be.installs().len(), 1);
        assert_eq!(be.uninstalls(), vec!["nginx-1".to_string(), "nginx-1".to_string()]);
    }

    #[tokio::test]
    async fn scripted_failures_come_back_as_error_records() {
        let be = MockBackend::new();
        be.fail_install("redis", BackendError::RepositoryUnreachable("r2".into()));
        let rec = be.install("redis", "r2", "default").await;
        assert!(!rec.is_installed());
        assert_eq!(rec.error.as_deref(), Some("Helm repository unreachable: r2"));

        be.set_unavailable(true);
        assert!(matches!(be.query_status("anything").await, StatusOutcome::Unavailable(_)));
    }
}
