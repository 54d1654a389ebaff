//! Pure diff between desired chart requests and (refreshed) live releases.

use std::collections::BTreeSet;

use helmsync_core::{ChartName, ChartRequest, ConsumerId, DesiredState, LiveState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallStep {
    pub consumer: ConsumerId,
    pub request: ChartRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UninstallStep {
    pub consumer: ConsumerId,
    pub chart: ChartName,
    pub release: String,
}

/// What a pass has to do. `keep` already holds an entry for every desired
/// consumer, including consumers with no requests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub keep: LiveState,
    pub install: Vec<InstallStep>,
    pub uninstall: Vec<UninstallStep>,
    /// Chart names requested more than once by the same consumer; later copies are ignored.
    pub duplicates: Vec<(ConsumerId, ChartName)>,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.install.is_empty() && self.uninstall.is_empty()
    }
}

/// Compute the plan for one pass.
///
/// An installed record for a desired chart is kept as is. A desired chart with
/// no record, or with a record that never got a release (failed install), is
/// installed. Every remaining installed record is an orphan and gets
/// uninstalled; remaining records without a release are simply dropped.
pub fn plan(desired: &DesiredState, previous: &LiveState) -> Plan {
    let mut working = previous.clone();
    let mut out = Plan::default();

    for (consumer, requests) in desired {
        let kept = out.keep.entry(consumer.clone()).or_default();
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for req in requests {
            if !seen.insert(req.name.as_str()) {
                out.duplicates.push((consumer.clone(), req.name.clone()));
                continue;
            }
            let claimed = working.get_mut(consumer).and_then(|charts| charts.remove(&req.name));
            match claimed {
                Some(rec) if rec.is_installed() => {
                    kept.insert(req.name.clone(), rec);
                }
                _ => out.install.push(InstallStep { consumer: consumer.clone(), request: req.clone() }),
            }
        }
    }

    for (consumer, charts) in working {
        for (chart, rec) in charts {
            if let Some(release) = rec.release_id() {
                out.uninstall.push(UninstallStep { consumer: consumer.clone(), chart, release: release.to_string() });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmsync_core::ReleaseRecord;

    fn desired(entries: &[(&str, &[(&str, &str)])]) -> DesiredState {
        entries
            .iter()
            .map(|(c, reqs)| (c.to_string(), reqs.iter().map(|(n, r)| ChartRequest::new(*n, *r)).collect()))
            .collect()
    }

    fn live(entries: &[(&str, &[ReleaseRecord])]) -> LiveState {
        entries
            .iter()
            .map(|(c, recs)| (c.to_string(), recs.iter().map(|r| (r.name.clone(), r.clone())).collect()))
            .collect()
    }

    #[test]
    fn new_request_is_installed() {
        let p = plan(&desired(&[("u1", &[("nginx", "r1")])]), &LiveState::new());
        assert_eq!(p.install, vec![InstallStep { consumer: "u1".into(), request: ChartRequest::new("nginx", "r1") }]);
        assert!(p.uninstall.is_empty());
        assert!(p.keep["u1"].is_empty());
    }

    #[test]
    fn installed_request_is_kept_and_orphan_uninstalled() {
        let prev = live(&[(
            "u1",
            &[ReleaseRecord::installed("nginx", "rel-1", "DEPLOYED"), ReleaseRecord::installed("redis", "rel-2", "DEPLOYED")],
        )]);
        let p = plan(&desired(&[("u1", &[("nginx", "r1")])]), &prev);
        assert!(p.install.is_empty());
        assert_eq!(p.keep["u1"]["nginx"].release_id(), Some("rel-1"));
        assert_eq!(
            p.uninstall,
            vec![UninstallStep { consumer: "u1".into(), chart: "redis".into(), release: "rel-2".into() }]
        );
    }

    #[test]
    fn failed_record_is_retried_and_never_uninstalled() {
        let prev = live(&[("u1", &[ReleaseRecord::failed("nginx", "Helm repository unreachable: r1"), ReleaseRecord::failed("old", "x")])]);
        let p = plan(&desired(&[("u1", &[("nginx", "r1")])]), &prev);
        assert_eq!(p.install.len(), 1);
        assert!(p.uninstall.is_empty());
        assert!(p.keep["u1"].is_empty());
    }

    #[test]
    fn same_chart_name_is_scoped_per_consumer() {
        let prev = live(&[("u2", &[ReleaseRecord::installed("nginx", "rel-9", "DEPLOYED")])]);
        let p = plan(&desired(&[("u1", &[("nginx", "r1")]), ("u2", &[("nginx", "r1")])]), &prev);
        assert_eq!(p.install.len(), 1);
        assert_eq!(p.install[0].consumer, "u1");
        assert_eq!(p.keep["u2"]["nginx"].release_id(), Some("rel-9"));
    }

    #[test]
    fn vanished_consumer_is_fully_orphaned() {
        let prev = live(&[("gone", &[ReleaseRecord::installed("a", "rel-a", "DEPLOYED"), ReleaseRecord::installed("b", "rel-b", "DEPLOYED")])]);
        let p = plan(&DesiredState::new(), &prev);
        assert!(p.keep.is_empty());
        let releases: Vec<_> = p.uninstall.iter().map(|u| u.release.as_str()).collect();
        assert_eq!(releases, vec!["rel-a", "rel-b"]);
    }

    #[test]
    fn duplicate_request_is_ignored() {
        let p = plan(&desired(&[("u1", &[("nginx", "r1"), ("nginx", "r2")])]), &LiveState::new());
        assert_eq!(p.install.len(), 1);
        assert_eq!(p.install[0].request.repo, "r1");
        assert_eq!(p.duplicates, vec![("u1".to_string(), "nginx".to_string())]);
    }

    #[test]
    fn unchanged_state_is_noop() {
        let prev = live(&[("u1", &[ReleaseRecord::installed("nginx", "rel-1", "DEPLOYED")])]);
        let p = plan(&desired(&[("u1", &[("nginx", "r1")])]), &prev);
        assert!(p.is_noop());
        assert_eq!(p.keep, prev);
    }
}
