//! helmsync core types: desired chart requests, live release records, and engine config.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Opaque key of one requesting party. Compared by exact string equality.
pub type ConsumerId = String;

/// Chart (package) name; unique within one consumer.
pub type ChartName = String;

/// Full description of a cluster resource as returned by the lookup collaborator.
/// The engine never looks inside it.
pub type ResourceDescription = serde_json::Value;

/// A desired installable chart and the repository it is fetched from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChartRequest {
    pub name: String,
    pub repo: String,
}

impl ChartRequest {
    pub fn new(name: impl Into<String>, repo: impl Into<String>) -> Self {
        Self { name: name.into(), repo: repo.into() }
    }
}

/// Live-state unit for one chart of one consumer.
///
/// A record carrying a non-empty `release` is installed. A record with only
/// `error` set is pending and gets re-installed on the next pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReleaseRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub resources: Vec<ResourceDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReleaseRecord {
    pub fn installed(name: impl Into<String>, release: impl Into<String>, status: impl Into<String>) -> Self {
        Self { name: name.into(), release: Some(release.into()), status: status.into(), ..Default::default() }
    }

    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self { name: name.into(), error: Some(error.into()), ..Default::default() }
    }

    /// Backend-assigned release identifier, if the install went through.
    pub fn release_id(&self) -> Option<&str> {
        self.release.as_deref().filter(|r| !r.is_empty())
    }

    pub fn is_installed(&self) -> bool {
        self.release_id().is_some()
    }
}

/// Desired state: every consumer's ordered chart requests.
pub type DesiredState = BTreeMap<ConsumerId, Vec<ChartRequest>>;

/// One consumer's live releases keyed by chart name.
pub type ConsumerReleases = BTreeMap<ChartName, ReleaseRecord>;

/// Live state: every consumer's tracked releases.
pub type LiveState = BTreeMap<ConsumerId, ConsumerReleases>;

/// Number of release records across all consumers.
pub fn record_count(live: &LiveState) -> usize {
    live.values().map(|m| m.len()).sum()
}

/// Keep only the given consumers of a live state.
pub fn restrict_to(live: &LiveState, consumers: &[ConsumerId]) -> LiveState {
    live.iter()
        .filter(|(k, _)| consumers.iter().any(|c| c == *k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_STATE_KEY: &str = "live-releases";

/// Engine configuration. Built once and threaded explicitly into the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Namespace charts are installed into and resources are resolved in.
    pub namespace: String,
    pub helm_bin: String,
    pub kube_context: Option<String>,
    pub db_path: PathBuf,
    /// Store key that holds the whole live-state snapshot.
    pub state_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            helm_bin: "helm".to_string(),
            kube_context: None,
            db_path: default_db_path(),
            state_key: DEFAULT_STATE_KEY.to_string(),
        }
    }
}

impl EngineConfig {
    /// Read `HELMSYNC_*` environment variables on top of the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let non_empty = |k: &str| get(k).filter(|v| !v.trim().is_empty());
        Self {
            namespace: non_empty("HELMSYNC_NAMESPACE").unwrap_or(d.namespace),
            helm_bin: non_empty("HELMSYNC_HELM_BIN").unwrap_or(d.helm_bin),
            kube_context: non_empty("HELMSYNC_KUBE_CONTEXT"),
            db_path: non_empty("HELMSYNC_DB_PATH").map(PathBuf::from).unwrap_or(d.db_path),
            state_key: non_empty("HELMSYNC_STATE_KEY").unwrap_or(d.state_key),
        }
    }
}

fn default_db_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => {
            let mut p = PathBuf::from(home);
            p.push(".helmsync");
            p.push("state.db");
            p
        }
        None => PathBuf::from("helmsync.db"),
    }
}

pub mod prelude {
    pub use super::{
        ChartName, ChartRequest, ConsumerId, ConsumerReleases, DesiredState, EngineConfig, LiveState,
        ReleaseRecord, ResourceDescription,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn installed_requires_non_empty_release() {
        assert!(ReleaseRecord::installed("nginx", "rel-1", "DEPLOYED").is_installed());
        assert!(!ReleaseRecord::failed("nginx", "Helm repository unreachable").is_installed());
        let empty = ReleaseRecord { name: "nginx".into(), release: Some(String::new()), ..Default::default() };
        assert!(!empty.is_installed());
    }

    #[test]
    fn record_json_omits_absent_fields() {
        let rec = ReleaseRecord::failed("redis", "boom");
        let v = serde_json::to_value(&rec).unwrap();
        assert!(v.get("release").is_none());
        assert_eq!(v["error"], "boom");

        // Older snapshots may carry only release + status.
        let back: ReleaseRecord = serde_json::from_str(r#"{"name":"nginx","release":"rel-1","status":"DEPLOYED"}"#).unwrap();
        assert_eq!(back.release_id(), Some("rel-1"));
        assert!(back.resources.is_empty());
    }

    #[test]
    fn restrict_keeps_only_named_consumers() {
        let mut live = LiveState::new();
        live.entry("u1".into()).or_default().insert("a".into(), ReleaseRecord::installed("a", "r", "DEPLOYED"));
        live.entry("u2".into()).or_default();
        let only = restrict_to(&live, &["u2".to_string(), "u9".to_string()]);
        assert_eq!(only.keys().collect::<Vec<_>>(), vec!["u2"]);
        assert_eq!(record_count(&live), 1);
    }

    #[test]
    fn config_from_lookup_overrides_defaults() {
        let env: HashMap<&str, &str> = [
            ("HELMSYNC_NAMESPACE", "apps"),
            ("HELMSYNC_KUBE_CONTEXT", "prod"),
            ("HELMSYNC_STATE_KEY", " "),
        ]
        .into_iter()
        .collect();
        let cfg = EngineConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.namespace, "apps");
        assert_eq!(cfg.kube_context.as_deref(), Some("prod"));
        assert_eq!(cfg.state_key, DEFAULT_STATE_KEY);
        assert_eq!(cfg.helm_bin, "helm");
    }
}
