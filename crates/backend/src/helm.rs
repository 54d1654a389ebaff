use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use helmsync_core::{EngineConfig, ReleaseRecord};
use metrics::{counter, histogram};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{BackendClient, BackendError, ReleaseStatus, StatusOutcome};

/// Backend client that shells out to the helm executable.
///
/// `uninstall` and `status` address a release in the namespace it was
/// installed into by this client; releases it never installed are looked up
/// in the configured namespace.
#[derive(Debug, Clone)]
pub struct HelmCli {
    bin: String,
    namespace: String,
    kube_context: Option<String>,
    placed: Arc<Mutex<HashMap<String, String>>>,
}

impl HelmCli {
    pub fn new(bin: impl Into<String>, namespace: impl Into<String>, kube_context: Option<String>) -> Self {
        Self { bin: bin.into(), namespace: namespace.into(), kube_context, placed: Arc::default() }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(cfg.helm_bin.clone(), cfg.namespace.clone(), cfg.kube_context.clone())
    }

    /// Namespace to address `release` in.
    pub fn namespace_of(&self, release: &str) -> String {
        let placed = self.placed.lock().unwrap_or_else(|e| e.into_inner());
        placed.get(release).cloned().unwrap_or_else(|| self.namespace.clone())
    }

    fn remember(&self, release: &str, namespace: &str) {
        let mut placed = self.placed.lock().unwrap_or_else(|e| e.into_inner());
        if namespace != self.namespace {
            placed.insert(release.to_string(), namespace.to_string());
        }
    }

    fn forget(&self, release: &str) {
        self.placed.lock().unwrap_or_else(|e| e.into_inner()).remove(release);
    }

    async fn run(&self, op: &str, args: &[&str]) -> Result<String, BackendError> {
        let t0 = Instant::now();
        let mut cmd = Command::new(&self.bin);
        cmd.args(args);
        if let Some(ctx) = &self.kube_context {
            cmd.args(["--kube-context", ctx.as_str()]);
        }
        debug!(op, args = ?args, "helm: exec");
        let out = cmd
            .output()
            .await
            .map_err(|e| BackendError::Unavailable(format!("spawning {}: {}", self.bin, e)))?;
        histogram!("backend_call_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        let err = classify_failure(&stderr);
        debug!(op, error = %err, "helm: failed");
        Err(err)
    }
}

#[async_trait::async_trait]
impl BackendClient for HelmCli {
    async fn install(&self, name: &str, repo: &str, namespace: &str) -> ReleaseRecord {
        let args = ["install", name, "--repo", repo, "--namespace", namespace, "--generate-name", "--output", "json"];
        let res = self.run("install", &args).await.and_then(|stdout| parse_install_output(&stdout));
        match res {
            Ok((release, status)) => {
                info!(chart = %name, release = %release, status = %status, ns = %namespace, "helm: installed");
                self.remember(&release, namespace);
                ReleaseRecord::installed(name, release, status)
            }
            Err(e) => {
                counter!("backend_install_failures_total", 1u64);
                warn!(chart = %name, repo = %repo, error = %e, "helm: install failed");
                ReleaseRecord::failed(name, e.to_string())
            }
        }
    }

    async fn uninstall(&self, release: &str) -> Result<bool, BackendError> {
        let ns = self.namespace_of(release);
        let res = match self.run("uninstall", &["uninstall", release, "--namespace", ns.as_str()]).await {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        };
        if res.is_ok() {
            self.forget(release);
        }
        res
    }

    async fn query_status(&self, release: &str) -> StatusOutcome {
        let ns = self.namespace_of(release);
        let res = self
            .run("status", &["status", release, "--namespace", ns.as_str(), "--show-resources"])
            .await
            .and_then(|stdout| parse_status_output(&stdout));
        match res {
            Ok(status) => StatusOutcome::Found(status),
            Err(BackendError::NotFound(_)) => StatusOutcome::NotFound,
            Err(e) => StatusOutcome::Unavailable(e.to_string()),
        }
    }
}

const UNREACHABLE_MARKERS: &[&str] = &[
    "kubernetes cluster unreachable",
    "connection refused",
    "i/o timeout",
    "no such host",
    "tls handshake timeout",
    "the server is currently unable",
];

// Checked before the network markers: helm wraps the DNS or dial error of a
// bad repo URL inside its own repository message.
const REPOSITORY_MARKERS: &[&str] = &[
    "is not a valid chart repository",
    "index.yaml",
    "failed to fetch",
    "chart not found",
    "no cached repo",
];

/// Map helm's stderr to a typed failure.
pub fn classify_failure(stderr: &str) -> BackendError {
    let msg = stderr.trim().trim_start_matches("Error:").trim().to_string();
    let lower = msg.to_ascii_lowercase();
    if REPOSITORY_MARKERS.iter().any(|m| lower.contains(m)) {
        BackendError::RepositoryUnreachable(msg)
    } else if UNREACHABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        BackendError::Unavailable(msg)
    } else if lower.contains("release: not found") || lower.contains("release not found") {
        BackendError::NotFound(msg)
    } else if lower.contains("repo") {
        BackendError::RepositoryUnreachable(msg)
    } else {
        BackendError::Command(msg)
    }
}

#[derive(Debug, Deserialize)]
struct InstallOutput {
    name: String,
    #[serde(default)]
    info: InstallInfo,
}

#[derive(Debug, Default, Deserialize)]
struct InstallInfo {
    #[serde(default)]
    status: String,
}

/// Release name and upper-cased status from `helm install --output json`.
pub fn parse_install_output(stdout: &str) -> Result<(String, String), BackendError> {
    let out: InstallOutput = serde_json::from_str(stdout).map_err(|e| BackendError::Decode(e.to_string()))?;
    if out.name.is_empty() {
        return Err(BackendError::Decode("install output without release name".into()));
    }
    Ok((out.name, out.info.status.to_ascii_uppercase()))
}

/// Parse the text form of `helm status --show-resources`.
pub fn parse_status_output(stdout: &str) -> Result<ReleaseStatus, BackendError> {
    let mut status: Option<String> = None;
    let mut report = Vec::new();
    let mut in_resources = false;
    for line in stdout.lines() {
        if in_resources {
            if is_section_heading(line) {
                in_resources = false;
            } else {
                report.push(line);
                continue;
            }
        }
        if let Some(v) = line.strip_prefix("STATUS:") {
            status = Some(v.trim().to_ascii_uppercase());
        } else if line.trim_end() == "RESOURCES:" {
            in_resources = true;
        }
    }
    let status = status.ok_or_else(|| BackendError::Decode("status output without STATUS line".into()))?;
    Ok(ReleaseStatus { status, resources_report: report.join("\n") })
}

// `NOTES:`, `TEST SUITE:`, `HOOKS:` and friends close the resources section.
fn is_section_heading(line: &str) -> bool {
    match line.strip_suffix(':') {
        Some(head) => !head.is_empty() && head.chars().all(|c| c.is_ascii_uppercase() || c == ' '),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_separates_not_found_from_unavailable() {
        assert!(matches!(classify_failure("Error: release: not found"), BackendError::NotFound(_)));
        assert!(matches!(
            classify_failure("Error: uninstall: Release not loaded: web: release: not found"),
            BackendError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("Error: Kubernetes cluster unreachable: Get \"https://10.0.0.1:6443/version\": dial tcp: connection refused"),
            BackendError::Unavailable(_)
        ));
        assert!(matches!(
            classify_failure("Error: INSTALLATION FAILED: looks like \"https://charts.example\" is not a valid chart repository"),
            BackendError::RepositoryUnreachable(_)
        ));
        assert!(matches!(classify_failure("Error: something odd"), BackendError::Command(m) if m == "something odd"));
    }

    #[test]
    fn unreachable_repository_is_not_mistaken_for_a_dead_cluster() {
        let stderr = "Error: INSTALLATION FAILED: looks like \"https://charts.nope.invalid\" is not a valid chart repository \
            or cannot be reached: Get \"https://charts.nope.invalid/index.yaml\": dial tcp: lookup charts.nope.invalid: no such host";
        let err = classify_failure(stderr);
        assert!(matches!(err, BackendError::RepositoryUnreachable(_)), "got {err:?}");
        assert!(err.to_string().starts_with("Helm repository unreachable"));

        let refused = "Error: INSTALLATION FAILED: failed to fetch https://10.1.2.3/charts/index.yaml : dial tcp 10.1.2.3:443: connect: connection refused";
        assert!(matches!(classify_failure(refused), BackendError::RepositoryUnreachable(_)));
    }

    #[test]
    fn install_output_parses_name_and_status() {
        let out = r#"{"name":"nginx-1712345678","info":{"status":"deployed","description":"Install complete"},"version":1}"#;
        let (name, status) = parse_install_output(out).unwrap();
        assert_eq!(name, "nginx-1712345678");
        assert_eq!(status, "DEPLOYED");
        assert!(matches!(parse_install_output("not json"), Err(BackendError::Decode(_))));
    }

    #[test]
    fn status_output_splits_status_and_resources() {
        let out = "\
NAME: web
LAST DEPLOYED: Mon Jan  1 00:00:00 2024
NAMESPACE: default
STATUS: deployed
REVISION: 1
RESOURCES:
==> v1/Service
NAME  TYPE       CLUSTER-IP  EXTERNAL-IP  PORT(S)  AGE
web   ClusterIP  10.0.0.12   <none>       80/TCP   2m

NOTES:
1. Get the application URL
";
        let st = parse_status_output(out).unwrap();
        assert_eq!(st.status, "DEPLOYED");
        assert!(st.resources_report.starts_with("==> v1/Service"));
        assert!(st.resources_report.contains("web   ClusterIP"));
        assert!(!st.resources_report.contains("NOTES"));
    }

    #[test]
    fn status_output_without_status_is_decode_error() {
        assert!(matches!(parse_status_output("NAME: web\n"), Err(BackendError::Decode(_))));
    }

    #[test]
    fn release_is_addressed_in_the_namespace_it_went_into() {
        let helm = HelmCli::new("helm", "default", None);
        helm.remember("web-1", "apps");
        helm.remember("db-1", "default");
        assert_eq!(helm.namespace_of("web-1"), "apps");
        assert_eq!(helm.namespace_of("db-1"), "default");
        assert_eq!(helm.namespace_of("never-seen"), "default");
        // Clones share what they know about placed releases.
        assert_eq!(helm.clone().namespace_of("web-1"), "apps");
        helm.forget("web-1");
        assert_eq!(helm.namespace_of("web-1"), "default");
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable_not_not_found() {
        let helm = HelmCli::new("/nonexistent/helmsync-test-helm", "default", None);
        assert!(matches!(helm.query_status("rel-1").await, StatusOutcome::Unavailable(_)));
        let rec = helm.install("nginx", "https://charts.example", "default").await;
        assert!(!rec.is_installed());
        assert!(rec.error.unwrap().starts_with("Helm backend unavailable"));
    }
}
