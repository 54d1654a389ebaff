//! helmsync kubehub: resolve `(type, name, namespace)` triples from helm
//! resource reports into full object descriptions via kube discovery.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use helmsync_core::ResourceDescription;
use helmsync_extract::ResourceLookup;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A served resource kind as seen by discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    /// True when a report type token (`pod`, `deployment`, `services`) names this kind.
    pub fn matches(&self, type_token: &str) -> bool {
        let t = type_token.to_ascii_lowercase();
        self.kind.to_ascii_lowercase() == t || self.plural == t
    }
}

/// Pick the served resource a type token refers to. Core group wins over
/// aggregated groups that reuse a kind name (e.g. `events.k8s.io/Event`).
pub fn resolve_type<'a>(resources: &'a [DiscoveredResource], type_token: &str) -> Option<&'a DiscoveredResource> {
    resolve_index(resources, type_token).map(|i| &resources[i])
}

fn resolve_index(resources: &[DiscoveredResource], type_token: &str) -> Option<usize> {
    let mut hits = resources.iter().enumerate().filter(|(_, r)| r.matches(type_token));
    let (first, r) = hits.next()?;
    if r.group.is_empty() {
        return Some(first);
    }
    Some(hits.find(|(_, r)| r.group.is_empty()).map(|(i, _)| i).unwrap_or(first))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Cluster-backed resource lookup. Discovery runs once at connect time.
pub struct KubeLookup {
    client: Client,
    discovered: Vec<DiscoveredResource>,
    api_resources: Vec<ApiResource>,
}

impl KubeLookup {
    pub async fn connect(kube_context: Option<&str>) -> Result<Self> {
        let client = match kube_context {
            Some(ctx) => {
                let opts = kube::config::KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
                let cfg = kube::Config::from_kubeconfig(&opts).await.context("loading kubeconfig")?;
                Client::try_from(cfg).context("building kube client")?
            }
            None => Client::try_default().await.context("building default kube client")?,
        };
        Self::with_client(client).await
    }

    pub async fn with_client(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await.context("running kube discovery")?;
        let mut discovered = Vec::new();
        let mut api_resources = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let d = DiscoveredResource {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    plural: ar.plural.clone(),
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                };
                discovered.push(d);
                api_resources.push(ar);
            }
        }
        info!(kinds = discovered.len(), "kubehub: discovery done");
        Ok(Self { client, discovered, api_resources })
    }

    async fn get(&self, name: &str, namespace: &str, type_token: &str) -> Result<Option<ResourceDescription>> {
        let Some(idx) = resolve_index(&self.discovered, type_token) else {
            debug!(kind = %type_token, "kubehub: unknown resource type");
            return Ok(None);
        };
        let ar = &self.api_resources[idx];
        let api: Api<DynamicObject> = if self.discovered[idx].namespaced {
            Api::namespaced_with(self.client.clone(), namespace, ar)
        } else {
            Api::all_with(self.client.clone(), ar)
        };
        let Some(obj) = api.get_opt(name).await.with_context(|| format!("getting {}/{}", type_token, name))? else {
            return Ok(None);
        };
        let mut raw = serde_json::to_value(&obj).context("serializing DynamicObject")?;
        strip_managed_fields(&mut raw);
        Ok(Some(raw))
    }
}

#[async_trait::async_trait]
impl ResourceLookup for KubeLookup {
    async fn lookup(&self, name: &str, namespace: &str, kind: &str) -> Option<ResourceDescription> {
        match self.get(name, namespace, kind).await {
            Ok(found) => found,
            Err(e) => {
                counter!("kubehub_lookup_errors_total", 1u64);
                warn!(kind = %kind, name = %name, ns = %namespace, error = %e, "kubehub: lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(group: &str, kind: &str, plural: &str, namespaced: bool) -> DiscoveredResource {
        DiscoveredResource {
            group: group.into(),
            version: "v1".into(),
            kind: kind.into(),
            plural: plural.into(),
            namespaced,
        }
    }

    #[test]
    fn resolve_matches_kind_or_plural() {
        let all = vec![res("apps", "Deployment", "deployments", true), res("", "Service", "services", true)];
        assert_eq!(resolve_type(&all, "deployment").map(|r| r.kind.as_str()), Some("Deployment"));
        assert_eq!(resolve_type(&all, "services").map(|r| r.kind.as_str()), Some("Service"));
        assert!(resolve_type(&all, "pod").is_none());
    }

    #[test]
    fn resolve_prefers_core_group() {
        let all = vec![res("events.k8s.io", "Event", "events", true), res("", "Event", "events", true)];
        assert_eq!(resolve_type(&all, "event").map(|r| r.group.as_str()), Some(""));
    }

    #[test]
    fn strip_managed_fields_keeps_rest_of_metadata() {
        let mut v = serde_json::json!({
            "metadata": { "name": "web", "managedFields": [ { "manager": "helm" } ] },
            "spec": {}
        });
        strip_managed_fields(&mut v);
        assert_eq!(v["metadata"]["name"], "web");
        assert!(v["metadata"].get("managedFields").is_none());
    }
}
