//! helmsync extract: turn the human-readable resource tables of a release
//! status report into resolved resource descriptions.
//!
//! A report is a sequence of blocks:
//!
//! ```text
//! ==> v1/Pod(related)
//! NAME                    READY  STATUS   RESTARTS  AGE
//! web-5d7c9b8f6d-abcde    1/1    Running  0         2m
//!
//! ==> v1/Service
//! NAME  TYPE       CLUSTER-IP    EXTERNAL-IP  PORT(S)  AGE
//! web   ClusterIP  10.0.0.12     <none>       80/TCP   2m
//! ```

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use helmsync_core::ResourceDescription;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Prefix of a block header line.
pub const HEADER_MARKER: &str = "==>";
/// Column holding the resource name.
pub const NAME_COLUMN: &str = "NAME";

/// A `(type, name)` pair read from a report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    /// Lower-cased kind, e.g. `pod` or `service`.
    pub kind: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), name: name.into() }
    }
}

/// Extract the resource type from a header line such as `==> apps/v1/Deployment`
/// or `==> v1/Pod(related)`. Returns `None` when the line carries no usable type.
pub fn header_type(line: &str) -> Option<String> {
    let rest = line.trim_start().strip_prefix(HEADER_MARKER)?;
    let token = rest.split_whitespace().next()?;
    let kind = token.rsplit('/').next().unwrap_or(token);
    let kind = kind.split('(').next().unwrap_or(kind).trim();
    if kind.is_empty() {
        return None;
    }
    Some(kind.to_ascii_lowercase())
}

#[derive(Debug, Default)]
struct Block {
    kind: Option<String>,
    name_col: Option<usize>,
}

/// Parse a report into `(type, name)` pairs.
///
/// Types keep the order in which they were first seen; names keep report
/// order within their type. A block ends at the next header or at the first
/// line that has no token in the name column (usually a blank line).
pub fn parse_report(report: &str) -> Vec<ResourceKey> {
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    let mut block = Block::default();

    for line in report.lines() {
        if line.trim_start().starts_with(HEADER_MARKER) {
            block = Block { kind: header_type(line), name_col: None };
            continue;
        }
        let Some(kind) = block.kind.clone() else { continue };
        let cols: Vec<&str> = line.split_whitespace().collect();
        match block.name_col {
            None => match cols.iter().position(|c| *c == NAME_COLUMN) {
                Some(idx) => block.name_col = Some(idx),
                None => {
                    debug!(kind = %kind, "report block without NAME column; skipping");
                    block = Block::default();
                }
            },
            Some(idx) => match cols.get(idx) {
                Some(name) => match groups.iter_mut().find(|(k, _)| *k == kind) {
                    Some((_, names)) => names.push((*name).to_string()),
                    None => groups.push((kind, vec![(*name).to_string()])),
                },
                None => block = Block::default(),
            },
        }
    }

    groups
        .into_iter()
        .flat_map(|(kind, names)| names.into_iter().map(move |name| ResourceKey { kind: kind.clone(), name }))
        .collect()
}

/// Resolves an extracted resource name into its full description.
#[async_trait::async_trait]
pub trait ResourceLookup: Send + Sync {
    /// `None` when the resource cannot be resolved (e.g. deleted since the report was produced).
    async fn lookup(&self, name: &str, namespace: &str, kind: &str) -> Option<ResourceDescription>;
}

/// Parse `report` and resolve every resource found in it. Unresolvable
/// resources are dropped.
pub async fn extract_resources(
    report: &str,
    namespace: &str,
    lookup: &dyn ResourceLookup,
) -> Vec<ResourceDescription> {
    let keys = parse_report(report);
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        match lookup.lookup(&key.name, namespace, &key.kind).await {
            Some(desc) => out.push(desc),
            None => debug!(kind = %key.kind, name = %key.name, ns = %namespace, "resource not resolvable; dropped"),
        }
    }
    out
}

/// Lookup used when no cluster is reachable: every resource is unresolvable,
/// so records carry status but no resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLookup;

#[async_trait::async_trait]
impl ResourceLookup for NoLookup {
    async fn lookup(&self, _name: &str, _namespace: &str, _kind: &str) -> Option<ResourceDescription> {
        None
    }
}

// ----------------- Test double -----------------

/// Table-driven lookup for tests. Records every call in order.
#[derive(Debug, Default)]
pub struct StaticLookup {
    table: HashMap<ResourceKey, ResourceDescription>,
    calls: Mutex<Vec<ResourceKey>>,
}

impl StaticLookup {
    pub fn new() -> Self { Self::default() }

    /// Register a resource; its description is a small JSON object naming it.
    pub fn with(mut self, kind: &str, name: &str) -> Self {
        let desc = serde_json::json!({ "kind": kind, "metadata": { "name": name } });
        self.table.insert(ResourceKey::new(kind, name), desc);
        self
    }

    pub fn calls(&self) -> Vec<ResourceKey> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ResourceLookup for StaticLookup {
    async fn lookup(&self, name: &str, _namespace: &str, kind: &str) -> Option<ResourceDescription> {
        let key = ResourceKey::new(kind, name);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(key.clone());
        }
        self.table.get(&key).cloned()
    }
}
