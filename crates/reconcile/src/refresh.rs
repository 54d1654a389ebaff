use std::sync::Arc;

use helmsync_backend::{BackendClient, StatusOutcome};
use helmsync_core::{ConsumerReleases, LiveState};
use helmsync_extract::{extract_resources, ResourceLookup};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Counts from one refresh sweep.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    /// Releases the backend no longer knows; removed from the state.
    pub dropped: usize,
    /// Releases left untouched because the backend could not be asked.
    pub unavailable: usize,
    /// Records without a release id, passed through.
    pub pending: usize,
}

/// Re-queries the backend for every tracked release and merges the answer.
#[derive(Clone)]
pub struct Refresher {
    backend: Arc<dyn BackendClient>,
    lookup: Arc<dyn ResourceLookup>,
    namespace: String,
}

impl Refresher {
    pub fn new(backend: Arc<dyn BackendClient>, lookup: Arc<dyn ResourceLookup>, namespace: impl Into<String>) -> Self {
        Self { backend, lookup, namespace: namespace.into() }
    }

    pub async fn refresh(&self, live: LiveState) -> LiveState {
        self.refresh_with_summary(live).await.0
    }

    /// Refresh every record that has a release id:
    /// - found: overwrite status, re-extract resources from the report
    /// - not found: drop the record so a later pass can reinstall it
    /// - unavailable: keep the record exactly as it was
    ///
    /// Consumers stay present even when all their records are dropped.
    pub async fn refresh_with_summary(&self, live: LiveState) -> (LiveState, RefreshSummary) {
        let mut summary = RefreshSummary::default();
        let mut out = LiveState::new();
        for (consumer, charts) in live {
            let mut next = ConsumerReleases::new();
            for (chart, mut rec) in charts {
                let Some(release) = rec.release_id().map(str::to_string) else {
                    summary.pending += 1;
                    next.insert(chart, rec);
                    continue;
                };
                match self.backend.query_status(&release).await {
                    StatusOutcome::Found(st) => {
                        debug!(consumer = %consumer, chart = %chart, release = %release, status = %st.status, "refresh: status");
                        rec.status = st.status;
                        rec.resources = extract_resources(&st.resources_report, &self.namespace, self.lookup.as_ref()).await;
                        summary.refreshed += 1;
                        next.insert(chart, rec);
                    }
                    StatusOutcome::NotFound => {
                        counter!("refresh_not_found_total", 1u64);
                        info!(consumer = %consumer, chart = %chart, release = %release, "refresh: release gone; dropping from view");
                        summary.dropped += 1;
                    }
                    StatusOutcome::Unavailable(reason) => {
                        counter!("refresh_unavailable_total", 1u64);
                        warn!(consumer = %consumer, chart = %chart, release = %release, reason = %reason, "refresh: backend unavailable; keeping last known state");
                        summary.unavailable += 1;
                        next.insert(chart, rec);
                    }
                }
            }
            out.insert(consumer, next);
        }
        (out, summary)
    }
}
