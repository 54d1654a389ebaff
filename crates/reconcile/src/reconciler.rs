use std::sync::Arc;
use std::time::Instant;

use helmsync_backend::BackendClient;
use helmsync_core::{record_count, DesiredState, LiveState};
use helmsync_extract::ResourceLookup;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::plan::plan;
use crate::refresh::Refresher;

/// Drives the backend from the diff of desired vs live state.
#[derive(Clone)]
pub struct Reconciler {
    backend: Arc<dyn BackendClient>,
    refresher: Refresher,
    namespace: String,
}

impl Reconciler {
    pub fn new(backend: Arc<dyn BackendClient>, lookup: Arc<dyn ResourceLookup>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let refresher = Refresher::new(backend.clone(), lookup, namespace.clone());
        Self { backend, refresher, namespace }
    }

    pub fn refresher(&self) -> &Refresher {
        &self.refresher
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// One reconciliation pass. Returns the new live state; the caller
    /// persists and publishes it.
    ///
    /// Per-chart failures are contained in the chart's record; nothing here
    /// aborts the pass.
    pub async fn reconcile(&self, desired: &DesiredState, previous: LiveState) -> LiveState {
        let t0 = Instant::now();
        let previous = self.refresher.refresh(previous).await;
        let plan = plan(desired, &previous);
        info!(
            consumers = desired.len(),
            keep = record_count(&plan.keep),
            install = plan.install.len(),
            uninstall = plan.uninstall.len(),
            "reconcile: plan ready"
        );
        for (consumer, chart) in &plan.duplicates {
            warn!(consumer = %consumer, chart = %chart, "reconcile: duplicate chart request ignored");
        }

        let mut live = plan.keep;
        for step in plan.install {
            let req = &step.request;
            let rec = self.backend.install(&req.name, &req.repo, &self.namespace).await;
            counter!("reconcile_installs_total", 1u64);
            match rec.release_id() {
                Some(release) => info!(consumer = %step.consumer, chart = %req.name, release = %release, "reconcile: installed"),
                None => {
                    counter!("reconcile_install_errors_total", 1u64);
                    warn!(
                        consumer = %step.consumer,
                        chart = %req.name,
                        error = %rec.error.as_deref().unwrap_or("no release returned"),
                        "reconcile: install failed; will retry next pass"
                    );
                }
            }
            live.entry(step.consumer).or_default().insert(req.name.clone(), rec);
        }

        for step in plan.uninstall {
            counter!("reconcile_uninstalls_total", 1u64);
            match self.backend.uninstall(&step.release).await {
                Ok(true) => info!(consumer = %step.consumer, chart = %step.chart, release = %step.release, "reconcile: uninstalled"),
                Ok(false) => debug!(release = %step.release, "reconcile: release already gone"),
                Err(e) => {
                    counter!("reconcile_uninstall_errors_total", 1u64);
                    warn!(consumer = %step.consumer, chart = %step.chart, release = %step.release, error = %e, "reconcile: uninstall failed");
                }
            }
        }

        let live = self.refresher.refresh(live).await;
        histogram!("reconcile_pass_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(consumers = live.len(), releases = record_count(&live), took_ms = %t0.elapsed().as_millis(), "reconcile: pass done");
        live
    }
}
