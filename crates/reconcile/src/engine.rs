use std::sync::Arc;
use std::time::Instant;

use helmsync_backend::BackendClient;
use helmsync_core::{restrict_to, ConsumerId, DesiredState, EngineConfig, LiveState};
use helmsync_extract::ResourceLookup;
use helmsync_persist::{get_or_default, set_json, Store};
use tracing::info;

use crate::publish::StatusPublisher;
use crate::reconciler::Reconciler;

/// Failures that abort a pass. Per-chart failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("state store failed: {0:#}")]
    Store(anyhow::Error),
    #[error("publishing status failed: {0:#}")]
    Publish(anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Ties reconciler, state store, and status delivery together for one trigger.
pub struct Engine {
    reconciler: Reconciler,
    store: Arc<dyn Store>,
    publisher: Arc<dyn StatusPublisher>,
    state_key: String,
}

impl Engine {
    pub fn new(
        cfg: &EngineConfig,
        backend: Arc<dyn BackendClient>,
        lookup: Arc<dyn ResourceLookup>,
        store: Arc<dyn Store>,
        publisher: Arc<dyn StatusPublisher>,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(backend, lookup, cfg.namespace.clone()),
            store,
            publisher,
            state_key: cfg.state_key.clone(),
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Persisted live state as of the last completed pass.
    pub fn load_live(&self) -> EngineResult<LiveState> {
        get_or_default(self.store.as_ref(), &self.state_key).map_err(EngineError::Store)
    }

    /// Desired state changed: reconcile, persist, then publish the same value.
    /// Nothing is published when the state cannot be saved.
    pub async fn run_pass(&self, desired: &DesiredState) -> EngineResult<LiveState> {
        let t0 = Instant::now();
        let previous = self.load_live()?;
        let live = self.reconciler.reconcile(desired, previous).await;
        set_json(self.store.as_ref(), &self.state_key, &live).map_err(EngineError::Store)?;
        self.publisher.publish(&live).await.map_err(EngineError::Publish)?;
        info!(consumers = live.len(), took_ms = %t0.elapsed().as_millis(), "engine: pass published");
        Ok(live)
    }

    /// Status-only trigger: refresh the persisted state of `subscribers` and
    /// publish it to them alone. Desired state and the store are untouched.
    pub async fn refresh_subscribers(&self, subscribers: &[ConsumerId]) -> EngineResult<LiveState> {
        if subscribers.is_empty() {
            return Ok(LiveState::new());
        }
        let t0 = Instant::now();
        let needed = restrict_to(&self.load_live()?, subscribers);
        let (live, summary) = self.reconciler.refresher().refresh_with_summary(needed).await;
        self.publisher.publish_to(subscribers, &live).await.map_err(EngineError::Publish)?;
        info!(
            subscribers = subscribers.len(),
            refreshed = summary.refreshed,
            dropped = summary.dropped,
            unavailable = summary.unavailable,
            took_ms = %t0.elapsed().as_millis(),
            "engine: status refresh published"
        );
        Ok(live)
    }
}
