use std::sync::Mutex;

use anyhow::{anyhow, Result};
use helmsync_core::{ConsumerId, LiveState};

/// Delivers live state back to consumers.
#[async_trait::async_trait]
pub trait StatusPublisher: Send + Sync {
    /// Publish the full snapshot to every consumer.
    async fn publish(&self, live: &LiveState) -> Result<()>;

    /// Publish only to `consumers`; `live` is already narrowed to them.
    async fn publish_to(&self, consumers: &[ConsumerId], live: &LiveState) -> Result<()>;
}

/// One delivery seen by [`RecordingPublisher`]. `consumers` is `None` for a broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub consumers: Option<Vec<ConsumerId>>,
    pub live: LiveState,
}

/// Publisher double that keeps everything it was asked to deliver.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    sent: Mutex<Vec<Publication>>,
}

impl RecordingPublisher {
    pub fn new() -> Self { Self::default() }

    pub fn publications(&self) -> Vec<Publication> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn push(&self, p: Publication) -> Result<()> {
        self.sent.lock().map_err(|_| anyhow!("publisher lock poisoned"))?.push(p);
        Ok(())
    }
}

#[async_trait::async_trait]
impl StatusPublisher for RecordingPublisher {
    async fn publish(&self, live: &LiveState) -> Result<()> {
        self.push(Publication { consumers: None, live: live.clone() })
    }

    async fn publish_to(&self, consumers: &[ConsumerId], live: &LiveState) -> Result<()> {
        self.push(Publication { consumers: Some(consumers.to_vec()), live: live.clone() })
    }
}
