use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use helmsync_core::{ConsumerId, ConsumerReleases, LiveState};
use helmsync_reconcile::StatusPublisher;
use tracing::info;

use crate::Output;

/// Prints live state to stdout in the selected output format.
pub struct StdoutPublisher {
    pub output: Output,
}

#[async_trait]
impl StatusPublisher for StdoutPublisher {
    async fn publish(&self, live: &LiveState) -> Result<()> {
        print_live(self.output, live)
    }

    async fn publish_to(&self, _consumers: &[ConsumerId], live: &LiveState) -> Result<()> {
        print_live(self.output, live)
    }
}

/// Writes one `<consumer>.json` per consumer into a directory. The consumer
/// id is percent-encoded, so `model/app/0` lands in `model%2Fapp%2F0.json`.
pub struct DirPublisher {
    dir: PathBuf,
}

impl DirPublisher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write(&self, consumer: &str, releases: &ConsumerReleases) -> Result<()> {
        let path = self.dir.join(file_name(consumer));
        let body = serde_json::to_vec_pretty(releases)?;
        std::fs::write(&path, body).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl StatusPublisher for DirPublisher {
    async fn publish(&self, live: &LiveState) -> Result<()> {
        std::fs::create_dir_all(&self.dir).with_context(|| format!("creating {}", self.dir.display()))?;
        for (consumer, releases) in live {
            self.write(consumer, releases)?;
        }
        info!(dir = %self.dir.display(), consumers = live.len(), "publish: wrote status files");
        Ok(())
    }

    async fn publish_to(&self, consumers: &[ConsumerId], live: &LiveState) -> Result<()> {
        std::fs::create_dir_all(&self.dir).with_context(|| format!("creating {}", self.dir.display()))?;
        let empty = ConsumerReleases::new();
        for consumer in consumers {
            self.write(consumer, live.get(consumer).unwrap_or(&empty))?;
        }
        info!(dir = %self.dir.display(), consumers = consumers.len(), "publish: wrote status files");
        Ok(())
    }
}

/// File holding `consumer`'s status. Never contains a path separator.
pub fn file_name(consumer: &str) -> String {
    format!("{}.json", urlencoding::encode(consumer))
}

pub fn print_live(output: Output, live: &LiveState) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<16} {:<20} {:<28} {:<16} RESOURCES", "CONSUMER", "CHART", "RELEASE", "STATUS");
            for (consumer, releases) in live {
                if releases.is_empty() {
                    println!("{:<16} {:<20} {:<28} {:<16} -", consumer, "-", "-", "-");
                }
                for rec in releases.values() {
                    let status = match &rec.error {
                        Some(e) => format!("{} ({e})", rec.status),
                        None => rec.status.clone(),
                    };
                    println!(
                        "{:<16} {:<20} {:<28} {:<16} {}",
                        consumer,
                        rec.name,
                        rec.release_id().unwrap_or("-"),
                        status,
                        rec.resources.len()
                    );
                }
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(live)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmsync_core::ReleaseRecord;

    fn temp_dir() -> PathBuf {
        let n = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!("helmsyncctl-test-{n}"))
    }

    fn sample() -> LiveState {
        let mut live = LiveState::new();
        live.entry("u1".into()).or_default().insert("nginx".into(), ReleaseRecord::installed("nginx", "nginx-1", "DEPLOYED"));
        live.entry("u2".into()).or_default();
        live
    }

    #[tokio::test]
    async fn dir_publisher_writes_a_file_per_consumer() {
        let dir = temp_dir();
        let p = DirPublisher::new(&dir);
        p.publish(&sample()).await.unwrap();

        let u1: ConsumerReleases = serde_json::from_slice(&std::fs::read(dir.join("u1.json")).unwrap()).unwrap();
        assert_eq!(u1["nginx"].release_id(), Some("nginx-1"));
        let u2: ConsumerReleases = serde_json::from_slice(&std::fs::read(dir.join("u2.json")).unwrap()).unwrap();
        assert!(u2.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn consumer_ids_cannot_leave_the_publish_dir() {
        assert_eq!(file_name("u1"), "u1.json");
        assert_eq!(file_name("model-uuid/app/0"), "model-uuid%2Fapp%2F0.json");
        assert_eq!(file_name("../etc/passwd"), "..%2Fetc%2Fpasswd.json");
        assert_eq!(file_name(".."), "...json");
        assert!(!file_name("a\\b").contains('\\'));
    }

    #[tokio::test]
    async fn dir_publisher_handles_unit_style_consumer_ids() {
        let dir = temp_dir();
        let mut live = LiveState::new();
        live.entry("model-uuid/app/0".into()).or_default().insert("nginx".into(), ReleaseRecord::installed("nginx", "nginx-1", "DEPLOYED"));
        DirPublisher::new(&dir).publish(&live).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(&dir).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(files, vec![std::ffi::OsString::from("model-uuid%2Fapp%2F0.json")]);
        let back: ConsumerReleases = serde_json::from_slice(&std::fs::read(dir.join(file_name("model-uuid/app/0"))).unwrap()).unwrap();
        assert_eq!(back["nginx"].release_id(), Some("nginx-1"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn dir_publisher_targets_only_named_consumers() {
        let dir = temp_dir();
        let p = DirPublisher::new(&dir);
        p.publish_to(&["u1".to_string(), "gone".to_string()], &sample()).await.unwrap();

        assert!(dir.join("u1.json").exists());
        assert!(!dir.join("u2.json").exists());
        let gone: ConsumerReleases = serde_json::from_slice(&std::fs::read(dir.join("gone.json")).unwrap()).unwrap();
        assert!(gone.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
