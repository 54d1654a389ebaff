//! helmsync backend: the release-management client seam.
//!
//! `HelmCli` drives a real helm executable; `MockBackend` is the in-memory
//! double used by tests. Both are chosen at construction time.

#![forbid(unsafe_code)]

use helmsync_core::ReleaseRecord;
use serde::{Deserialize, Serialize};

mod helm;
mod mock;

pub use helm::{classify_failure, parse_install_output, parse_status_output, HelmCli};
pub use mock::{InstallCall, MockBackend};

/// Current status of a release plus the raw resource report that came with it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseStatus {
    /// Backend status code, e.g. `DEPLOYED`.
    pub status: String,
    /// Human-readable resource tables (`==> v1/Pod` blocks).
    pub resources_report: String,
}

/// Result of a status query. Not-found and unavailable are distinct on purpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOutcome {
    Found(ReleaseStatus),
    /// The backend no longer knows the release (removed out of band).
    NotFound,
    /// The backend could not be asked; carries the reason.
    Unavailable(String),
}

/// Backend failures. Display strings double as the `error` text of failed records.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Helm repository unreachable: {0}")]
    RepositoryUnreachable(String),
    #[error("Helm backend unavailable: {0}")]
    Unavailable(String),
    #[error("release not found: {0}")]
    NotFound(String),
    #[error("helm command failed: {0}")]
    Command(String),
    #[error("unreadable helm output: {0}")]
    Decode(String),
}

/// Install/uninstall/status primitives against the release-management backend.
#[async_trait::async_trait]
pub trait BackendClient: Send + Sync {
    /// Install chart `name` from `repo` into `namespace`. Never fails outright:
    /// failures come back as a record with `error` set and no `release`.
    async fn install(&self, name: &str, repo: &str, namespace: &str) -> ReleaseRecord;

    /// Remove a release. `Ok(false)` when it was already gone.
    async fn uninstall(&self, release: &str) -> Result<bool, BackendError>;

    async fn query_status(&self, release: &str) -> StatusOutcome;
}
