//! helmsync reconcile: keeps helm releases in line with what consumers ask for.
//!
//! A pass refreshes the previous live state, diffs it against the desired
//! chart requests ([`plan`]), installs and uninstalls through a
//! [`BackendClient`](helmsync_backend::BackendClient), refreshes again, and
//! hands the result to the [`Engine`] for persistence and publication.

#![forbid(unsafe_code)]

pub mod engine;
pub mod plan;
pub mod publish;
pub mod reconciler;
pub mod refresh;

pub use engine::{Engine, EngineError, EngineResult};
pub use plan::{plan, InstallStep, Plan, UninstallStep};
pub use publish::{Publication, RecordingPublisher, StatusPublisher};
pub use reconciler::Reconciler;
pub use refresh::{RefreshSummary, Refresher};
