//! Release planning and execution
//!
//! A release request is turned into a plan (an ordered list of
//! [`ReleaseAction`]s) by [`Releaser::plan`], then run front to back by
//! [`Releaser::execute`]. Execution fails fast; nothing already done is
//! rolled back. Only the final platform apply is batched.

pub mod actions;
pub mod apply;
pub mod context;
pub mod env;
pub mod executor;
pub mod models;
pub mod planner;
pub mod selectors;
pub mod status;
pub mod updates;

#[cfg(test)]
pub(crate) mod fakes;

pub use apply::ApplyReport;
pub use context::ReleaseContext;
pub use env::ReleaseEnv;
pub use models::{
    ActionKind, ContainerUpdate, ImageSpec, ReleaseAction, ReleaseKind, ReleaseOutcome,
    ReleaseRequest, ReleaseType, ServiceSpec,
};
pub use selectors::{ImageSelector, ServiceSelector};
pub use status::ReleaseStatus;
pub use updates::calculate_updates;

use crate::platform::{PlatformError, ServiceId};
use crate::registry::RegistryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("invalid image {image}: {reason}")]
    InvalidImage { image: String, reason: String },

    #[error("invalid service spec {spec:?}: {reason}")]
    InvalidServiceSpec { spec: String, reason: String },

    #[error("no manifest file found for {0}")]
    ManifestNotFound(ServiceId),

    #[error("multiple manifest files found for {service}: {}", .files.join(", "))]
    AmbiguousManifest { service: ServiceId, files: Vec<String> },

    #[error("the repo path ({0}) is not valid")]
    InvalidPath(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("config repo: {0:#}")]
    Repo(anyhow::Error),

    #[error("manifest: {0:#}")]
    Manifest(anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid release state transition from '{from}' to '{to}'")]
    InvalidTransition {
        from: ReleaseStatus,
        to: ReleaseStatus,
    },

    /// A planned release stopped at a failing action
    #[error("{source}")]
    Failed {
        outcome: Box<ReleaseOutcome>,
        source: Box<ReleaseError>,
    },
}

impl ReleaseError {
    /// The error that stopped the release
    pub fn cause(&self) -> &ReleaseError {
        match self {
            ReleaseError::Failed { source, .. } => source.cause(),
            other => other,
        }
    }

    /// How far a failed release got, when it got past planning
    pub fn outcome(&self) -> Option<&ReleaseOutcome> {
        match self {
            ReleaseError::Failed { outcome, .. } => Some(outcome),
            _ => None,
        }
    }
}

/// Receives human-readable progress while a release is planned and run
pub trait ProgressSink: Send + Sync {
    fn report(&self, message: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn report(&self, message: &str) {
        self(message)
    }
}

/// Plans and executes releases against one environment
pub struct Releaser {
    env: ReleaseEnv,
}

impl Releaser {
    pub fn new(env: ReleaseEnv) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &ReleaseEnv {
        &self.env
    }
}
