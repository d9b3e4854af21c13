//! The platform running the services: what is deployed and how new
//! definitions are applied.

#[cfg(feature = "k8s")]
pub mod kubernetes;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_NAMESPACE: &str = "default";

/// `namespace/name` of a running service
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceId(String);

impl ServiceId {
    /// Accepts `namespace/name` or a bare `name` in the default namespace
    pub fn parse(s: &str) -> Result<Self, PlatformError> {
        let invalid = || PlatformError::InvalidServiceId(s.to_string());
        match s.split_once('/') {
            Some((namespace, name)) => {
                if namespace.is_empty() || name.is_empty() || name.contains('/') {
                    return Err(invalid());
                }
                Ok(Self(s.to_string()))
            }
            None if s.is_empty() => Err(invalid()),
            None => Ok(Self(format!("{}/{}", DEFAULT_NAMESPACE, s))),
        }
    }

    pub fn make(namespace: &str, name: &str) -> Self {
        Self(format!("{}/{}", namespace, name))
    }

    /// Namespace and name
    pub fn components(&self) -> (&str, &str) {
        self.0
            .split_once('/')
            .unwrap_or((DEFAULT_NAMESPACE, self.0.as_str()))
    }

    pub fn namespace(&self) -> &str {
        self.components().0
    }

    pub fn name(&self) -> &str {
        self.components().1
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServiceId {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServiceId {
    type Error = PlatformError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ServiceId> for String {
    fn from(id: ServiceId) -> Self {
        id.0
    }
}

pub type ServiceIdSet = BTreeSet<ServiceId>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    /// `None` when the platform could not report the containers
    pub containers: Option<Vec<Container>>,
}

impl Service {
    pub fn new(id: ServiceId, containers: Vec<Container>) -> Self {
        Self {
            id,
            containers: Some(containers),
        }
    }

    pub fn containers_or_error(&self) -> Result<&[Container], PlatformError> {
        self.containers
            .as_deref()
            .ok_or_else(|| PlatformError::NoContainers(self.id.clone()))
    }
}

/// A new definition (manifest bytes) for one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub service_id: ServiceId,
    pub new_definition: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum PlatformError {
    /// Some definitions failed to apply; the others went through
    #[error("{}", format_apply_errors(.0))]
    Apply(BTreeMap<ServiceId, String>),

    #[error("cannot reach platform: {0}")]
    Connection(String),

    #[error("no container information for {0}")]
    NoContainers(ServiceId),

    #[error("invalid service id {0:?}: expected <namespace>/<name>")]
    InvalidServiceId(String),

    #[error("{0}")]
    Other(String),
}

fn format_apply_errors(errors: &BTreeMap<ServiceId, String>) -> String {
    let parts: Vec<String> = errors
        .iter()
        .map(|(id, err)| format!("{}: {}", id, err))
        .collect();
    format!("failed to apply {} service(s): {}", errors.len(), parts.join("; "))
}

/// Connector to the platform running the services
#[async_trait]
pub trait Platform: Send + Sync {
    /// Apply new definitions. A partial failure is reported as
    /// [`PlatformError::Apply`] keyed by service.
    async fn apply(&self, defs: Vec<ServiceDefinition>) -> Result<(), PlatformError>;

    /// Every service, optionally limited to one namespace, minus `ignored`
    async fn all_services(
        &self,
        namespace: Option<&str>,
        ignored: &ServiceIdSet,
    ) -> Result<Vec<Service>, PlatformError>;

    /// The named services that exist; unknown ids are left out
    async fn some_services(&self, ids: &[ServiceId]) -> Result<Vec<Service>, PlatformError>;

    async fn ping(&self) -> Result<(), PlatformError>;

    async fn version(&self) -> Result<String, PlatformError>;
}
