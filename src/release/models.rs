use super::{ReleaseError, ReleaseStatus};
use crate::image::ImageId;
use crate::platform::ServiceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const IMAGE_SPEC_LATEST: &str = "<all latest>";
pub const IMAGE_SPEC_NONE: &str = "<no updates>";
pub const SERVICE_SPEC_ALL: &str = "<all>";

/// Which images to release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ImageSpec {
    /// The latest releasable image of every repository in use
    Latest,
    /// Keep the images; re-apply what is committed
    None,
    Exact(ImageId),
}

impl ImageSpec {
    pub fn parse(s: &str) -> Result<Self, ReleaseError> {
        match s {
            IMAGE_SPEC_LATEST => Ok(ImageSpec::Latest),
            IMAGE_SPEC_NONE => Ok(ImageSpec::None),
            other => ImageId::parse(other)
                .map(ImageSpec::Exact)
                .map_err(|e| ReleaseError::InvalidImage {
                    image: other.to_string(),
                    reason: e.to_string(),
                }),
        }
    }
}

impl fmt::Display for ImageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSpec::Latest => f.write_str(IMAGE_SPEC_LATEST),
            ImageSpec::None => f.write_str(IMAGE_SPEC_NONE),
            ImageSpec::Exact(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for ImageSpec {
    type Err = ReleaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageSpec {
    type Error = ReleaseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageSpec> for String {
    fn from(spec: ImageSpec) -> Self {
        spec.to_string()
    }
}

/// Which services to release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ServiceSpec {
    All,
    Service(ServiceId),
}

impl ServiceSpec {
    pub fn parse(s: &str) -> Result<Self, ReleaseError> {
        if s == SERVICE_SPEC_ALL {
            return Ok(ServiceSpec::All);
        }
        ServiceId::parse(s)
            .map(ServiceSpec::Service)
            .map_err(|e| ReleaseError::InvalidServiceSpec {
                spec: s.to_string(),
                reason: e.to_string(),
            })
    }
}

impl fmt::Display for ServiceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceSpec::All => f.write_str(SERVICE_SPEC_ALL),
            ServiceSpec::Service(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for ServiceSpec {
    type Err = ReleaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServiceSpec {
    type Error = ReleaseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ServiceSpec> for String {
    fn from(spec: ServiceSpec) -> Self {
        spec.to_string()
    }
}

/// Dry run or the real thing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseKind {
    #[default]
    Plan,
    Execute,
}

impl fmt::Display for ReleaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseKind::Plan => f.write_str("plan"),
            ReleaseKind::Execute => f.write_str("execute"),
        }
    }
}

impl FromStr for ReleaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(ReleaseKind::Plan),
            "execute" => Ok(ReleaseKind::Execute),
            other => Err(format!(
                "invalid release kind {:?}: expected plan or execute",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub image_spec: ImageSpec,
    pub service_specs: Vec<ServiceSpec>,
    #[serde(default)]
    pub excludes: Vec<ServiceId>,
    #[serde(default)]
    pub kind: ReleaseKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseType {
    ReleaseAllToLatest,
    ReleaseAllWithoutUpdate,
    ReleaseAllForImage,
    ReleaseOneToLatest,
    ReleaseOneWithoutUpdate,
    ReleaseOne,
}

impl ReleaseType {
    pub fn select(all_services: bool, image_spec: &ImageSpec) -> Self {
        match (all_services, image_spec) {
            (true, ImageSpec::Latest) => ReleaseType::ReleaseAllToLatest,
            (true, ImageSpec::None) => ReleaseType::ReleaseAllWithoutUpdate,
            (true, ImageSpec::Exact(_)) => ReleaseType::ReleaseAllForImage,
            (false, ImageSpec::Latest) => ReleaseType::ReleaseOneToLatest,
            (false, ImageSpec::None) => ReleaseType::ReleaseOneWithoutUpdate,
            (false, ImageSpec::Exact(_)) => ReleaseType::ReleaseOne,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseType::ReleaseAllToLatest => "release_all_to_latest",
            ReleaseType::ReleaseAllWithoutUpdate => "release_all_without_update",
            ReleaseType::ReleaseAllForImage => "release_all_for_image",
            ReleaseType::ReleaseOneToLatest => "release_one_to_latest",
            ReleaseType::ReleaseOneWithoutUpdate => "release_one_without_update",
            ReleaseType::ReleaseOne => "release_one",
        }
    }

    /// Whether the release rewrites manifests or re-applies them as committed
    pub fn updates_images(&self) -> bool {
        !matches!(
            self,
            ReleaseType::ReleaseAllWithoutUpdate | ReleaseType::ReleaseOneWithoutUpdate
        )
    }
}

impl fmt::Display for ReleaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerUpdate {
    pub container: String,
    pub current: ImageId,
    pub target: ImageId,
}

impl fmt::Display for ContainerUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} -> {})", self.container, self.current, self.target)
    }
}

/// What an action does; executable behaviour lives in [`ActionKind::run`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ActionKind {
    /// Informational only
    Note,
    Clone,
    FindManifest {
        service: ServiceId,
    },
    UpdateManifest {
        service: ServiceId,
        updates: Vec<ContainerUpdate>,
    },
    CommitAndPush {
        message: String,
    },
    ReleaseServices {
        services: Vec<ServiceId>,
        message: String,
    },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Note => "note",
            ActionKind::Clone => "clone",
            ActionKind::FindManifest { .. } => "find_manifest",
            ActionKind::UpdateManifest { .. } => "update_manifest",
            ActionKind::CommitAndPush { .. } => "commit_and_push",
            ActionKind::ReleaseServices { .. } => "release_services",
        }
    }
}

/// One step of a release plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAction {
    pub description: String,
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Set once the action ran; `"Failed: <err>"` if it failed
    #[serde(default)]
    pub result: Option<String>,
}

impl ReleaseAction {
    fn new(description: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            description: description.into(),
            kind,
            result: None,
        }
    }

    pub fn note(message: impl Into<String>) -> Self {
        Self::new(message, ActionKind::Note)
    }

    pub fn clone_repo() -> Self {
        Self::new("Clone the config repo.", ActionKind::Clone)
    }

    pub fn find_manifest(service: ServiceId) -> Self {
        Self::new(
            format!("Load the manifest file for service {}", service),
            ActionKind::FindManifest { service },
        )
    }

    pub fn update_manifest(service: ServiceId, updates: Vec<ContainerUpdate>) -> Self {
        let list: Vec<String> = updates.iter().map(ContainerUpdate::to_string).collect();
        Self::new(
            format!(
                "Update {} image(s) in the manifest file for {}: {}.",
                updates.len(),
                service,
                list.join(", ")
            ),
            ActionKind::UpdateManifest { service, updates },
        )
    }

    pub fn commit_and_push(message: impl Into<String>) -> Self {
        Self::new(
            "Commit and push the config repo.",
            ActionKind::CommitAndPush {
                message: message.into(),
            },
        )
    }

    pub fn release_services(services: Vec<ServiceId>, message: impl Into<String>) -> Self {
        let names: Vec<&str> = services.iter().map(ServiceId::as_str).collect();
        Self::new(
            format!("Release {} service(s): {}.", services.len(), names.join(", ")),
            ActionKind::ReleaseServices {
                services,
                message: message.into(),
            },
        )
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseOutcome {
    pub id: Uuid,
    pub release_type: ReleaseType,
    pub actions: Vec<ReleaseAction>,
    pub status: ReleaseStatus,
}
