use super::ReleaseError;
use crate::events::EventWriter;
use crate::git::ConfigRepo;
use crate::image::{ImageId, ImageMap};
use crate::manifest::ManifestEditor;
use crate::platform::{Platform, PlatformError, Service, ServiceDefinition, ServiceId};
use crate::registry::{RegistryClient, RegistryError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything a release talks to
#[derive(Clone)]
pub struct ReleaseEnv {
    pub platform: Arc<dyn Platform>,
    pub registry: Arc<dyn RegistryClient>,
    pub repo: Arc<dyn ConfigRepo>,
    pub manifests: Arc<dyn ManifestEditor>,
    pub events: Arc<dyn EventWriter>,
    namespace: Option<String>,
    self_service_names: Vec<String>,
}

impl ReleaseEnv {
    pub fn new(
        platform: Arc<dyn Platform>,
        registry: Arc<dyn RegistryClient>,
        repo: Arc<dyn ConfigRepo>,
        manifests: Arc<dyn ManifestEditor>,
        events: Arc<dyn EventWriter>,
    ) -> Self {
        Self {
            platform,
            registry,
            repo,
            manifests,
            events,
            namespace: None,
            self_service_names: vec!["rollout".to_string()],
        }
    }

    /// Restrict "all services" to one namespace
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_self_service_names(mut self, names: Vec<String>) -> Self {
        self.self_service_names = names;
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Whether applying this service would restart the running process
    pub fn is_self_service(&self, id: &ServiceId) -> bool {
        self.self_service_names.iter().any(|n| n == id.name())
    }

    /// Live metadata for every repository used by the given services
    ///
    /// Each repository is fetched once, however many containers use it.
    /// Containers with unparseable images and services without container
    /// information contribute nothing.
    pub async fn collect_available_images(
        &self,
        services: &[Service],
    ) -> Result<ImageMap, ReleaseError> {
        let mut repositories: BTreeMap<String, ImageId> = BTreeMap::new();
        for service in services {
            let Some(containers) = &service.containers else {
                continue;
            };
            for container in containers {
                match ImageId::parse(&container.image) {
                    Ok(id) => {
                        repositories.entry(id.repository()).or_insert(id);
                    }
                    Err(e) => {
                        debug!(service = %service.id, container = %container.name, error = %e, "Skipping unparseable image");
                    }
                }
            }
        }

        let mut images = ImageMap::new();
        for (repository, id) in repositories {
            let found = self.registry.get_repository(&id).await?;
            debug!(repository = %repository, count = found.len(), "Fetched repository metadata");
            images.insert(repository, found);
        }
        Ok(images)
    }

    /// Image map holding exactly the requested images, each verified to
    /// exist in its registry
    pub async fn exact_images(&self, images: &[ImageId]) -> Result<ImageMap, ReleaseError> {
        let mut by_repository: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for id in images {
            let invalid = |reason: String| ReleaseError::InvalidImage {
                image: id.to_string(),
                reason,
            };
            match self.registry.get_image(id).await {
                Ok(description) if &description.id == id => {
                    by_repository
                        .entry(id.repository())
                        .or_default()
                        .push(description);
                }
                Ok(_) | Err(RegistryError::NotFound(_)) => {
                    return Err(invalid(format!("image {:?} does not exist", id.to_string())));
                }
                Err(e) => return Err(invalid(e.to_string())),
            }
        }
        Ok(by_repository.into_iter().collect())
    }

    /// `false` when the registry does not know the image
    pub async fn image_exists(&self, id: &ImageId) -> Result<bool, RegistryError> {
        match self.registry.get_image(id).await {
            Ok(description) => Ok(&description.id == id),
            Err(RegistryError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn platform_apply(&self, defs: Vec<ServiceDefinition>) -> Result<(), PlatformError> {
        let count = defs.len();
        let start = Instant::now();
        let result = self.platform.apply(defs).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => info!(count, duration_ms, success = true, "Applied service definitions"),
            Err(e) => warn!(count, duration_ms, success = false, error = %e, "Applying service definitions failed"),
        }
        result
    }

    pub async fn ping(&self) -> Result<(), PlatformError> {
        self.platform.ping().await
    }

    pub async fn version(&self) -> Result<String, PlatformError> {
        self.platform.version().await
    }
}
