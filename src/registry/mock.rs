//! In-memory registry doubles for tests

use super::remote::{Remote, RemoteFactory};
use super::transport::{RegistryRequest, RegistryResponse, Transport};
use super::{RegistryClient, RegistryError};
use crate::image::{newest_first, ImageDescription, ImageId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type RoundTripFn =
    dyn Fn(RegistryRequest) -> Result<RegistryResponse, RegistryError> + Send + Sync;

/// Transport answering every request with a closure
pub(crate) struct FnTransport {
    f: Box<RoundTripFn>,
}

impl FnTransport {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: Fn(RegistryRequest) -> Result<RegistryResponse, RegistryError> + Send + Sync + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl Transport for FnTransport {
    async fn round_trip(&self, request: RegistryRequest) -> Result<RegistryResponse, RegistryError> {
        (self.f)(request)
    }
}

/// A remote whose tags map to fixed creation times. Tags added with
/// `with_tag` are listed but fail lookup with `NotFound`.
pub(crate) struct MockRemote {
    id: ImageId,
    tags: Vec<String>,
    images: BTreeMap<String, Option<DateTime<Utc>>>,
    fail_tags: bool,
    cancelled: AtomicBool,
}

impl MockRemote {
    pub(crate) fn new(repository: &str) -> Self {
        Self {
            id: ImageId::parse(repository).unwrap(),
            tags: Vec::new(),
            images: BTreeMap::new(),
            fail_tags: false,
            cancelled: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_image(mut self, tag: &str, created_at: Option<DateTime<Utc>>) -> Self {
        self.tags.push(tag.to_string());
        self.images.insert(tag.to_string(), created_at);
        self
    }

    pub(crate) fn with_tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    pub(crate) fn failing_tags(mut self) -> Self {
        self.fail_tags = true;
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Remote for MockRemote {
    async fn tags(&self) -> Result<Vec<String>, RegistryError> {
        if self.fail_tags {
            return Err(RegistryError::Status {
                status: 500,
                url: self.id.repository(),
            });
        }
        Ok(self.tags.clone())
    }

    async fn lookup_tag(&self, tag: &str) -> Result<ImageDescription, RegistryError> {
        if self.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        match self.images.get(tag) {
            Some(created_at) => Ok(ImageDescription::new(self.id.with_tag(tag), *created_at)),
            None => Err(RegistryError::NotFound(self.id.with_tag(tag).to_string())),
        }
    }

    async fn lookup(&self) -> Result<ImageDescription, RegistryError> {
        let tag = self.id.tag().unwrap_or(crate::image::MOVING_TAG).to_string();
        self.lookup_tag(&tag).await
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Hands out one shared [`MockRemote`] for every image id, re-pointed at the
/// requested tag
pub(crate) struct MockRemoteFactory {
    remote: Arc<MockRemote>,
}

impl MockRemoteFactory {
    pub(crate) fn new(remote: Arc<MockRemote>) -> Self {
        Self { remote }
    }
}

struct TaggedRemote {
    remote: Arc<MockRemote>,
    tag: Option<String>,
}

#[async_trait]
impl Remote for TaggedRemote {
    async fn tags(&self) -> Result<Vec<String>, RegistryError> {
        self.remote.tags().await
    }

    async fn lookup_tag(&self, tag: &str) -> Result<ImageDescription, RegistryError> {
        self.remote.lookup_tag(tag).await
    }

    async fn lookup(&self) -> Result<ImageDescription, RegistryError> {
        let tag = self.tag.clone().unwrap_or_else(|| crate::image::MOVING_TAG.to_string());
        self.remote.lookup_tag(&tag).await
    }

    fn cancel(&self) {
        self.remote.cancel();
    }
}

impl RemoteFactory for MockRemoteFactory {
    fn create(&self, id: &ImageId) -> Result<Arc<dyn Remote>, RegistryError> {
        Ok(Arc::new(TaggedRemote {
            remote: self.remote.clone(),
            tag: id.tag().map(str::to_string),
        }))
    }
}

/// Registry client over a fixed set of images
#[derive(Default)]
pub(crate) struct MockRegistry {
    images: Vec<ImageDescription>,
    failing: HashSet<String>,
    repository_calls: Mutex<Vec<String>>,
}

impl MockRegistry {
    pub(crate) fn new(images: Vec<ImageDescription>) -> Self {
        Self {
            images,
            ..Default::default()
        }
    }

    /// Make lookups of this repository fail
    pub(crate) fn failing(mut self, repository: &str) -> Self {
        self.failing.insert(repository.to_string());
        self
    }

    pub(crate) fn repository_calls(&self) -> Vec<String> {
        self.repository_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistryClient for MockRegistry {
    async fn get_repository(
        &self,
        repository: &ImageId,
    ) -> Result<Vec<ImageDescription>, RegistryError> {
        let repository = repository.repository();
        self.repository_calls.lock().unwrap().push(repository.clone());
        if self.failing.contains(&repository) {
            return Err(RegistryError::Status {
                status: 503,
                url: repository,
            });
        }

        let mut images: Vec<ImageDescription> = self
            .images
            .iter()
            .filter(|i| i.id.repository() == repository)
            .cloned()
            .collect();
        images.sort_by(newest_first);
        Ok(images)
    }

    async fn get_image(&self, image: &ImageId) -> Result<ImageDescription, RegistryError> {
        if self.failing.contains(&image.repository()) {
            return Err(RegistryError::Status {
                status: 503,
                url: image.repository(),
            });
        }
        self.images
            .iter()
            .find(|i| &i.id == image)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(image.to_string()))
    }
}
