use super::remote::{Remote, RemoteFactory};
use super::{RegistryClient, RegistryError};
use crate::image::{ImageDescription, ImageId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const KIND_TAGS: &str = "tags";
const KIND_METADATA: &str = "metadata";

fn record<T>(repository: &str, kind: &str, start: Instant, result: &Result<T, RegistryError>) {
    debug!(
        repository = %repository,
        request_kind = kind,
        duration_ms = start.elapsed().as_millis() as u64,
        success = result.is_ok(),
        "Registry request finished"
    );
}

/// Logs the duration and outcome of every client call
pub struct InstrumentedClient<C> {
    inner: C,
}

impl<C> InstrumentedClient<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<C: RegistryClient> RegistryClient for InstrumentedClient<C> {
    async fn get_repository(
        &self,
        repository: &ImageId,
    ) -> Result<Vec<ImageDescription>, RegistryError> {
        let start = Instant::now();
        let result = self.inner.get_repository(repository).await;
        debug!(
            repository = %repository.repository(),
            duration_ms = start.elapsed().as_millis() as u64,
            success = result.is_ok(),
            images = result.as_ref().map(|r| r.len()).unwrap_or(0),
            "Fetched repository"
        );
        result
    }

    async fn get_image(&self, image: &ImageId) -> Result<ImageDescription, RegistryError> {
        let start = Instant::now();
        let result = self.inner.get_image(image).await;
        debug!(
            image = %image,
            duration_ms = start.elapsed().as_millis() as u64,
            success = result.is_ok(),
            "Fetched image"
        );
        result
    }
}

/// Wraps every remote it creates in an [`InstrumentedRemote`]
pub struct InstrumentedRemoteFactory<F> {
    inner: F,
}

impl<F> InstrumentedRemoteFactory<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F: RemoteFactory> RemoteFactory for InstrumentedRemoteFactory<F> {
    fn create(&self, id: &ImageId) -> Result<Arc<dyn Remote>, RegistryError> {
        let inner = self.inner.create(id)?;
        Ok(Arc::new(InstrumentedRemote {
            inner,
            repository: id.repository(),
        }))
    }
}

pub struct InstrumentedRemote {
    inner: Arc<dyn Remote>,
    repository: String,
}

#[async_trait]
impl Remote for InstrumentedRemote {
    async fn tags(&self) -> Result<Vec<String>, RegistryError> {
        let start = Instant::now();
        let result = self.inner.tags().await;
        record(&self.repository, KIND_TAGS, start, &result);
        result
    }

    async fn lookup_tag(&self, tag: &str) -> Result<ImageDescription, RegistryError> {
        let start = Instant::now();
        let result = self.inner.lookup_tag(tag).await;
        record(&self.repository, KIND_METADATA, start, &result);
        result
    }

    async fn lookup(&self) -> Result<ImageDescription, RegistryError> {
        let start = Instant::now();
        let result = self.inner.lookup().await;
        record(&self.repository, KIND_METADATA, start, &result);
        result
    }

    fn cancel(&self) {
        self.inner.cancel();
    }
}
