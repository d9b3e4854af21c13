use super::remote::{Remote, RemoteFactory};
use super::{RegistryClient, RegistryError};
use crate::image::{newest_first, ImageDescription, ImageId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::debug;

/// Registry client resolving every tag of a repository concurrently
pub struct Client {
    factory: Arc<dyn RemoteFactory>,
}

impl Client {
    pub fn new(factory: Arc<dyn RemoteFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl RegistryClient for Client {
    async fn get_repository(
        &self,
        repository: &ImageId,
    ) -> Result<Vec<ImageDescription>, RegistryError> {
        let remote = self.factory.create(repository)?;

        let tags = match remote.tags().await {
            Ok(tags) => tags,
            Err(err) => {
                remote.cancel();
                return Err(err);
            }
        };
        debug!(repository = %repository.repository(), tags = tags.len(), "Resolving tags");

        let result = lookup_tags(remote.clone(), tags).await;
        remote.cancel();
        result
    }

    async fn get_image(&self, image: &ImageId) -> Result<ImageDescription, RegistryError> {
        let remote = self.factory.create(image)?;
        let result = remote.lookup().await;
        remote.cancel();
        result
    }
}

/// One task per tag. The first failure cancels the remote and drains the
/// remaining tasks before it is returned.
async fn lookup_tags(
    remote: Arc<dyn Remote>,
    tags: Vec<String>,
) -> Result<Vec<ImageDescription>, RegistryError> {
    let mut tasks = JoinSet::new();
    for tag in tags {
        let remote = remote.clone();
        tasks.spawn(async move { remote.lookup_tag(&tag).await });
    }

    let mut images = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(RegistryError::from).and_then(|r| r) {
            Ok(image) => images.push(image),
            Err(err) => {
                remote.cancel();
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                return Err(err);
            }
        }
    }

    images.sort_by(newest_first);
    Ok(images)
}
