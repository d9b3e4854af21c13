use super::ReleaseError;
use crate::git::ConfigRepo;
use crate::platform::ServiceId;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Scratch state for one release: a working directory for the config repo
/// checkout and the manifests gathered for the final apply. The directory
/// is removed when the context is dropped.
pub struct ReleaseContext {
    dir: TempDir,
    cloned: bool,
    manifests: BTreeMap<ServiceId, Vec<u8>>,
}

impl ReleaseContext {
    pub fn new() -> Result<Self, ReleaseError> {
        let dir = tempfile::Builder::new()
            .prefix("rollout-release-")
            .tempdir()?;
        debug!(dir = %dir.path().display(), "Created release working directory");
        Ok(Self {
            dir,
            cloned: false,
            manifests: BTreeMap::new(),
        })
    }

    pub fn working_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn is_cloned(&self) -> bool {
        self.cloned
    }

    /// Manifest directory inside the checkout
    pub fn repo_path(&self, repo: &dyn ConfigRepo) -> PathBuf {
        repo.checkout_path(self.dir.path())
    }

    pub async fn clone_repo(&mut self, repo: &dyn ConfigRepo) -> Result<(), ReleaseError> {
        repo.checkout_to(self.dir.path())
            .await
            .map_err(ReleaseError::Repo)?;
        self.cloned = true;
        Ok(())
    }

    pub async fn commit_and_push(
        &self,
        repo: &dyn ConfigRepo,
        message: &str,
    ) -> Result<String, ReleaseError> {
        repo.commit_and_push(self.dir.path(), message)
            .await
            .map_err(ReleaseError::Repo)
    }

    pub fn insert_manifest(&mut self, service: ServiceId, definition: Vec<u8>) {
        self.manifests.insert(service, definition);
    }

    pub fn manifest(&self, service: &ServiceId) -> Option<&[u8]> {
        self.manifests.get(service).map(Vec::as_slice)
    }

    pub fn manifests(&self) -> &BTreeMap<ServiceId, Vec<u8>> {
        &self.manifests
    }
}
