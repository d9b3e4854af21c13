//! In-memory collaborators for release tests

use super::{ReleaseEnv, Releaser};
use crate::events::recording::RecordingEventWriter;
use crate::git::ConfigRepo;
use crate::image::{ImageDescription, ImageId};
use crate::manifest::YamlManifests;
use crate::platform::{
    Container, Platform, PlatformError, Service, ServiceDefinition, ServiceId, ServiceIdSet,
};
use crate::registry::mock::MockRegistry;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub(crate) fn image(reference: &str, created_secs: i64) -> ImageDescription {
    ImageDescription::new(
        ImageId::parse(reference).unwrap(),
        Utc.timestamp_opt(created_secs, 0).single(),
    )
}

pub(crate) fn service(id: &str, containers: &[(&str, &str)]) -> Service {
    Service::new(
        ServiceId::parse(id).unwrap(),
        containers
            .iter()
            .map(|(name, image)| Container {
                name: name.to_string(),
                image: image.to_string(),
            })
            .collect(),
    )
}

/// A single-container Deployment manifest
pub(crate) fn deployment(namespace: &str, name: &str, image: &str) -> String {
    format!(
        "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {name}\n  namespace: {namespace}\nspec:\n  template:\n    spec:\n      containers:\n        - name: {name}\n          image: {image}\n"
    )
}

/// Platform over a fixed service list that records every apply call
#[derive(Default)]
pub(crate) struct FakePlatform {
    services: Vec<Service>,
    failing: BTreeMap<ServiceId, String>,
    fail_all: Option<String>,
    hanging: Option<ServiceId>,
    applied: Mutex<Vec<Vec<ServiceDefinition>>>,
}

impl FakePlatform {
    pub(crate) fn new(services: Vec<Service>) -> Self {
        Self {
            services,
            ..Default::default()
        }
    }

    /// Report a per-service failure when this service is applied
    pub(crate) fn failing_service(mut self, id: &str, error: &str) -> Self {
        self.failing
            .insert(ServiceId::parse(id).unwrap(), error.to_string());
        self
    }

    /// Fail every apply call without per-service detail
    pub(crate) fn failing_apply(mut self, error: &str) -> Self {
        self.fail_all = Some(error.to_string());
        self
    }

    /// Never return from an apply call that includes this service
    pub(crate) fn hanging_service(mut self, id: &str) -> Self {
        self.hanging = Some(ServiceId::parse(id).unwrap());
        self
    }

    pub(crate) fn applied(&self) -> Vec<Vec<ServiceDefinition>> {
        self.applied.lock().unwrap().clone()
    }

    pub(crate) fn applied_ids(&self) -> Vec<Vec<String>> {
        self.applied()
            .iter()
            .map(|defs| defs.iter().map(|d| d.service_id.to_string()).collect())
            .collect()
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn apply(&self, defs: Vec<ServiceDefinition>) -> Result<(), PlatformError> {
        self.applied.lock().unwrap().push(defs.clone());
        if defs.iter().any(|d| Some(&d.service_id) == self.hanging.as_ref()) {
            std::future::pending::<()>().await;
        }
        if let Some(error) = &self.fail_all {
            return Err(PlatformError::Other(error.clone()));
        }
        let errors: BTreeMap<ServiceId, String> = defs
            .iter()
            .filter_map(|d| {
                self.failing
                    .get(&d.service_id)
                    .map(|e| (d.service_id.clone(), e.clone()))
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PlatformError::Apply(errors))
        }
    }

    async fn all_services(
        &self,
        namespace: Option<&str>,
        ignored: &ServiceIdSet,
    ) -> Result<Vec<Service>, PlatformError> {
        let mut services: Vec<Service> = self
            .services
            .iter()
            .filter(|s| namespace.is_none_or(|ns| s.id.namespace() == ns))
            .filter(|s| !ignored.contains(&s.id))
            .cloned()
            .collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(services)
    }

    async fn some_services(&self, ids: &[ServiceId]) -> Result<Vec<Service>, PlatformError> {
        Ok(self
            .services
            .iter()
            .filter(|s| ids.contains(&s.id))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn version(&self) -> Result<String, PlatformError> {
        Ok("fake".to_string())
    }
}

/// Config repo that lays out fixture files on clone and records commits
#[derive(Default)]
pub(crate) struct FakeRepo {
    path: String,
    files: Vec<(String, String)>,
    fail_clone: bool,
    fail_push: bool,
    push_output: String,
    commits: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl FakeRepo {
    /// `path` is the manifest directory inside the checkout
    pub(crate) fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Default::default()
        }
    }

    /// `rel` is relative to the checkout root
    pub(crate) fn with_file(mut self, rel: &str, contents: &str) -> Self {
        self.files.push((rel.to_string(), contents.to_string()));
        self
    }

    pub(crate) fn failing_clone(mut self) -> Self {
        self.fail_clone = true;
        self
    }

    pub(crate) fn failing_push(mut self) -> Self {
        self.fail_push = true;
        self
    }

    pub(crate) fn with_push_output(mut self, output: &str) -> Self {
        self.push_output = output.to_string();
        self
    }

    /// Commit messages with the fixture files as they were committed
    pub(crate) fn commits(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.commits.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfigRepo for FakeRepo {
    async fn checkout_to(&self, dir: &Path) -> Result<()> {
        if self.fail_clone {
            bail!("repository not reachable");
        }
        fs::create_dir_all(dir.join(&self.path))?;
        for (rel, contents) in &self.files {
            let path = dir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, contents)?;
        }
        Ok(())
    }

    fn checkout_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.path)
    }

    async fn commit_and_push(&self, dir: &Path, message: &str) -> Result<String> {
        if self.fail_push {
            bail!("push rejected");
        }
        let mut snapshot = BTreeMap::new();
        for (rel, _) in &self.files {
            snapshot.insert(rel.clone(), fs::read_to_string(dir.join(rel))?);
        }
        self.commits
            .lock()
            .unwrap()
            .push((message.to_string(), snapshot));
        Ok(self.push_output.clone())
    }
}

/// Handles on every collaborator of a test releaser
pub(crate) struct Harness {
    pub(crate) platform: Arc<FakePlatform>,
    pub(crate) repo: Arc<FakeRepo>,
    pub(crate) events: Arc<RecordingEventWriter>,
    pub(crate) releaser: Releaser,
}

pub(crate) fn harness(platform: FakePlatform, registry: Arc<MockRegistry>, repo: FakeRepo) -> Harness {
    let platform = Arc::new(platform);
    let repo = Arc::new(repo);
    let events = Arc::new(RecordingEventWriter::default());
    let env = ReleaseEnv::new(
        platform.clone(),
        registry,
        repo.clone(),
        Arc::new(YamlManifests::new()),
        events.clone(),
    );
    Harness {
        platform,
        repo,
        events,
        releaser: Releaser::new(env),
    }
}

pub(crate) fn releaser(platform: FakePlatform, registry: Arc<MockRegistry>, repo: FakeRepo) -> Releaser {
    harness(platform, registry, repo).releaser
}

pub(crate) fn env_with(registry: Arc<MockRegistry>, services: Vec<Service>) -> ReleaseEnv {
    releaser(FakePlatform::new(services), registry, FakeRepo::new("k8s"))
        .env()
        .clone()
}
