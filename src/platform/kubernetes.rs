use super::{
    Container, Platform, PlatformError, Service, ServiceDefinition, ServiceId, ServiceIdSet,
    DEFAULT_NAMESPACE,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Services are apps/v1 Deployments; definitions are applied with
/// server-side apply.
pub struct KubernetesPlatform {
    client: Client,
    field_manager: String,
}

impl KubernetesPlatform {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    /// Connect using in-cluster config or `~/.kube/config`
    pub async fn connect(field_manager: impl Into<String>) -> Result<Self> {
        // kube-rs needs a rustls crypto provider for HTTPS
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();

        let config = kube::Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?;
        let client = Client::try_from(config).context("Failed to create Kubernetes client")?;
        Ok(Self::new(client, field_manager))
    }

    fn deployments(&self, namespace: Option<&str>) -> Api<Deployment> {
        match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    async fn apply_one(&self, def: &ServiceDefinition) -> Result<(), String> {
        let (namespace, name) = def.service_id.components();
        let mut deployment = deployment_from_definition(&def.new_definition, name)?;
        deployment.metadata.namespace = Some(namespace.to_string());

        let patch_params = PatchParams::apply(&self.field_manager).force();
        let result = self
            .deployments(Some(namespace))
            .patch(name, &patch_params, &Patch::Apply(&deployment))
            .await
            .map_err(|e| e.to_string())?;

        info!(
            service = %def.service_id,
            resource_version = ?result.metadata.resource_version,
            "Deployment applied"
        );
        Ok(())
    }
}

/// Pick the Deployment called `name` out of a (possibly multi-document) manifest
fn deployment_from_definition(bytes: &[u8], name: &str) -> Result<Deployment, String> {
    for document in serde_yaml::Deserializer::from_slice(bytes) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| format!("invalid definition: {}", e))?;
        let is_match = value.get("kind").and_then(|k| k.as_str()) == Some("Deployment")
            && value
                .get("metadata")
                .and_then(|m| m.get("name"))
                .and_then(|n| n.as_str())
                == Some(name);
        if is_match {
            return serde_yaml::from_value(value)
                .map_err(|e| format!("invalid Deployment {}: {}", name, e));
        }
    }
    Err(format!("definition contains no Deployment named {}", name))
}

fn service_from_deployment(deployment: &Deployment) -> Option<Service> {
    let name = deployment.metadata.name.as_deref()?;
    let namespace = deployment
        .metadata
        .namespace
        .as_deref()
        .unwrap_or(DEFAULT_NAMESPACE);

    let containers = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|pod| {
            pod.containers
                .iter()
                .map(|c| Container {
                    name: c.name.clone(),
                    image: c.image.clone().unwrap_or_default(),
                })
                .collect()
        });

    Some(Service {
        id: ServiceId::make(namespace, name),
        containers,
    })
}

#[async_trait]
impl Platform for KubernetesPlatform {
    async fn apply(&self, defs: Vec<ServiceDefinition>) -> Result<(), PlatformError> {
        let mut errors = BTreeMap::new();
        for def in &defs {
            if let Err(err) = self.apply_one(def).await {
                warn!(service = %def.service_id, error = %err, "Failed to apply definition");
                errors.insert(def.service_id.clone(), err);
            }
        }

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
        let list = self
            .deployments(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| PlatformError::Connection(e.to_string()))?;

        let services: Vec<Service> = list
            .items
            .iter()
            .filter_map(service_from_deployment)
            .filter(|s| !ignored.contains(&s.id))
            .collect();
        debug!(count = services.len(), "Listed services");
        Ok(services)
    }

    async fn some_services(&self, ids: &[ServiceId]) -> Result<Vec<Service>, PlatformError> {
        let mut services = Vec::with_capacity(ids.len());
        for id in ids {
            let (namespace, name) = id.components();
            let found = self
                .deployments(Some(namespace))
                .get_opt(name)
                .await
                .map_err(|e| PlatformError::Connection(e.to_string()))?;
            match found.as_ref().and_then(service_from_deployment) {
                Some(service) => services.push(service),
                None => debug!(service = %id, "Service not found"),
            }
        }
        Ok(services)
    }

    async fn ping(&self) -> Result<(), PlatformError> {
        self.client
            .apiserver_version()
            .await
            .map(|_| ())
            .map_err(|e| PlatformError::Connection(e.to_string()))
    }

    async fn version(&self) -> Result<String, PlatformError> {
        let info = self
            .client
            .apiserver_version()
            .await
            .map_err(|e| PlatformError::Connection(e.to_string()))?;
        Ok(format!("kubernetes {}", info.git_version))
    }
}
