use super::{ImageSpec, ReleaseEnv, ReleaseError, ServiceSpec};
use crate::image::{ImageId, ImageMap};
use crate::platform::{Service, ServiceId, ServiceIdSet};
use std::fmt;

/// Which images a release moves services to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSelector {
    AllLatest,
    /// Keep whatever the committed config says
    LatestConfig,
    Exactly(Vec<ImageId>),
}

impl ImageSelector {
    pub fn for_spec(spec: &ImageSpec) -> Self {
        match spec {
            ImageSpec::Latest => ImageSelector::AllLatest,
            ImageSpec::None => ImageSelector::LatestConfig,
            ImageSpec::Exact(id) => ImageSelector::Exactly(vec![id.clone()]),
        }
    }

    pub async fn select_images(
        &self,
        env: &ReleaseEnv,
        services: &[Service],
    ) -> Result<ImageMap, ReleaseError> {
        match self {
            ImageSelector::AllLatest => env.collect_available_images(services).await,
            ImageSelector::LatestConfig => Ok(ImageMap::new()),
            ImageSelector::Exactly(images) => env.exact_images(images).await,
        }
    }
}

impl fmt::Display for ImageSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSelector::AllLatest => f.write_str("latest images"),
            ImageSelector::LatestConfig => f.write_str("latest config"),
            ImageSelector::Exactly(images) => {
                let names: Vec<String> = images.iter().map(ImageId::to_string).collect();
                f.write_str(&names.join(", "))
            }
        }
    }
}

/// Which services a release touches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSelector {
    all: bool,
    include: ServiceIdSet,
    exclude: ServiceIdSet,
}

impl ServiceSelector {
    pub fn for_specs(specs: &[ServiceSpec], excludes: &[ServiceId]) -> Result<Self, ReleaseError> {
        if specs.is_empty() {
            return Err(ReleaseError::InvalidServiceSpec {
                spec: String::new(),
                reason: "no services given".to_string(),
            });
        }

        let mut all = false;
        let mut include = ServiceIdSet::new();
        for spec in specs {
            match spec {
                ServiceSpec::All => all = true,
                ServiceSpec::Service(id) => {
                    include.insert(id.clone());
                }
            }
        }
        if all {
            include.clear();
        }

        Ok(Self {
            all,
            include,
            exclude: excludes.iter().cloned().collect(),
        })
    }

    pub fn is_all(&self) -> bool {
        self.all
    }

    pub async fn select_services(&self, env: &ReleaseEnv) -> Result<Vec<Service>, ReleaseError> {
        if self.all {
            return Ok(env
                .platform
                .all_services(env.namespace(), &self.exclude)
                .await?);
        }

        let ids: Vec<ServiceId> = self.include.difference(&self.exclude).cloned().collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(env.platform.some_services(&ids).await?)
    }
}

impl fmt::Display for ServiceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.all {
            return f.write_str("all services");
        }
        let ids: Vec<&str> = self.include.iter().map(ServiceId::as_str).collect();
        f.write_str(&ids.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::fakes::{env_with, image, service};
    use crate::registry::mock::MockRegistry;
    use std::sync::Arc;

    fn id(s: &str) -> ServiceId {
        ServiceId::parse(s).unwrap()
    }

    #[test]
    fn test_image_selector_descriptions() {
        assert_eq!(ImageSelector::for_spec(&ImageSpec::Latest).to_string(), "latest images");
        assert_eq!(ImageSelector::for_spec(&ImageSpec::None).to_string(), "latest config");
        let exact = ImageSelector::Exactly(vec![
            ImageId::parse("lib/app:v3").unwrap(),
            ImageId::parse("lib/db:v1").unwrap(),
        ]);
        assert_eq!(exact.to_string(), "lib/app:v3, lib/db:v1");
    }

    #[test]
    fn test_service_selector_all_wins() {
        let selector = ServiceSelector::for_specs(
            &[ServiceSpec::Service(id("default/a")), ServiceSpec::All],
            &[],
        )
        .unwrap();
        assert!(selector.is_all());
        assert_eq!(selector.to_string(), "all services");
    }

    #[test]
    fn test_service_selector_requires_specs() {
        assert!(matches!(
            ServiceSelector::for_specs(&[], &[]),
            Err(ReleaseError::InvalidServiceSpec { .. })
        ));
    }

    #[tokio::test]
    async fn test_select_services_honours_excludes() {
        let env = env_with(
            Arc::new(MockRegistry::new(vec![])),
            vec![
                service("default/a", &[("app", "lib/app:v2")]),
                service("default/b", &[("app", "lib/app:v2")]),
                service("prod/c", &[("app", "lib/app:v2")]),
            ],
        );

        let all = ServiceSelector::for_specs(&[ServiceSpec::All], &[id("default/b")]).unwrap();
        let selected: Vec<String> = all
            .select_services(&env)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(selected, vec!["default/a", "prod/c"]);

        let some = ServiceSelector::for_specs(
            &[ServiceSpec::Service(id("default/a")), ServiceSpec::Service(id("default/b"))],
            &[id("default/a")],
        )
        .unwrap();
        assert_eq!(some.to_string(), "default/a, default/b");
        let selected = some.select_services(&env).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, id("default/b"));
    }

    #[tokio::test]
    async fn test_latest_config_selects_nothing() {
        let registry = Arc::new(MockRegistry::new(vec![image("lib/app:v3", 300)]));
        let env = env_with(registry.clone(), vec![]);
        let services = vec![service("default/a", &[("app", "lib/app:v2")])];

        let images = ImageSelector::LatestConfig
            .select_images(&env, &services)
            .await
            .unwrap();
        assert!(images.is_empty());
        assert!(registry.repository_calls().is_empty());
    }
}
