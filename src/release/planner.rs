use super::{
    calculate_updates, ImageSelector, ProgressSink, ReleaseAction, ReleaseError, ReleaseRequest,
    ReleaseType, Releaser, ServiceSelector,
};
use crate::platform::ServiceId;
use tracing::{debug, info};

const NO_SERVICES: &str = "No selected services found. Nothing to do.";
const NO_UPDATES: &str = "All selected services are running the requested images. Nothing to do.";

impl Releaser {
    /// Turn a request into an ordered list of actions
    ///
    /// Selection errors surface here, before anything is mutated.
    pub async fn plan(
        &self,
        request: &ReleaseRequest,
        progress: &dyn ProgressSink,
    ) -> Result<(ReleaseType, Vec<ReleaseAction>), ReleaseError> {
        let services = ServiceSelector::for_specs(&request.service_specs, &request.excludes)?;
        let images = ImageSelector::for_spec(&request.image_spec);
        let release_type = ReleaseType::select(services.is_all(), &request.image_spec);
        debug!(release_type = %release_type, "Planning release");

        let actions = if release_type.updates_images() {
            self.release_images(&images, &services, progress).await?
        } else {
            self.release_without_update(&images, &services).await?
        };
        Ok((release_type, actions))
    }

    async fn release_images(
        &self,
        image_selector: &ImageSelector,
        service_selector: &ServiceSelector,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<ReleaseAction>, ReleaseError> {
        let services = service_selector.select_services(&self.env).await?;
        if services.is_empty() {
            return Ok(vec![ReleaseAction::note(NO_SERVICES)]);
        }

        let images = image_selector.select_images(&self.env, &services).await?;
        let updates = calculate_updates(&services, &images, |diagnostic| {
            info!("{}", diagnostic);
            progress.report(&diagnostic);
        });
        if updates.is_empty() {
            return Ok(vec![ReleaseAction::note(NO_UPDATES)]);
        }

        let message = format!("Release {} to {}", image_selector, service_selector);
        let released: Vec<ServiceId> = updates.keys().cloned().collect();

        let mut actions = Vec::with_capacity(updates.len() + 4);
        actions.push(ReleaseAction::note(message.clone()));
        actions.push(ReleaseAction::clone_repo());
        for (service, service_updates) in updates {
            actions.push(ReleaseAction::update_manifest(service, service_updates));
        }
        actions.push(ReleaseAction::commit_and_push(message.clone()));
        actions.push(ReleaseAction::release_services(released, message));
        Ok(actions)
    }

    async fn release_without_update(
        &self,
        image_selector: &ImageSelector,
        service_selector: &ServiceSelector,
    ) -> Result<Vec<ReleaseAction>, ReleaseError> {
        let services = service_selector.select_services(&self.env).await?;
        if services.is_empty() {
            return Ok(vec![ReleaseAction::note(NO_SERVICES)]);
        }

        let message = format!("Release {} to {}", image_selector, service_selector);
        let mut ids: Vec<ServiceId> = services.into_iter().map(|s| s.id).collect();
        ids.sort();
        ids.dedup();

        let mut actions = Vec::with_capacity(ids.len() + 3);
        actions.push(ReleaseAction::note(message.clone()));
        actions.push(ReleaseAction::clone_repo());
        for id in &ids {
            actions.push(ReleaseAction::find_manifest(id.clone()));
        }
        actions.push(ReleaseAction::release_services(ids, message));
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::fakes::{image, releaser, service, FakePlatform, FakeRepo};
    use crate::release::{ActionKind, ImageSpec, ReleaseKind, ServiceSpec};
    use crate::registry::mock::MockRegistry;
    use std::sync::{Arc, Mutex};

    fn request(image_spec: &str, services: &[&str]) -> ReleaseRequest {
        ReleaseRequest {
            image_spec: ImageSpec::parse(image_spec).unwrap(),
            service_specs: services
                .iter()
                .map(|s| ServiceSpec::parse(s).unwrap())
                .collect(),
            excludes: vec![],
            kind: ReleaseKind::Plan,
        }
    }

    fn app_registry() -> Arc<MockRegistry> {
        Arc::new(MockRegistry::new(vec![
            image("lib/app:v3", 300),
            image("lib/app:latest", 310),
            image("lib/app:v2", 200),
        ]))
    }

    fn names(actions: &[ReleaseAction]) -> Vec<&'static str> {
        actions.iter().map(ReleaseAction::name).collect()
    }

    #[tokio::test]
    async fn test_plan_all_to_latest() {
        let platform = FakePlatform::new(vec![
            service("default/app", &[("app", "lib/app:v2")]),
            service("default/other", &[("app", "lib/app:v3")]),
        ]);
        let releaser = releaser(platform, app_registry(), FakeRepo::new("k8s"));
        let progress = Mutex::new(Vec::new());
        let sink = |m: &str| progress.lock().unwrap().push(m.to_string());

        let (release_type, actions) = releaser
            .plan(&request("<all latest>", &["<all>"]), &sink)
            .await
            .unwrap();

        assert_eq!(release_type, ReleaseType::ReleaseAllToLatest);
        assert_eq!(
            names(&actions),
            vec!["note", "clone", "update_manifest", "commit_and_push", "release_services"]
        );
        assert_eq!(actions[0].description, "Release latest images to all services");
        match &actions[2].kind {
            ActionKind::UpdateManifest { service, updates } => {
                assert_eq!(service.as_str(), "default/app");
                assert_eq!(updates[0].target.to_string(), "lib/app:v3");
            }
            other => panic!("unexpected action: {:?}", other),
        }
        match &actions[4].kind {
            ActionKind::ReleaseServices { services, message } => {
                assert_eq!(services, &vec![ServiceId::make("default", "app")]);
                assert_eq!(message, "Release latest images to all services");
            }
            other => panic!("unexpected action: {:?}", other),
        }
        assert!(actions.iter().all(|a| a.result.is_none()));

        // Diagnostics never become actions
        let progress = progress.into_inner().unwrap();
        assert_eq!(
            progress,
            vec!["Service default/other image lib/app:v3 is already the latest one; skipping."]
        );
    }

    #[tokio::test]
    async fn test_plan_without_services_is_one_note() {
        let releaser = releaser(FakePlatform::new(vec![]), app_registry(), FakeRepo::new("k8s"));

        for spec in ["<all latest>", "<no updates>", "lib/app:v3"] {
            let (_, actions) = releaser
                .plan(&request(spec, &["<all>"]), &|_: &str| {})
                .await
                .unwrap();
            assert_eq!(actions.len(), 1, "{}", spec);
            assert_eq!(actions[0].kind, ActionKind::Note);
            assert_eq!(actions[0].description, NO_SERVICES);
        }
    }

    #[tokio::test]
    async fn test_plan_without_updates_is_one_note() {
        let platform = FakePlatform::new(vec![service("default/app", &[("app", "lib/app:v3")])]);
        let releaser = releaser(platform, app_registry(), FakeRepo::new("k8s"));

        let (release_type, actions) = releaser
            .plan(&request("<all latest>", &["default/app"]), &|_: &str| {})
            .await
            .unwrap();
        assert_eq!(release_type, ReleaseType::ReleaseOneToLatest);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].description, NO_UPDATES);
    }

    #[tokio::test]
    async fn test_plan_without_update() {
        let platform = FakePlatform::new(vec![
            service("prod/b", &[("app", "lib/app:v2")]),
            service("default/a", &[("app", "lib/app:v2")]),
        ]);
        let registry = app_registry();
        let releaser = releaser(platform, registry.clone(), FakeRepo::new("k8s"));

        let (release_type, actions) = releaser
            .plan(&request("<no updates>", &["<all>"]), &|_: &str| {})
            .await
            .unwrap();

        assert_eq!(release_type, ReleaseType::ReleaseAllWithoutUpdate);
        assert_eq!(
            names(&actions),
            vec!["note", "clone", "find_manifest", "find_manifest", "release_services"]
        );
        assert_eq!(actions[0].description, "Release latest config to all services");
        assert_eq!(
            actions[2].description,
            "Load the manifest file for service default/a"
        );
        assert!(registry.repository_calls().is_empty());
    }

    #[tokio::test]
    async fn test_plan_exact_image() {
        let platform = FakePlatform::new(vec![service("default/app", &[("app", "lib/app:v2")])]);
        let releaser = releaser(platform, app_registry(), FakeRepo::new("k8s"));

        let (release_type, actions) = releaser
            .plan(&request("lib/app:v3", &["default/app"]), &|_: &str| {})
            .await
            .unwrap();
        assert_eq!(release_type, ReleaseType::ReleaseOne);
        assert_eq!(actions[0].description, "Release lib/app:v3 to default/app");
        assert_eq!(actions.len(), 5);
    }

    #[tokio::test]
    async fn test_plan_missing_exact_image_fails() {
        let platform = FakePlatform::new(vec![service("default/app", &[("app", "lib/app:v2")])]);
        let releaser = releaser(platform, app_registry(), FakeRepo::new("k8s"));

        let err = releaser
            .plan(&request("lib/app:v9", &["<all>"]), &|_: &str| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::InvalidImage { .. }));
    }

    #[tokio::test]
    async fn test_plan_fetches_each_repository_once() {
        let platform = FakePlatform::new(vec![
            service("default/a", &[("app", "lib/app:v2")]),
            service("default/b", &[("app", "lib/app:v2"), ("sidecar", "lib/app:v2")]),
        ]);
        let registry = app_registry();
        let releaser = releaser(platform, registry.clone(), FakeRepo::new("k8s"));

        let (_, actions) = releaser
            .plan(&request("<all latest>", &["<all>"]), &|_: &str| {})
            .await
            .unwrap();

        assert_eq!(registry.repository_calls(), vec!["lib/app"]);
        let updated: usize = actions
            .iter()
            .filter(|a| a.name() == "update_manifest")
            .count();
        assert_eq!(updated, 2);
    }
}
