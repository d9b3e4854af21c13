use super::ContainerUpdate;
use crate::image::{ImageId, ImageMap};
use crate::platform::{Service, ServiceId};
use std::collections::BTreeMap;

/// Container updates needed to bring `services` to the images in `images`
///
/// Services without container information and containers with unparseable
/// images are reported through `diagnostic` and skipped, as are containers
/// already on the latest image. A container whose repository has no
/// releasable image is skipped silently. Services without any update are
/// left out of the result.
pub fn calculate_updates(
    services: &[Service],
    images: &ImageMap,
    mut diagnostic: impl FnMut(String),
) -> BTreeMap<ServiceId, Vec<ContainerUpdate>> {
    let mut updates: BTreeMap<ServiceId, Vec<ContainerUpdate>> = BTreeMap::new();

    for service in services {
        let containers = match service.containers_or_error() {
            Ok(containers) => containers,
            Err(e) => {
                diagnostic(format!(
                    "service {} does not have images associated: {}",
                    service.id, e
                ));
                continue;
            }
        };

        let mut service_updates = Vec::new();
        for container in containers {
            let current = match ImageId::parse(&container.image) {
                Ok(id) => id,
                Err(e) => {
                    diagnostic(format!(
                        "service {} container {}: {}; skipping",
                        service.id, container.name, e
                    ));
                    continue;
                }
            };

            let Some(latest) = images.latest_image(&current.repository()) else {
                continue;
            };

            if latest.id == current {
                diagnostic(format!(
                    "Service {} image {} is already the latest one; skipping.",
                    service.id, current
                ));
                continue;
            }

            service_updates.push(ContainerUpdate {
                container: container.name.clone(),
                current,
                target: latest.id.clone(),
            });
        }

        if !service_updates.is_empty() {
            updates
                .entry(service.id.clone())
                .or_default()
                .extend(service_updates);
        }
    }

    updates
}
