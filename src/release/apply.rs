use super::ReleaseEnv;
use crate::platform::{PlatformError, ServiceDefinition, ServiceId};
use std::collections::BTreeMap;
use tracing::{info, warn};

const NO_DEFINITION: &str = "no definition found; skipping release";

/// Outcome of applying a set of service definitions
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// `None` means applied (or dispatched, for self services)
    pub results: BTreeMap<ServiceId, Option<String>>,
    /// Self services handed to a detached apply; their outcome is never observed
    pub self_dispatched: Vec<ServiceId>,
    pub transaction_error: Option<PlatformError>,
}

impl ApplyReport {
    pub fn failures(&self) -> impl Iterator<Item = (&ServiceId, &str)> {
        self.results
            .iter()
            .filter_map(|(id, err)| err.as_deref().map(|e| (id, e)))
    }
}

/// Apply the stored definitions of `services` to the platform
///
/// Every service except the ones running this tool goes out in a single
/// apply call. Self services are applied last from a detached task, since
/// applying them replaces the running process.
pub async fn apply_services(
    env: &ReleaseEnv,
    manifests: &BTreeMap<ServiceId, Vec<u8>>,
    services: &[ServiceId],
    message: &str,
) -> ApplyReport {
    let mut report = ApplyReport::default();
    let mut others = Vec::new();
    let mut selves = Vec::new();

    for id in services {
        let Some(definition) = manifests.get(id) else {
            report.results.insert(id.clone(), Some(NO_DEFINITION.to_string()));
            continue;
        };
        let def = ServiceDefinition {
            service_id: id.clone(),
            new_definition: definition.clone(),
        };
        let (namespace, name) = id.components();
        if env.is_self_service(id) {
            env.events.log_event(
                namespace,
                name,
                &format!("Starting {:?}. (no result expected)", message),
            );
            selves.push(def);
        } else {
            env.events
                .log_event(namespace, name, &format!("Starting {:?}", message));
            others.push(def);
        }
    }

    let applied: Vec<ServiceId> = others.iter().map(|d| d.service_id.clone()).collect();
    if !others.is_empty() {
        if let Err(e) = env.platform_apply(others).await {
            match &e {
                PlatformError::Apply(errors) => {
                    for (id, err) in errors {
                        report.results.insert(id.clone(), Some(err.clone()));
                    }
                }
                other => {
                    for id in &applied {
                        report.results.insert(id.clone(), Some(other.to_string()));
                    }
                }
            }
            report.transaction_error = Some(e);
        }
    }

    for id in &applied {
        let outcome = report.results.entry(id.clone()).or_insert(None);
        let event = match outcome {
            Some(err) => format!("{}. error: {}. failed", message, err),
            None => format!("{}. done", message),
        };
        let (namespace, name) = id.components();
        env.events.log_event(namespace, name, &event);
    }

    if !selves.is_empty() {
        for def in &selves {
            report.results.entry(def.service_id.clone()).or_insert(None);
            report.self_dispatched.push(def.service_id.clone());
        }
        let platform = env.platform.clone();
        let ids: Vec<String> = report.self_dispatched.iter().map(ToString::to_string).collect();
        info!(services = ?ids, "Dispatching self upgrade");
        tokio::spawn(async move {
            if let Err(e) = platform.apply(selves).await {
                warn!(services = ?ids, error = %e, "Self upgrade apply failed");
            }
        });
    }

    report
}
