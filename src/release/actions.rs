use super::apply::apply_services;
use super::{ActionKind, ContainerUpdate, ReleaseContext, ReleaseEnv, ReleaseError};
use crate::platform::ServiceId;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

impl ActionKind {
    /// Run the action against the environment, returning its result text
    pub async fn run(
        &self,
        env: &ReleaseEnv,
        rc: &mut ReleaseContext,
    ) -> Result<String, ReleaseError> {
        match self {
            ActionKind::Note => Ok(String::new()),
            ActionKind::Clone => {
                rc.clone_repo(env.repo.as_ref()).await?;
                Ok("Clone OK.".to_string())
            }
            ActionKind::FindManifest { service } => find_manifest(env, rc, service).await,
            ActionKind::UpdateManifest { service, updates } => {
                update_manifest(env, rc, service, updates).await
            }
            ActionKind::CommitAndPush { message } => {
                checkout_dir(env, rc)?;
                let output = rc.commit_and_push(env.repo.as_ref(), message).await?;
                if output.is_empty() {
                    Ok(format!("Pushed commit: {}", message))
                } else {
                    Ok(output)
                }
            }
            ActionKind::ReleaseServices { services, message } => {
                let report = apply_services(env, rc.manifests(), services, message).await;
                for (service, error) in report.failures() {
                    warn!(service = %service, error, "Service release failed");
                }
                match report.transaction_error {
                    Some(e) => Err(e.into()),
                    None => Ok(String::new()),
                }
            }
        }
    }
}

/// The manifest directory of the checkout; must exist
fn checkout_dir(env: &ReleaseEnv, rc: &ReleaseContext) -> Result<PathBuf, ReleaseError> {
    let path = rc.repo_path(env.repo.as_ref());
    if !path.is_dir() {
        return Err(ReleaseError::InvalidPath(path.display().to_string()));
    }
    Ok(path)
}

fn manifest_files(
    env: &ReleaseEnv,
    root: &Path,
    service: &ServiceId,
) -> Result<Vec<PathBuf>, ReleaseError> {
    let (namespace, name) = service.components();
    let files = env
        .manifests
        .find_manifest_files(root, namespace, name)
        .map_err(ReleaseError::Manifest)?;
    if files.len() > 1 {
        return Err(ReleaseError::AmbiguousManifest {
            service: service.clone(),
            files: files.iter().map(|f| f.display().to_string()).collect(),
        });
    }
    Ok(files)
}

async fn find_manifest(
    env: &ReleaseEnv,
    rc: &mut ReleaseContext,
    service: &ServiceId,
) -> Result<String, ReleaseError> {
    let root = checkout_dir(env, rc)?;
    let Some(file) = manifest_files(env, &root, service)?.pop() else {
        return Ok(format!("no manifest file found for {}; skipping", service));
    };

    let definition = tokio::fs::read(&file).await?;
    rc.insert_manifest(service.clone(), definition);
    Ok("Found manifest OK.".to_string())
}

async fn update_manifest(
    env: &ReleaseEnv,
    rc: &mut ReleaseContext,
    service: &ServiceId,
    updates: &[ContainerUpdate],
) -> Result<String, ReleaseError> {
    let root = checkout_dir(env, rc)?;
    let Some(file) = manifest_files(env, &root, service)?.pop() else {
        return Err(ReleaseError::ManifestNotFound(service.clone()));
    };

    let mut definition = tokio::fs::read(&file).await?;
    for update in updates {
        definition = env
            .manifests
            .rewrite_image(&definition, &update.target)
            .map_err(ReleaseError::Manifest)?;
        debug!(service = %service, container = %update.container, target = %update.target, "Rewrote image");
    }

    let permissions = tokio::fs::metadata(&file).await?.permissions();
    tokio::fs::write(&file, &definition).await?;
    tokio::fs::set_permissions(&file, permissions).await?;

    rc.insert_manifest(service.clone(), definition);
    Ok("Update manifest OK.".to_string())
}
