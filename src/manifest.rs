use crate::image::ImageId;
use crate::platform::DEFAULT_NAMESPACE;
use anyhow::{bail, Context, Result};
use regex::{Captures, Regex};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Locates service manifests in a checkout and rewrites their images
pub trait ManifestEditor: Send + Sync {
    /// Files under `root` defining the workload `namespace/name`
    fn find_manifest_files(&self, root: &Path, namespace: &str, name: &str) -> Result<Vec<PathBuf>>;

    /// Point every container using the target's repository at `target`
    fn rewrite_image(&self, definition: &[u8], target: &ImageId) -> Result<Vec<u8>>;
}

/// Services on the platform are Deployments, so no other kind defines one
const SERVICE_KIND: &str = "Deployment";

const IMAGE_LINE: &str = r#"(?m)^(\s*(?:-\s+)?image:\s*)(["']?)([^\s"'#]+)(["']?)"#;

/// Kubernetes YAML manifests, matched on Deployment name and namespace
#[derive(Debug, Default, Clone)]
pub struct YamlManifests;

impl YamlManifests {
    pub fn new() -> Self {
        Self
    }

    fn yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        let entries =
            fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if hidden {
                continue;
            }
            if path.is_dir() {
                Self::yaml_files(&path, out)?;
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml")
            {
                out.push(path);
            }
        }
        Ok(())
    }

    fn defines(bytes: &[u8], namespace: &str, name: &str) -> bool {
        for document in serde_yaml::Deserializer::from_slice(bytes) {
            let Ok(value) = serde_yaml::Value::deserialize(document) else {
                return false;
            };
            let kind = value.get("kind").and_then(|k| k.as_str());
            let metadata = value.get("metadata");
            let doc_name = metadata.and_then(|m| m.get("name")).and_then(|n| n.as_str());
            let doc_namespace = metadata
                .and_then(|m| m.get("namespace"))
                .and_then(|n| n.as_str())
                .unwrap_or(DEFAULT_NAMESPACE);

            if kind == Some(SERVICE_KIND)
                && doc_name == Some(name)
                && doc_namespace == namespace
            {
                return true;
            }
        }
        false
    }
}

impl ManifestEditor for YamlManifests {
    fn find_manifest_files(&self, root: &Path, namespace: &str, name: &str) -> Result<Vec<PathBuf>> {
        let mut candidates = Vec::new();
        Self::yaml_files(root, &mut candidates)?;

        let mut found = Vec::new();
        for path in candidates {
            let bytes =
                fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            if Self::defines(&bytes, namespace, name) {
                found.push(path);
            }
        }
        found.sort();

        debug!(namespace, name, files = found.len(), "Located manifest files");
        Ok(found)
    }

    fn rewrite_image(&self, definition: &[u8], target: &ImageId) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(definition).context("Manifest is not valid UTF-8")?;
        let pattern = Regex::new(IMAGE_LINE)?;
        let repository = target.repository();
        let replacement = target.to_string();

        let mut matched = 0;
        let rewritten = pattern.replace_all(text, |caps: &Captures| {
            match ImageId::parse(&caps[3]) {
                Ok(current) if current.repository() == repository => {
                    matched += 1;
                    format!("{}{}{}{}", &caps[1], &caps[2], replacement, &caps[4])
                }
                _ => caps[0].to_string(),
            }
        });

        if matched == 0 {
            bail!("No container image from {} found in manifest", repository);
        }
        Ok(rewritten.into_owned().into_bytes())
    }
}
