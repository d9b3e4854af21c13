use super::RegistryError;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Username and password for one registry host
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Creds {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Creds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Creds")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

#[derive(Debug, Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: String,
}

/// Credentials keyed by registry host
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    m: HashMap<String, Creds>,
}

impl Credentials {
    /// No credentials; every lookup is anonymous
    pub fn none() -> Self {
        Self::default()
    }

    /// Load a Docker `config.json` file
    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let bytes = std::fs::read(path)?;
        Self::from_docker_config(&bytes)
    }

    /// Parse the `auths` section of a Docker `config.json`
    pub fn from_docker_config(bytes: &[u8]) -> Result<Self, RegistryError> {
        let config: DockerConfig =
            serde_json::from_slice(bytes).map_err(|e| RegistryError::InvalidCredentials {
                host: "<config>".to_string(),
                reason: e.to_string(),
            })?;

        let auths = config
            .auths
            .into_iter()
            .filter(|(_, a)| !a.auth.is_empty())
            .map(|(host, a)| (host, a.auth));
        Self::from_auths(auths)
    }

    /// Build from host -> base64("username:password") pairs
    pub fn from_auths<I, K, V>(auths: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut creds = Self::none();
        for (host, encoded) in auths {
            let host = host.into();
            let decoded = decode_auth(&host, encoded.as_ref())?;
            creds.m.insert(host, decoded);
        }
        Ok(creds)
    }

    pub fn insert(&mut self, host: impl Into<String>, creds: Creds) {
        self.m.insert(host.into(), creds);
    }

    /// Look up credentials for a host, falling back to the legacy
    /// `https://<host>/v1/` key Docker writes for Docker Hub
    pub fn creds_for(&self, host: &str) -> Option<&Creds> {
        self.m
            .get(host)
            .or_else(|| self.m.get(&format!("https://{}/v1/", host)))
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.m.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Merge another set in; entries from `other` win
    pub fn merge(&mut self, other: Credentials) {
        self.m.extend(other.m);
    }
}

fn decode_auth(host: &str, encoded: &str) -> Result<Creds, RegistryError> {
    let invalid = |reason: String| RegistryError::InvalidCredentials {
        host: host.to_string(),
        reason,
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| invalid(e.to_string()))?;
    let text = String::from_utf8(bytes).map_err(|e| invalid(e.to_string()))?;
    let (username, password) = text
        .split_once(':')
        .ok_or_else(|| invalid("expected username:password".to_string()))?;

    Ok(Creds {
        username: username.to_string(),
        password: password.to_string(),
    })
}
