use config::{Config, ConfigError, File, FileFormat, FileSourceString};
use regex::{Captures, Regex};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use std::{env, fs, io};
use tracing::{debug, warn};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub git: Option<GitSettings>,
    #[serde(default)]
    pub platform: PlatformSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistrySettings {
    /// Docker `config.json` style credentials file
    #[serde(default)]
    pub credentials_file: Option<String>,

    /// Inline credentials: registry host -> base64("username:password")
    #[serde(default)]
    pub auths: HashMap<String, String>,

    /// Maximum requests per second for each registry host (0 or unset = unlimited)
    #[serde(default)]
    pub rate_limits: HashMap<String, u32>,

    /// Fail a request immediately instead of queueing it longer than this (0 = no limit)
    #[serde(default = "default_max_backlog_secs")]
    pub max_backlog_secs: u64,

    /// Per-host, per-credential exponential backoff on HTTP 429 responses
    #[serde(default)]
    pub backoff: Option<BackoffSettings>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Hosts reached over plain HTTP (local development registries)
    #[serde(default)]
    pub insecure_hosts: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackoffSettings {
    /// Longest wait between two attempts against the same host and credentials
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Attempts before a rate-limited request is given up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitSettings {
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Directory inside the repository holding the manifests
    #[serde(default)]
    pub path: String,
    /// Private key used for SSH remotes
    #[serde(default)]
    pub ssh_key: Option<String>,
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default = "default_user_email")]
    pub user_email: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlatformSettings {
    /// Restrict "all services" to a single namespace
    #[serde(default)]
    pub namespace: Option<String>,

    /// Service names under which the releaser itself runs
    #[serde(default = "default_self_service_names")]
    pub self_service_names: Vec<String>,

    /// Field manager used for server-side apply
    #[serde(default = "default_field_manager")]
    pub field_manager: String,
}

fn default_max_backlog_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_backoff_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    10
}

fn default_branch() -> String {
    "master".to_string()
}

fn default_user_name() -> String {
    "rollout".to_string()
}

fn default_user_email() -> String {
    "rollout@localhost".to_string()
}

fn default_self_service_names() -> Vec<String> {
    vec!["rollout".to_string()]
}

fn default_field_manager() -> String {
    "rollout".to_string()
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            credentials_file: None,
            auths: HashMap::new(),
            rate_limits: HashMap::new(),
            max_backlog_secs: default_max_backlog_secs(),
            backoff: None,
            request_timeout_secs: default_request_timeout_secs(),
            insecure_hosts: Vec::new(),
        }
    }
}

impl RegistrySettings {
    pub fn max_backlog(&self) -> Duration {
        Duration::from_secs(self.max_backlog_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            namespace: None,
            self_service_names: default_self_service_names(),
            field_manager: default_field_manager(),
        }
    }
}

/// Replace `${VAR}` and `${VAR:-default}` in raw config text
///
/// Substitution happens before parsing, so an unset variable without a
/// default leaves an empty YAML value (null) behind.
fn substitute_env_vars(text: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return text.to_string();
    };

    re.replace_all(text, |caps: &Captures| {
        env::var(&caps[1]).unwrap_or_else(|_| {
            caps.get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default()
        })
    })
    .into_owned()
}

/// Read `<name>.yaml` (or `.yml`) from `config_dir` with variables substituted
fn read_layer(
    config_dir: &Path,
    name: &str,
) -> Result<Option<File<FileSourceString, FileFormat>>, ConfigError> {
    for ext in ["yaml", "yml"] {
        let path = config_dir.join(format!("{}.{}", name, ext));
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(ConfigError::Foreign(Box::new(e))),
        };
        debug!(path = %path.display(), "Loading config layer");
        return Ok(Some(File::from_str(
            &substitute_env_vars(&text),
            FileFormat::Yaml,
        )));
    }
    Ok(None)
}

impl Settings {
    /// Load settings from `$ROLLOUT_CONFIG_DIR` (default `config`) for `$ROLLOUT_CONFIG_RUN_MODE`
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode =
            env::var("ROLLOUT_CONFIG_RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = env::var("ROLLOUT_CONFIG_DIR").unwrap_or_else(|_| "config".into());
        Self::build(Path::new(&config_dir), &run_mode, true)
    }

    /// Load `default`, then `<run_mode>`, then `local` from a config directory
    pub fn load(config_dir: &Path, run_mode: &str) -> Result<Self, ConfigError> {
        Self::build(config_dir, run_mode, false)
    }

    fn build(config_dir: &Path, run_mode: &str, with_env: bool) -> Result<Self, ConfigError> {
        let Some(defaults) = read_layer(config_dir, "default")? else {
            return Err(ConfigError::Message(format!(
                "Required config file not found: {}/default.{{yaml,yml}}",
                config_dir.display()
            )));
        };

        let mut builder = Config::builder().add_source(defaults);
        for name in [run_mode, "local"] {
            if let Some(layer) = read_layer(config_dir, name)? {
                builder = builder.add_source(layer);
            }
        }

        // ROLLOUT_REGISTRY__MAX_BACKLOG_SECS=5 overrides registry.max_backlog_secs
        if with_env {
            builder = builder.add_source(
                config::Environment::with_prefix("ROLLOUT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let mut unused_fields = Vec::new();
        let settings: Settings = serde_ignored::deserialize(builder.build()?, |path| {
            unused_fields.push(path.to_string());
        })?;

        for field in &unused_fields {
            warn!(field = %field, "Unknown configuration field");
        }

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(git) = &self.git {
            if git.url.is_empty() {
                return Err(ConfigError::Message(
                    "git.url must not be empty when a git section is configured".to_string(),
                ));
            }
            if git.branch.is_empty() {
                return Err(ConfigError::Message(
                    "git.branch must not be empty".to_string(),
                ));
            }
        }
        if self.platform.self_service_names.iter().any(String::is_empty) {
            return Err(ConfigError::Message(
                "platform.self_service_names must not contain empty names".to_string(),
            ));
        }
        Ok(())
    }
}
