//! Registry access: credentials, throttled transports, the v2 API client and
//! the concurrent per-repository fan-out built on top of it.

pub mod client;
pub mod credentials;
pub mod error;
pub mod monitoring;
pub mod remote;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use client::Client;
pub use credentials::{Credentials, Creds};
pub use error::RegistryError;
pub use monitoring::{InstrumentedClient, InstrumentedRemoteFactory};
pub use remote::{Remote, RemoteClient, RemoteClientFactory, RemoteFactory};
pub use transport::{
    BackoffTransport, HttpTransport, RateLimitedTransport, RegistryRequest, RegistryResponse,
    Transport,
};

use crate::image::{ImageDescription, ImageId};
use crate::settings::RegistrySettings;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Image metadata lookups against container registries
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Every tagged image of a repository, newest first
    async fn get_repository(
        &self,
        repository: &ImageId,
    ) -> Result<Vec<ImageDescription>, RegistryError>;

    /// A single `repo:tag`
    async fn get_image(&self, image: &ImageId) -> Result<ImageDescription, RegistryError>;
}

#[async_trait]
impl<T: RegistryClient + ?Sized> RegistryClient for Arc<T> {
    async fn get_repository(
        &self,
        repository: &ImageId,
    ) -> Result<Vec<ImageDescription>, RegistryError> {
        (**self).get_repository(repository).await
    }

    async fn get_image(&self, image: &ImageId) -> Result<ImageDescription, RegistryError> {
        (**self).get_image(image).await
    }
}

/// Load credentials from the configured file and inline auths
pub fn credentials_from_settings(settings: &RegistrySettings) -> Result<Credentials, RegistryError> {
    // An empty path comes from an unset `${VAR:-}` substitution
    let mut credentials = match settings.credentials_file.as_deref() {
        Some(path) if !path.is_empty() => Credentials::from_file(Path::new(path))?,
        _ => Credentials::none(),
    };
    credentials.merge(Credentials::from_auths(
        settings.auths.iter().map(|(host, auth)| (host.clone(), auth)),
    )?);
    Ok(credentials)
}

/// Build the instrumented client over HTTP, per-host throttling and, when
/// configured, 429 backoff
pub fn client_from_settings(
    settings: &RegistrySettings,
) -> Result<Arc<dyn RegistryClient>, RegistryError> {
    let credentials = credentials_from_settings(settings)?;
    info!(hosts = ?credentials.hosts(), "Loaded registry credentials");

    let http = HttpTransport::new(settings.request_timeout())?;
    let limited = RateLimitedTransport::new(
        http,
        settings.max_backlog(),
        settings.rate_limits.clone(),
    );
    let transport: Arc<dyn Transport> = match &settings.backoff {
        Some(backoff) => Arc::new(BackoffTransport::new(
            limited,
            Duration::from_secs(backoff.max_backoff_secs),
            backoff.max_attempts,
        )),
        None => Arc::new(limited),
    };

    let factory = InstrumentedRemoteFactory::new(
        RemoteClientFactory::new(credentials, transport)
            .with_insecure_hosts(settings.insecure_hosts.clone()),
    );
    Ok(Arc::new(InstrumentedClient::new(Client::new(Arc::new(
        factory,
    )))))
}
