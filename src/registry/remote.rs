use super::credentials::{Creds, Credentials};
use super::transport::{RegistryRequest, RegistryResponse, Transport};
use super::RegistryError;
use crate::image::{ImageDescription, ImageId, MOVING_TAG};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.v1+prettyjws";

/// Calls against one repository in one registry
#[async_trait]
pub trait Remote: Send + Sync {
    async fn tags(&self) -> Result<Vec<String>, RegistryError>;

    async fn lookup_tag(&self, tag: &str) -> Result<ImageDescription, RegistryError>;

    /// Look up the tag carried by the image id this remote was created for
    async fn lookup(&self) -> Result<ImageDescription, RegistryError>;

    /// Abort in-flight and future calls
    fn cancel(&self);
}

pub trait RemoteFactory: Send + Sync {
    fn create(&self, id: &ImageId) -> Result<Arc<dyn Remote>, RegistryError>;
}

/// Creates [`RemoteClient`]s sharing one credential store and transport
pub struct RemoteClientFactory {
    credentials: Credentials,
    transport: Arc<dyn Transport>,
    insecure_hosts: HashSet<String>,
}

impl RemoteClientFactory {
    pub fn new(credentials: Credentials, transport: Arc<dyn Transport>) -> Self {
        Self {
            credentials,
            transport,
            insecure_hosts: HashSet::new(),
        }
    }

    /// Hosts reached over plain HTTP
    pub fn with_insecure_hosts<I: IntoIterator<Item = String>>(mut self, hosts: I) -> Self {
        self.insecure_hosts.extend(hosts);
        self
    }
}

impl RemoteFactory for RemoteClientFactory {
    fn create(&self, id: &ImageId) -> Result<Arc<dyn Remote>, RegistryError> {
        let host = id.host();
        let scheme = if self.insecure_hosts.contains(host) {
            "http"
        } else {
            "https"
        };
        let base_url = Url::parse(&format!("{}://{}/", scheme, host))?;

        Ok(Arc::new(RemoteClient {
            id: id.clone(),
            base_url,
            creds: self.credentials.creds_for(host).cloned(),
            transport: self.transport.clone(),
            cancel: CancellationToken::new(),
            token: Mutex::new(None),
        }))
    }
}

/// Registry v2 API client for a single repository
pub struct RemoteClient {
    id: ImageId,
    base_url: Url,
    creds: Option<Creds>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    token: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    history: Vec<V1History>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct V1History {
    #[serde(rename = "v1Compatibility")]
    v1_compatibility: String,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct CreatedAt {
    #[serde(default)]
    created: Option<DateTime<Utc>>,
}

enum Challenge {
    Basic,
    Bearer(HashMap<String, String>),
}

impl RemoteClient {
    async fn send(&self, request: RegistryRequest) -> Result<RegistryResponse, RegistryError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RegistryError::Cancelled),
            result = self.transport.round_trip(request) => result,
        }
    }

    fn authorize(&self, request: RegistryRequest) -> RegistryRequest {
        let token = self.token.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match (token, &self.creds) {
            (Some(token), _) => request.bearer_auth(token),
            (None, Some(creds)) => request.basic_auth(&creds.username, &creds.password),
            (None, None) => request,
        }
    }

    /// GET with auth challenge handling; non-success statuses become errors
    async fn get(&self, url: Url, accept: Option<&str>) -> Result<RegistryResponse, RegistryError> {
        let mut request = RegistryRequest::get(url.clone());
        if let Some(accept) = accept {
            request = request.header("Accept", accept);
        }

        let response = self.send(self.authorize(request.clone())).await?;
        if response.status != 401 {
            return check_status(response, &url);
        }

        let challenge = response
            .header("WWW-Authenticate")
            .and_then(parse_challenge);
        let retry = match challenge {
            Some(Challenge::Bearer(params)) => {
                let token = self.fetch_token(&params).await?;
                *self.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
                request.bearer_auth(token)
            }
            Some(Challenge::Basic) => match &self.creds {
                Some(creds) => request.basic_auth(&creds.username, &creds.password),
                None => return Err(RegistryError::Unauthorized(url.to_string())),
            },
            None => return Err(RegistryError::Unauthorized(url.to_string())),
        };

        let response = self.send(retry).await?;
        check_status(response, &url)
    }

    async fn fetch_token(&self, params: &HashMap<String, String>) -> Result<String, RegistryError> {
        let realm = params.get("realm").ok_or_else(|| {
            RegistryError::Unauthorized("bearer challenge without realm".to_string())
        })?;
        let mut url = Url::parse(realm)?;
        {
            let mut query = url.query_pairs_mut();
            for key in ["service", "scope"] {
                if let Some(value) = params.get(key) {
                    query.append_pair(key, value);
                }
            }
        }
        debug!(realm = %realm, image = %self.id, "Fetching registry token");

        let mut request = RegistryRequest::get(url);
        if let Some(creds) = &self.creds {
            request = request.basic_auth(&creds.username, &creds.password);
        }
        let response = self.send(request).await?;
        if !response.is_success() {
            return Err(RegistryError::Unauthorized(format!(
                "token endpoint {} returned {}",
                realm, response.status
            )));
        }

        let body: TokenResponse = response
            .json()
            .map_err(|e| RegistryError::Unauthorized(format!("token response: {}", e)))?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::Unauthorized("token response without token".to_string()))
    }

    fn api_url(&self, path: &str) -> Result<Url, RegistryError> {
        Ok(self
            .base_url
            .join(&format!("v2/{}/{}", self.id.canonical_name(), path))?)
    }

    fn malformed(&self, reason: impl ToString) -> RegistryError {
        RegistryError::MalformedManifest {
            image: self.id.repository(),
            reason: reason.to_string(),
        }
    }

    async fn blob_created_at(&self, digest: &str) -> Result<Option<DateTime<Utc>>, RegistryError> {
        let response = self
            .get(self.api_url(&format!("blobs/{}", digest))?, None)
            .await?;
        let config: CreatedAt = response.json().map_err(|e| self.malformed(e))?;
        Ok(config.created)
    }
}

#[async_trait]
impl Remote for RemoteClient {
    async fn tags(&self) -> Result<Vec<String>, RegistryError> {
        let mut url = self.api_url("tags/list")?;
        let mut tags = Vec::new();

        loop {
            let response = self.get(url, None).await?;
            let page: TagList = response
                .json()
                .map_err(|e| self.malformed(format!("tag list: {}", e)))?;
            tags.extend(page.tags.unwrap_or_default());

            match response.header("Link").and_then(next_link) {
                Some(next) => url = self.base_url.join(next)?,
                None => break,
            }
        }

        Ok(tags)
    }

    async fn lookup_tag(&self, tag: &str) -> Result<ImageDescription, RegistryError> {
        let id = self.id.with_tag(tag);
        let mut reference = tag.to_string();

        // An image index is followed to its first manifest, once
        for _ in 0..2 {
            let url = self.api_url(&format!("manifests/{}", reference))?;
            let response = self.get(url, Some(MANIFEST_ACCEPT)).await?;
            let manifest: Manifest = response.json().map_err(|e| self.malformed(e))?;

            if let Some(first) = manifest.manifests.first() {
                reference = first.digest.clone();
                continue;
            }

            let created_at = if manifest.schema_version == 1 || !manifest.history.is_empty() {
                let history = manifest
                    .history
                    .first()
                    .ok_or_else(|| self.malformed("schema 1 manifest without history"))?;
                let v1: CreatedAt = serde_json::from_str(&history.v1_compatibility)
                    .map_err(|e| self.malformed(e))?;
                v1.created
            } else if let Some(config) = &manifest.config {
                self.blob_created_at(&config.digest).await?
            } else {
                return Err(self.malformed("manifest has neither history nor config"));
            };

            // Unset timestamps come through as the zero time
            let created_at = created_at.filter(|t| t.year() > 1);
            return Ok(ImageDescription::new(id, created_at));
        }

        Err(self.malformed("nested manifest index"))
    }

    async fn lookup(&self) -> Result<ImageDescription, RegistryError> {
        let tag = self.id.tag().unwrap_or(MOVING_TAG).to_string();
        self.lookup_tag(&tag).await
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

fn check_status(response: RegistryResponse, url: &Url) -> Result<RegistryResponse, RegistryError> {
    match response.status {
        200..=299 => Ok(response),
        401 | 403 => Err(RegistryError::Unauthorized(url.to_string())),
        404 => Err(RegistryError::NotFound(url.to_string())),
        status => Err(RegistryError::Status {
            status,
            url: url.to_string(),
        }),
    }
}

/// Target of the `rel="next"` entry of a Link header
fn next_link(header: &str) -> Option<&str> {
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        params
            .split(';')
            .any(|p| p.trim().replace(' ', "") == "rel=\"next\"")
            .then(|| target.trim().trim_start_matches('<').trim_end_matches('>'))
    })
}

/// Parse `Bearer realm="...",service="...",scope="..."` or `Basic realm="..."`
fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));

    if scheme.eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut params = HashMap::new();
    let mut rest = rest.trim();
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let (value, remaining) = match after.strip_prefix('"') {
            Some(quoted) => {
                let (value, remaining) = quoted.split_once('"')?;
                (value, remaining)
            }
            None => after.split_once(',').unwrap_or((after, "")),
        };
        params.insert(key, value.to_string());
        rest = remaining.trim_start_matches(',').trim();
    }

    Some(Challenge::Bearer(params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::mock::FnTransport;
    use crate::registry::transport::RequestAuth;
    use chrono::TimeZone;

    fn factory(credentials: Credentials, transport: FnTransport) -> RemoteClientFactory {
        RemoteClientFactory::new(credentials, Arc::new(transport))
    }

    #[tokio::test]
    async fn test_tags_follow_link_pagination() {
        let transport = FnTransport::new(|req: RegistryRequest| {
            assert_eq!(req.url.path(), "/v2/library/nats/tags/list");
            match req.url.query() {
                None => Ok(RegistryResponse::new(200, r#"{"tags": ["a", "b"]}"#).with_header(
                    "Link",
                    r#"</v2/library/nats/tags/list?last=b&n=2>; rel="next""#,
                )),
                Some("last=b&n=2") => Ok(RegistryResponse::new(200, r#"{"tags": ["c"]}"#)),
                Some(other) => panic!("unexpected query {}", other),
            }
        });
        let remote = factory(Credentials::none(), transport)
            .create(&ImageId::parse("nats").unwrap())
            .unwrap();

        assert_eq!(remote.tags().await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_bearer_challenge_then_config_blob_created() {
        let transport = FnTransport::new(|req: RegistryRequest| {
            let bearer = matches!(&req.auth, Some(RequestAuth::Bearer(t)) if t == "tok");
            match (req.url.host_str(), req.url.path()) {
                (Some("auth.example.com"), "/token") => {
                    let query: HashMap<_, _> = req.url.query_pairs().into_owned().collect();
                    assert_eq!(query["service"], "registry.example.com");
                    assert_eq!(query["scope"], "repository:foo/bar:pull");
                    assert_eq!(req.basic_credentials(), Some(("alice", "secret")));
                    Ok(RegistryResponse::new(200, r#"{"token": "tok"}"#))
                }
                (_, _) if !bearer => Ok(RegistryResponse::new(401, "").with_header(
                    "WWW-Authenticate",
                    r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:foo/bar:pull""#,
                )),
                (_, "/v2/foo/bar/manifests/v1") => {
                    assert!(req
                        .headers
                        .iter()
                        .any(|(k, v)| k == "Accept" && v.contains("manifest.v2+json")));
                    Ok(RegistryResponse::new(
                        200,
                        r#"{"schemaVersion": 2, "config": {"digest": "sha256:abc"}}"#,
                    ))
                }
                (_, "/v2/foo/bar/blobs/sha256:abc") => Ok(RegistryResponse::new(
                    200,
                    r#"{"created": "2017-01-13T16:40:14Z"}"#,
                )),
                (_, path) => panic!("unexpected path {}", path),
            }
        });
        let mut credentials = Credentials::none();
        credentials.insert(
            "registry.example.com",
            Creds {
                username: "alice".to_string(),
                password: "secret".to_string(),
            },
        );

        let remote = factory(credentials, transport)
            .create(&ImageId::parse("registry.example.com/foo/bar:v1").unwrap())
            .unwrap();
        let image = remote.lookup().await.unwrap();

        assert_eq!(image.id.to_string(), "registry.example.com/foo/bar:v1");
        assert_eq!(
            image.created_at,
            Some(Utc.with_ymd_and_hms(2017, 1, 13, 16, 40, 14).unwrap())
        );
    }

    #[tokio::test]
    async fn test_schema1_created_from_history() {
        let transport = FnTransport::new(|_req: RegistryRequest| {
            Ok(RegistryResponse::new(
                200,
                r#"{"schemaVersion": 1, "history": [{"v1Compatibility": "{\"created\":\"2016-05-02T10:00:00.5Z\"}"}, {"v1Compatibility": "{}"}]}"#,
            ))
        });
        let remote = factory(Credentials::none(), transport)
            .create(&ImageId::parse("foo/bar").unwrap())
            .unwrap();

        let image = remote.lookup_tag("2.0").await.unwrap();
        assert_eq!(image.id.to_string(), "foo/bar:2.0");
        assert_eq!(
            image.created_at.map(|t| t.timestamp()),
            Some(Utc.with_ymd_and_hms(2016, 5, 2, 10, 0, 0).unwrap().timestamp())
        );
    }

    #[tokio::test]
    async fn test_index_resolves_through_first_manifest_and_zero_time_is_none() {
        let transport = FnTransport::new(|req: RegistryRequest| match req.url.path() {
            "/v2/foo/bar/manifests/multi" => Ok(RegistryResponse::new(
                200,
                r#"{"schemaVersion": 2, "manifests": [{"digest": "sha256:amd64"}, {"digest": "sha256:arm64"}]}"#,
            )),
            "/v2/foo/bar/manifests/sha256:amd64" => Ok(RegistryResponse::new(
                200,
                r#"{"schemaVersion": 2, "config": {"digest": "sha256:cfg"}}"#,
            )),
            "/v2/foo/bar/blobs/sha256:cfg" => Ok(RegistryResponse::new(
                200,
                r#"{"created": "0001-01-01T00:00:00Z"}"#,
            )),
            path => panic!("unexpected path {}", path),
        });
        let remote = factory(Credentials::none(), transport)
            .create(&ImageId::parse("foo/bar").unwrap())
            .unwrap();

        let image = remote.lookup_tag("multi").await.unwrap();
        assert_eq!(image.created_at, None);
    }

    #[tokio::test]
    async fn test_missing_manifest_is_not_found() {
        let transport = FnTransport::new(|_req: RegistryRequest| Ok(RegistryResponse::new(404, "")));
        let remote = factory(Credentials::none(), transport)
            .create(&ImageId::parse("foo/bar").unwrap())
            .unwrap();

        let err = remote.lookup_tag("gone").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancelled_remote_refuses_calls() {
        let transport = FnTransport::new(|_req: RegistryRequest| {
            Ok(RegistryResponse::new(200, r#"{"tags": []}"#))
        });
        let remote = factory(Credentials::none(), transport)
            .create(&ImageId::parse("foo/bar").unwrap())
            .unwrap();

        remote.cancel();
        assert!(matches!(remote.tags().await, Err(RegistryError::Cancelled)));
    }

    #[test]
    fn test_parse_challenge() {
        match parse_challenge(r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nats:pull,push""#) {
            Some(Challenge::Bearer(params)) => {
                assert_eq!(params["realm"], "https://auth.docker.io/token");
                assert_eq!(params["scope"], "repository:library/nats:pull,push");
            }
            _ => panic!("expected bearer challenge"),
        }
        assert!(matches!(parse_challenge(r#"Basic realm="x""#), Some(Challenge::Basic)));
        assert!(parse_challenge("Negotiate").is_none());
    }

    #[test]
    fn test_next_link() {
        assert_eq!(
            next_link(r#"</v2/x/tags/list?last=b>; rel="next""#),
            Some("/v2/x/tags/list?last=b")
        );
        assert_eq!(next_link(r#"</v2/x/tags/list?last=b>; rel="prev""#), None);
    }
}
