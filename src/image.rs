use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Registry host assumed when an image reference does not name one
pub const DOCKER_HUB_HOST: &str = "index.docker.io";

/// Organization assumed when an image reference has a single path segment
pub const DOCKER_HUB_LIBRARY: &str = "library";

/// Tag that is never considered a release target
pub const MOVING_TAG: &str = "latest";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("empty image reference")]
    Empty,

    #[error(
        "invalid image reference {0:?}: expected \"<host>/<org>/<image>\", \"<org>/<image>\", or \"<image>\""
    )]
    TooManySegments(String),

    #[error("invalid image reference {0:?}: empty path segment")]
    EmptySegment(String),

    #[error("invalid image reference {0:?}: malformed tag")]
    MalformedTag(String),
}

/// Reference to a container image, e.g. `quay.io/weaveworks/helloworld:v1`
///
/// The name keeps the organization when one was given (`weaveworks/helloworld`),
/// so that a reference prints back exactly as it was parsed.
/// Ordered by registry, then name, then tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageId {
    registry: Option<String>,
    name: String,
    tag: Option<String>,
}

impl ImageId {
    /// Parse an image reference
    ///
    /// | input                     | registry  | name        | tag    |
    /// |---------------------------|-----------|-------------|--------|
    /// | `helloworld`              | -         | `helloworld`| -      |
    /// | `foo/helloworld:v1`       | -         | `foo/helloworld` | `v1` |
    /// | `quay.io/foo/helloworld`  | `quay.io` | `foo/helloworld` | - |
    pub fn parse(reference: &str) -> Result<Self, ImageError> {
        if reference.is_empty() {
            return Err(ImageError::Empty);
        }

        let segments: Vec<&str> = reference.split('/').collect();
        if segments.len() > 3 {
            return Err(ImageError::TooManySegments(reference.to_string()));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ImageError::EmptySegment(reference.to_string()));
        }

        let (registry, rest) = if segments.len() == 3 {
            let host = segments[0];
            (Some(host.to_string()), &reference[host.len() + 1..])
        } else {
            (None, reference)
        };

        let (name, tag) = match rest.split_once(':') {
            Some((name, tag)) => {
                if tag.is_empty() || tag.contains('/') || tag.contains(':') {
                    return Err(ImageError::MalformedTag(reference.to_string()));
                }
                (name, Some(tag.to_string()))
            }
            None => (rest, None),
        };

        if name.is_empty() {
            return Err(ImageError::EmptySegment(reference.to_string()));
        }

        Ok(Self {
            registry,
            name: name.to_string(),
            tag,
        })
    }

    /// Assemble an image id from its components; empty strings mean "absent"
    pub fn make(registry: &str, name: &str, tag: &str) -> Self {
        Self {
            registry: (!registry.is_empty()).then(|| registry.to_string()),
            name: name.to_string(),
            tag: (!tag.is_empty()).then(|| tag.to_string()),
        }
    }

    /// Registry, name and tag, with absent parts as empty strings
    pub fn components(&self) -> (&str, &str, &str) {
        (
            self.registry.as_deref().unwrap_or(""),
            &self.name,
            self.tag.as_deref().unwrap_or(""),
        )
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Everything but the tag
    pub fn repository(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{}/{}", registry, self.name),
            None => self.name.clone(),
        }
    }

    /// Registry host, defaulting to Docker Hub
    pub fn host(&self) -> &str {
        self.registry.as_deref().unwrap_or(DOCKER_HUB_HOST)
    }

    /// `org/image` as used in registry API paths; bare names live in `library/`
    pub fn canonical_name(&self) -> String {
        if self.name.contains('/') {
            self.name.clone()
        } else {
            format!("{}/{}", DOCKER_HUB_LIBRARY, self.name)
        }
    }

    pub fn with_tag(&self, tag: &str) -> Self {
        let (registry, name, _) = self.components();
        Self::make(registry, name, tag)
    }

    /// Whether the tag is the moving "latest" alias (case-insensitive)
    pub fn is_moving_tag(&self) -> bool {
        self.tag
            .as_deref()
            .is_some_and(|tag| tag.eq_ignore_ascii_case(MOVING_TAG))
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repository())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        Ok(())
    }
}

impl FromStr for ImageId {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageId {
    type Error = ImageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageId> for String {
    fn from(id: ImageId) -> Self {
        id.to_string()
    }
}

/// An image available in a registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescription {
    pub id: ImageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ImageDescription {
    pub fn new(id: ImageId, created_at: Option<DateTime<Utc>>) -> Self {
        Self { id, created_at }
    }
}

/// Order images newest first
///
/// Images without a creation time sort before everything else. Equal
/// timestamps fall back to ascending reference order.
pub fn newest_first(a: &ImageDescription, b: &ImageDescription) -> Ordering {
    match (&a.created_at, &b.created_at) {
        (None, None) => a.id.cmp(&b.id),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) if x == y => a.id.cmp(&b.id),
        (Some(x), Some(y)) => y.cmp(x),
    }
}

/// Available images per repository, each list newest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMap(BTreeMap<String, Vec<ImageDescription>>);

impl ImageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, repository: impl Into<String>, images: Vec<ImageDescription>) {
        self.0.insert(repository.into(), images);
    }

    pub fn get(&self, repository: &str) -> Option<&[ImageDescription]> {
        self.0.get(repository).map(Vec::as_slice)
    }

    pub fn repositories(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Latest releasable image for a repository
    ///
    /// Returns the first image not tagged "latest", relying on the list being
    /// sorted newest first. `None` lets the caller decide whether a missing
    /// image is an error.
    pub fn latest_image(&self, repository: &str) -> Option<&ImageDescription> {
        self.0
            .get(repository)?
            .iter()
            .find(|image| !image.id.is_moving_tag())
    }
}

impl FromIterator<(String, Vec<ImageDescription>)> for ImageMap {
    fn from_iter<I: IntoIterator<Item = (String, Vec<ImageDescription>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
