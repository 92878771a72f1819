//! Image sources: network resources and local data providers.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use url::Url;

/// Boxed error returned by data providers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A network-fetchable image reference.
pub trait Resource: Send + Sync {
    /// Key the image is cached under.
    fn cache_key(&self) -> String;

    /// URL the image is downloaded from.
    fn download_url(&self) -> Url;
}

impl Resource for Url {
    fn cache_key(&self) -> String {
        self.as_str().to_string()
    }

    fn download_url(&self) -> Url {
        self.clone()
    }
}

/// Converts a resource into a [`Source`].
///
/// `file://` URLs become local-file providers; everything else is fetched
/// over the network.
pub fn resource_into_source(resource: Arc<dyn Resource>) -> Source {
    let url = resource.download_url();
    if url.scheme() == "file"
        && let Ok(path) = url.to_file_path()
    {
        return Source::Provider(Arc::new(LocalFileImageDataProvider::with_cache_key(
            path,
            resource.cache_key(),
        )));
    }
    Source::Network(resource)
}

/// A plain resource with an explicit cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageResource {
    cache_key: String,
    download_url: Url,
}

impl ImageResource {
    /// Creates a resource; the cache key defaults to the URL string.
    #[must_use]
    pub fn new(download_url: Url, cache_key: Option<String>) -> Self {
        let cache_key = cache_key.unwrap_or_else(|| download_url.as_str().to_string());
        Self {
            cache_key,
            download_url,
        }
    }

    /// Wraps the resource into a source.
    #[must_use]
    pub fn into_source(self) -> Source {
        resource_into_source(Arc::new(self))
    }
}

impl Resource for ImageResource {
    fn cache_key(&self) -> String {
        self.cache_key.clone()
    }

    fn download_url(&self) -> Url {
        self.download_url.clone()
    }
}

/// Supplies image data without going through the downloader.
#[async_trait]
pub trait ImageDataProvider: Send + Sync {
    /// Key the image is cached under.
    fn cache_key(&self) -> String;

    /// URL describing the content, if there is one.
    fn content_url(&self) -> Option<Url> {
        None
    }

    /// Produces the raw image data.
    async fn data(&self) -> Result<Bytes, BoxError>;
}

/// Reads image data from a local file.
#[derive(Debug, Clone)]
pub struct LocalFileImageDataProvider {
    file_path: PathBuf,
    cache_key: String,
}

impl LocalFileImageDataProvider {
    /// Creates a provider keyed by the file URL.
    #[must_use]
    pub fn new(file_path: PathBuf) -> Self {
        let cache_key = Url::from_file_path(&file_path).map_or_else(
            |()| file_path.display().to_string(),
            |url| url.as_str().to_string(),
        );
        Self {
            file_path,
            cache_key,
        }
    }

    /// Creates a provider with an explicit cache key.
    #[must_use]
    pub fn with_cache_key(file_path: PathBuf, cache_key: impl Into<String>) -> Self {
        Self {
            file_path,
            cache_key: cache_key.into(),
        }
    }
}

#[async_trait]
impl ImageDataProvider for LocalFileImageDataProvider {
    fn cache_key(&self) -> String {
        self.cache_key.clone()
    }

    fn content_url(&self) -> Option<Url> {
        Url::from_file_path(&self.file_path).ok()
    }

    async fn data(&self) -> Result<Bytes, BoxError> {
        let data = tokio::fs::read(&self.file_path).await?;
        Ok(Bytes::from(data))
    }
}

/// Decodes image data from a base64 string.
#[derive(Debug, Clone)]
pub struct Base64ImageDataProvider {
    base64_string: String,
    cache_key: String,
}

impl Base64ImageDataProvider {
    /// Creates the provider.
    #[must_use]
    pub fn new(base64_string: impl Into<String>, cache_key: impl Into<String>) -> Self {
        Self {
            base64_string: base64_string.into(),
            cache_key: cache_key.into(),
        }
    }
}

#[async_trait]
impl ImageDataProvider for Base64ImageDataProvider {
    fn cache_key(&self) -> String {
        self.cache_key.clone()
    }

    async fn data(&self) -> Result<Bytes, BoxError> {
        let data = base64::engine::general_purpose::STANDARD.decode(self.base64_string.trim())?;
        Ok(Bytes::from(data))
    }
}

/// Serves image data already held in memory.
#[derive(Debug, Clone)]
pub struct RawImageDataProvider {
    data: Bytes,
    cache_key: String,
}

impl RawImageDataProvider {
    /// Creates the provider.
    #[must_use]
    pub fn new(data: impl Into<Bytes>, cache_key: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            cache_key: cache_key.into(),
        }
    }
}

#[async_trait]
impl ImageDataProvider for RawImageDataProvider {
    fn cache_key(&self) -> String {
        self.cache_key.clone()
    }

    async fn data(&self) -> Result<Bytes, BoxError> {
        Ok(self.data.clone())
    }
}

/// Where an image comes from.
#[derive(Clone)]
pub enum Source {
    /// Downloaded over the network.
    Network(Arc<dyn Resource>),
    /// Produced by a data provider.
    Provider(Arc<dyn ImageDataProvider>),
}

impl Source {
    /// Creates a network source from a URL, keyed by the URL string.
    #[must_use]
    pub fn from_url(url: Url) -> Self {
        resource_into_source(Arc::new(url))
    }

    /// Creates a source from a provider.
    #[must_use]
    pub fn provider(provider: impl ImageDataProvider + 'static) -> Self {
        Self::Provider(Arc::new(provider))
    }

    /// Base cache key.
    #[must_use]
    pub fn cache_key(&self) -> String {
        match self {
            Self::Network(resource) => resource.cache_key(),
            Self::Provider(provider) => provider.cache_key(),
        }
    }

    /// Download URL or provider content URL.
    #[must_use]
    pub fn url(&self) -> Option<Url> {
        match self {
            Self::Network(resource) => Some(resource.download_url()),
            Self::Provider(provider) => provider.content_url(),
        }
    }

    /// The resource, for network sources.
    #[must_use]
    pub fn as_resource(&self) -> Option<&Arc<dyn Resource>> {
        match self {
            Self::Network(resource) => Some(resource),
            Self::Provider(_) => None,
        }
    }

    /// The provider, for provider sources.
    #[must_use]
    pub fn as_provider(&self) -> Option<&Arc<dyn ImageDataProvider>> {
        match self {
            Self::Network(_) => None,
            Self::Provider(provider) => Some(provider),
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(resource) => f
                .debug_struct("Network")
                .field("cache_key", &resource.cache_key())
                .field("url", &resource.download_url().as_str())
                .finish(),
            Self::Provider(provider) => f
                .debug_struct("Provider")
                .field("cache_key", &provider.cache_key())
                .finish_non_exhaustive(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(resource) => write!(f, "{}", resource.download_url()),
            Self::Provider(provider) => write!(f, "provider:{}", provider.cache_key()),
        }
    }
}
