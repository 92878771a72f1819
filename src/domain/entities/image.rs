//! Decoded image values and retrieval results.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use url::Url;

use super::source::Source;

/// Types whose in-memory footprint can be estimated.
pub trait CacheCostCalculable {
    /// Estimated cost in bytes.
    fn cache_cost(&self) -> usize;
}

/// A decoded bitmap shared by reference.
#[derive(Clone)]
pub struct Image {
    inner: Arc<image::DynamicImage>,
}

impl Image {
    /// Wraps a decoded image.
    #[must_use]
    pub fn new(image: image::DynamicImage) -> Self {
        Self {
            inner: Arc::new(image),
        }
    }

    /// Decodes an image from raw bytes, guessing the format.
    ///
    /// # Errors
    /// Returns the decoder error if the bytes are not a supported image.
    pub fn decode(data: &[u8]) -> image::ImageResult<Self> {
        image::load_from_memory(data).map(Self::new)
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.inner.width()
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.inner.height()
    }

    /// Borrows the decoded bitmap.
    #[must_use]
    pub fn as_dynamic(&self) -> &image::DynamicImage {
        &self.inner
    }

    /// Returns the shared bitmap.
    #[must_use]
    pub fn shared(&self) -> Arc<image::DynamicImage> {
        Arc::clone(&self.inner)
    }

    /// Returns true if both values point at the same bitmap.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl From<image::DynamicImage> for Image {
    fn from(image: image::DynamicImage) -> Self {
        Self::new(image)
    }
}

impl CacheCostCalculable for Image {
    fn cache_cost(&self) -> usize {
        let pixels = u64::from(self.width()) * u64::from(self.height()) * 4;
        usize::try_from(pixels).unwrap_or(usize::MAX)
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// The cache tier an image was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheType {
    /// Not served from a cache.
    #[default]
    None,
    /// Served from the memory tier.
    Memory,
    /// Served from the disk tier.
    Disk,
}

impl CacheType {
    /// Returns true for the memory and disk tiers.
    #[must_use]
    pub const fn is_cached(self) -> bool {
        matches!(self, Self::Memory | Self::Disk)
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Memory => write!(f, "memory"),
            Self::Disk => write!(f, "disk"),
        }
    }
}

/// Result of looking an image up in a two-tier cache.
#[derive(Debug, Clone)]
pub enum ImageCacheResult {
    /// Found on disk (and promoted to memory).
    Disk(Image),
    /// Found in memory.
    Memory(Image),
    /// Not cached.
    None,
}

impl ImageCacheResult {
    /// The image, if any.
    #[must_use]
    pub fn image(&self) -> Option<&Image> {
        match self {
            Self::Disk(image) | Self::Memory(image) => Some(image),
            Self::None => None,
        }
    }

    /// Consumes the result, returning the image.
    #[must_use]
    pub fn into_image(self) -> Option<Image> {
        match self {
            Self::Disk(image) | Self::Memory(image) => Some(image),
            Self::None => None,
        }
    }

    /// The tier the image came from.
    #[must_use]
    pub const fn cache_type(&self) -> CacheType {
        match self {
            Self::Disk(_) => CacheType::Disk,
            Self::Memory(_) => CacheType::Memory,
            Self::None => CacheType::None,
        }
    }
}

/// Image produced by a download or a data provider.
#[derive(Debug, Clone)]
pub struct ImageLoadingResult {
    /// Processed image.
    pub image: Image,
    /// URL the data came from, if any.
    pub url: Option<Url>,
    /// Raw bytes before processing.
    pub original_data: Bytes,
}

/// Final outcome of a top-level retrieval.
#[derive(Debug, Clone)]
pub struct RetrieveImageResult {
    /// The image.
    pub image: Image,
    /// Tier it was served from; `None` when freshly loaded.
    pub cache_type: CacheType,
    /// The source that produced the image.
    pub source: Source,
    /// The source originally requested.
    pub original_source: Source,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_is_rgba_bytes() {
        let image = Image::new(image::DynamicImage::new_rgb8(10, 20));
        assert_eq!(image.cache_cost(), 800);
    }

    #[test]
    fn test_cache_result_accessors() {
        let image = Image::new(image::DynamicImage::new_rgb8(1, 1));
        let result = ImageCacheResult::Disk(image.clone());
        assert_eq!(result.cache_type(), CacheType::Disk);
        assert!(result.image().is_some_and(|i| i.ptr_eq(&image)));
        assert!(ImageCacheResult::None.image().is_none());
        assert!(!CacheType::None.is_cached());
    }
}
