//! Domain entity definitions.

mod cache_key;
mod expiration;
mod image;
mod source;

pub use cache_key::computed_key;
pub use expiration::{
    DISTANT_FUTURE_SECS, ExpirationExtending, SECONDS_IN_ONE_DAY, StorageExpiration,
    distant_future, distant_past, is_past,
};
pub use image::{
    CacheCostCalculable, CacheType, Image, ImageCacheResult, ImageLoadingResult,
    RetrieveImageResult,
};
pub use source::{
    Base64ImageDataProvider, BoxError, ImageDataProvider, ImageResource,
    LocalFileImageDataProvider, RawImageDataProvider, Resource, Source, resource_into_source,
};
