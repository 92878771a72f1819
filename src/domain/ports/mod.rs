mod modifier;
mod processor;
mod retry;
mod serializer;
mod transport;

pub use modifier::ImageModifier;
pub use processor::{
    ContentMode, DefaultImageProcessor, ImageProcessor, ProcessItem, ProcessingOptions,
    ResizingImageProcessor,
};
pub use retry::{DelayRetryStrategy, RetryContext, RetryDecision, RetryInterval, RetryStrategy};
pub use serializer::{
    CacheSerializer, DefaultCacheSerializer, FormatIndicatedCacheSerializer, IndicatedFormat,
};
pub use transport::{
    DownloadRequest, HttpTransport, TransportError, TransportResponse,
};

#[cfg(test)]
pub mod mocks {
    pub use super::transport::mock::{MockReply, MockTransport, png_bytes};
}
