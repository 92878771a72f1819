//! Image processing port and built-in processors.

use std::fmt;

use bytes::Bytes;
use image::imageops::FilterType;
use tracing::trace;

use crate::domain::entities::Image;

/// Input handed to a processor: raw bytes or an already decoded image.
#[derive(Debug, Clone)]
pub enum ProcessItem {
    /// A decoded image.
    Image(Image),
    /// Raw encoded bytes.
    Data(Bytes),
}

impl ProcessItem {
    /// Short label used in logs and errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Image(_) => "image",
            Self::Data(_) => "data",
        }
    }
}

/// Decoding hints shared by processors and serializers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingOptions {
    /// Decode with this format instead of sniffing the bytes.
    pub format_hint: Option<image::ImageFormat>,
}

impl ProcessingOptions {
    /// Decodes `data` honoring the format hint.
    #[must_use]
    pub fn decode(&self, data: &[u8]) -> Option<Image> {
        let decoded = match self.format_hint {
            Some(format) => image::load_from_memory_with_format(data, format),
            None => image::load_from_memory(data),
        };
        match decoded {
            Ok(image) => Some(Image::new(image)),
            Err(e) => {
                trace!(error = %e, len = data.len(), "Failed to decode image data");
                None
            }
        }
    }
}

/// Turns raw data or an image into the image that gets cached and
/// returned.
///
/// Processors are identified by [`ImageProcessor::identifier`]; the
/// identifier is appended to cache keys so renditions never collide.
pub trait ImageProcessor: Send + Sync {
    /// Identifier appended to cache keys. Empty for the default processor.
    fn identifier(&self) -> String;

    /// Processes the item. `None` means processing failed.
    fn process(&self, item: &ProcessItem, options: &ProcessingOptions) -> Option<Image>;

    /// Returns whether this is the pass-through processor.
    fn is_default(&self) -> bool {
        self.identifier().is_empty()
    }
}

impl fmt::Debug for dyn ImageProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageProcessor")
            .field("identifier", &self.identifier())
            .finish()
    }
}

/// Decodes data and passes images through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultImageProcessor;

impl ImageProcessor for DefaultImageProcessor {
    fn identifier(&self) -> String {
        String::new()
    }

    fn process(&self, item: &ProcessItem, options: &ProcessingOptions) -> Option<Image> {
        match item {
            ProcessItem::Image(image) => Some(image.clone()),
            ProcessItem::Data(data) => options.decode(data),
        }
    }
}

/// How a resized image relates to the target size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContentMode {
    /// Fit inside the target size, keeping the aspect ratio.
    #[default]
    Fit,
    /// Fill the target size, cropping the overflow.
    Fill,
    /// Stretch to exactly the target size.
    Exact,
}

/// Resizes images with a Lanczos3 filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizingImageProcessor {
    width: u32,
    height: u32,
    mode: ContentMode,
}

impl ResizingImageProcessor {
    /// Creates a processor that fits images into `width` x `height`.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            mode: ContentMode::Fit,
        }
    }

    /// Sets the content mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: ContentMode) -> Self {
        self.mode = mode;
        self
    }

    /// Parses a `WxH` size string.
    #[must_use]
    pub fn parse(size: &str) -> Option<Self> {
        let (width, height) = size.split_once(['x', 'X'])?;
        let width = width.trim().parse().ok()?;
        let height = height.trim().parse().ok()?;
        (width > 0 && height > 0).then(|| Self::new(width, height))
    }

    fn resize(&self, image: &Image) -> Image {
        if image.width() == self.width && image.height() == self.height {
            return image.clone();
        }
        let source = image.as_dynamic();
        let resized = match self.mode {
            ContentMode::Fit => source.resize(self.width, self.height, FilterType::Lanczos3),
            ContentMode::Fill => source.resize_to_fill(self.width, self.height, FilterType::Lanczos3),
            ContentMode::Exact => source.resize_exact(self.width, self.height, FilterType::Lanczos3),
        };
        Image::new(resized)
    }
}

impl ImageProcessor for ResizingImageProcessor {
    fn identifier(&self) -> String {
        match self.mode {
            ContentMode::Fit => format!("resize-{}x{}", self.width, self.height),
            ContentMode::Fill => format!("resize-{}x{}-fill", self.width, self.height),
            ContentMode::Exact => format!("resize-{}x{}-exact", self.width, self.height),
        }
    }

    fn process(&self, item: &ProcessItem, options: &ProcessingOptions) -> Option<Image> {
        match item {
            ProcessItem::Image(image) => Some(self.resize(image)),
            ProcessItem::Data(_) => DefaultImageProcessor
                .process(item, options)
                .map(|image| self.resize(&image)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::mocks::png_bytes;
    use test_case::test_case;

    #[test]
    fn test_default_processor_decodes_data() {
        let item = ProcessItem::Data(Bytes::from(png_bytes(3, 2)));
        let image = DefaultImageProcessor.process(&item, &ProcessingOptions::default());
        assert_eq!(image.map(|i| (i.width(), i.height())), Some((3, 2)));
        assert!(DefaultImageProcessor.is_default());
    }

    #[test]
    fn test_default_processor_rejects_garbage() {
        let item = ProcessItem::Data(Bytes::from_static(b"not an image"));
        assert!(
            DefaultImageProcessor
                .process(&item, &ProcessingOptions::default())
                .is_none()
        );
    }

    #[test_case(ContentMode::Fit, (10, 5) ; "fit")]
    #[test_case(ContentMode::Fill, (10, 10) ; "fill")]
    #[test_case(ContentMode::Exact, (10, 10) ; "exact")]
    fn test_resizing(mode: ContentMode, expected: (u32, u32)) {
        let processor = ResizingImageProcessor::new(10, 10).with_mode(mode);
        let item = ProcessItem::Image(Image::new(image::DynamicImage::new_rgba8(40, 20)));
        let image = processor.process(&item, &ProcessingOptions::default());
        assert_eq!(image.map(|i| (i.width(), i.height())), Some(expected));
        assert!(!processor.is_default());
    }

    #[test_case("64x32", Some("resize-64x32") ; "plain")]
    #[test_case("8X8", Some("resize-8x8") ; "uppercase")]
    #[test_case("0x8", None ; "zero")]
    #[test_case("abc", None ; "garbage")]
    fn test_parse(input: &str, identifier: Option<&str>) {
        assert_eq!(
            ResizingImageProcessor::parse(input).map(|p| p.identifier()),
            identifier.map(String::from)
        );
    }
}
