//! Cache serializer port and built-in serializers.

use std::io::Cursor;

use image::ImageFormat;
use image::codecs::jpeg::JpegEncoder;
use tracing::warn;

use super::processor::ProcessingOptions;
use crate::domain::entities::Image;

/// Converts images to bytes for the disk tier and back.
pub trait CacheSerializer: Send + Sync {
    /// Encodes the image. `original` holds the downloaded bytes when they
    /// are still available.
    fn data(&self, image: &Image, original: Option<&[u8]>) -> Option<Vec<u8>>;

    /// Decodes bytes read from disk.
    fn image(&self, data: &[u8], options: &ProcessingOptions) -> Option<Image>;

    /// Whether [`CacheSerializer::data`] returns the original bytes
    /// verbatim when given them.
    fn original_data_used(&self) -> bool {
        false
    }
}

/// Re-encodes images in the format of their original data, PNG otherwise.
#[derive(Debug, Clone, Copy)]
pub struct DefaultCacheSerializer {
    /// Store the original bytes untouched when they are available.
    pub prefer_cache_original_data: bool,
    /// JPEG quality, 1 to 100.
    pub compression_quality: u8,
}

impl Default for DefaultCacheSerializer {
    fn default() -> Self {
        Self {
            prefer_cache_original_data: false,
            compression_quality: 90,
        }
    }
}

impl CacheSerializer for DefaultCacheSerializer {
    fn data(&self, image: &Image, original: Option<&[u8]>) -> Option<Vec<u8>> {
        if self.prefer_cache_original_data
            && let Some(original) = original
        {
            return Some(original.to_vec());
        }
        let format = original
            .and_then(|data| image::guess_format(data).ok())
            .unwrap_or(ImageFormat::Png);
        encode(image, format, self.compression_quality)
    }

    fn image(&self, data: &[u8], options: &ProcessingOptions) -> Option<Image> {
        options.decode(data)
    }

    fn original_data_used(&self) -> bool {
        self.prefer_cache_original_data
    }
}

/// Target format of [`FormatIndicatedCacheSerializer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatedFormat {
    /// Lossless PNG.
    Png,
    /// JPEG with the given quality.
    Jpeg {
        /// Quality, 1 to 100.
        quality: u8,
    },
    /// GIF, first frame only.
    Gif,
}

/// Always encodes in one fixed format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatIndicatedCacheSerializer {
    format: IndicatedFormat,
}

impl FormatIndicatedCacheSerializer {
    /// PNG serializer.
    #[must_use]
    pub const fn png() -> Self {
        Self {
            format: IndicatedFormat::Png,
        }
    }

    /// JPEG serializer with the given quality.
    #[must_use]
    pub const fn jpeg(quality: u8) -> Self {
        Self {
            format: IndicatedFormat::Jpeg { quality },
        }
    }

    /// GIF serializer.
    #[must_use]
    pub const fn gif() -> Self {
        Self {
            format: IndicatedFormat::Gif,
        }
    }
}

impl CacheSerializer for FormatIndicatedCacheSerializer {
    fn data(&self, image: &Image, _original: Option<&[u8]>) -> Option<Vec<u8>> {
        match self.format {
            IndicatedFormat::Png => encode(image, ImageFormat::Png, 100),
            IndicatedFormat::Jpeg { quality } => encode(image, ImageFormat::Jpeg, quality),
            IndicatedFormat::Gif => encode(image, ImageFormat::Gif, 100),
        }
    }

    fn image(&self, data: &[u8], options: &ProcessingOptions) -> Option<Image> {
        options.decode(data)
    }
}

fn encode(image: &Image, format: ImageFormat, quality: u8) -> Option<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    let result = match format {
        ImageFormat::Jpeg => {
            let rgb = image.as_dynamic().to_rgb8();
            let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
            rgb.write_with_encoder(encoder)
        }
        ImageFormat::Gif => image
            .as_dynamic()
            .to_rgba8()
            .write_to(&mut buffer, ImageFormat::Gif),
        ImageFormat::WebP => image
            .as_dynamic()
            .to_rgba8()
            .write_to(&mut buffer, ImageFormat::WebP),
        _ => image.as_dynamic().write_to(&mut buffer, ImageFormat::Png),
    };
    match result {
        Ok(()) => Some(buffer.into_inner()),
        Err(e) => {
            warn!(format = ?format, error = %e, "Failed to encode image");
            None
        }
    }
}
