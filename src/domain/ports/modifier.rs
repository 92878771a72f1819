//! Image modifier port.

use crate::domain::entities::Image;

/// Adjusts an image right before it is handed to the caller.
///
/// Unlike a processor, a modifier is applied on every delivery, including
/// cache hits, and its output is never written to the cache.
pub trait ImageModifier: Send + Sync {
    /// Returns the modified image.
    fn modify(&self, image: Image) -> Image;
}

impl<F> ImageModifier for F
where
    F: Fn(Image) -> Image + Send + Sync,
{
    fn modify(&self, image: Image) -> Image {
        self(image)
    }
}
