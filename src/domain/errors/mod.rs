//! Domain error types.

mod image_error;

pub use image_error::{
    CacheErrorReason, ImageError, ImageResult, ImageSettingErrorReason, ProcessorErrorReason,
    PropagationError, RequestErrorReason, ResponseErrorReason,
};
