//! Per-target task identity: only the latest request for a target may
//! deliver.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use super::manager::{ImageManager, RetrieveControl};
use super::options::RetrieveOptions;
use crate::domain::entities::{RetrieveImageResult, Source};
use crate::domain::errors::{ImageResult, ImageSettingErrorReason};

const NO_TASK: u64 = 0;

/// Holds the identity of the newest request issued for one display target.
///
/// Older requests keep running but resolve to `NotCurrentSourceTask`, and
/// their progress side effects stop firing.
pub struct ImageSlot {
    manager: Arc<ImageManager>,
    current: Arc<AtomicU64>,
    source: Mutex<Option<Source>>,
    control: Mutex<Option<Arc<RetrieveControl>>>,
}

impl ImageSlot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new(manager: Arc<ImageManager>) -> Self {
        Self {
            manager,
            current: Arc::new(AtomicU64::new(NO_TASK)),
            source: Mutex::new(None),
            control: Mutex::new(None),
        }
    }

    /// Identifier of the newest request, if any.
    #[must_use]
    pub fn task_identifier(&self) -> Option<u64> {
        match self.current.load(Ordering::SeqCst) {
            NO_TASK => None,
            identifier => Some(identifier),
        }
    }

    /// Source of the newest request.
    #[must_use]
    pub fn source(&self) -> Option<Source> {
        self.source.lock().clone()
    }

    /// Starts loading `source` into this slot, superseding any earlier
    /// request.
    pub fn set_image(
        &self,
        source: Source,
        mut options: RetrieveOptions,
    ) -> impl Future<Output = ImageResult<RetrieveImageResult>> + Send + 'static {
        let identifier = self.manager.next_identifier();
        self.current.store(identifier, Ordering::SeqCst);
        *self.source.lock() = Some(source.clone());

        options.progress = options
            .progress
            .into_iter()
            .map(|progress| {
                let current = self.current.clone();
                progress.with_should_apply(move || current.load(Ordering::SeqCst) == identifier)
            })
            .collect();

        let task = self
            .manager
            .retrieve_image_with_identifier(identifier, source.clone(), options);
        *self.control.lock() = Some(task.control());

        let current = self.current.clone();
        async move {
            let result = task.wait().await;
            if current.load(Ordering::SeqCst) == identifier {
                return result;
            }
            trace!(identifier, source = %source, "Discarding superseded result");
            Err(ImageSettingErrorReason::NotCurrentSourceTask { requested: source }.into())
        }
    }

    /// Cancels the newest request.
    pub fn cancel(&self) {
        if let Some(control) = self.control.lock().take() {
            control.cancel();
        }
    }
}

impl fmt::Debug for ImageSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageSlot")
            .field("task_identifier", &self.task_identifier())
            .field("source", &self.source())
            .finish_non_exhaustive()
    }
}
