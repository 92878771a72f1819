//! Decides when a freshly loaded image may be delivered relative to its
//! cache writes.

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::error;

/// Progress of the cache writes for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Nothing finished yet.
    Idle,
    /// The processed image is stored; the original is pending.
    ImageCached,
    /// The original is stored; the processed image is pending.
    OriginalImageCached,
    /// Delivery was triggered.
    Done,
}

/// Event fed into the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorAction {
    /// All cache writes were issued.
    CacheInitiated,
    /// The processed image write finished.
    CachingImage,
    /// The original data write finished.
    CachingOriginalImage,
}

/// Fires its trigger exactly once, as soon as delivery is allowed.
#[derive(Debug)]
pub struct CacheCallbackCoordinator {
    should_wait_for_cache: bool,
    should_cache_original: bool,
    state: Mutex<CoordinatorState>,
    trigger: Mutex<Option<oneshot::Sender<()>>>,
}

impl CacheCallbackCoordinator {
    /// Creates a coordinator and the receiver its trigger resolves.
    #[must_use]
    pub fn new(should_wait_for_cache: bool, should_cache_original: bool) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                should_wait_for_cache,
                should_cache_original,
                state: Mutex::new(CoordinatorState::Idle),
                trigger: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        *self.state.lock()
    }

    /// Applies an action. Returns true if it fired the trigger.
    pub fn apply(&self, action: CoordinatorAction) -> bool {
        use CoordinatorAction::{CacheInitiated, CachingImage, CachingOriginalImage};
        use CoordinatorState::{Done, Idle, ImageCached, OriginalImageCached};

        let fire = {
            let mut state = self.state.lock();
            let (next, fire) = match (*state, action) {
                (Done, _) => return false,
                (Idle, CacheInitiated) if self.should_wait_for_cache => (Idle, false),
                (Idle, CacheInitiated) => (Done, true),
                (Idle, CachingImage) if self.should_cache_original => (ImageCached, false),
                (Idle, CachingImage) => (Done, true),
                (Idle, CachingOriginalImage) => (OriginalImageCached, false),
                (ImageCached, CachingOriginalImage) | (OriginalImageCached, CachingImage) => {
                    (Done, true)
                }
                (current, action) => {
                    error!(?current, ?action, "Unexpected cache coordinator transition");
                    debug_assert!(false, "unexpected transition {current:?} on {action:?}");
                    (current, false)
                }
            };
            *state = next;
            fire
        };

        if fire && let Some(trigger) = self.trigger.lock().take() {
            let _ = trigger.send(());
        }
        fire
    }
}
