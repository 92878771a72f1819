//! Application layer: retrieval orchestration on top of the cache and the
//! downloader.

mod coordinator;
mod manager;
mod options;
mod slot;

pub use coordinator::{CacheCallbackCoordinator, CoordinatorAction, CoordinatorState};
pub use manager::{ImageManager, RetrieveTask, RetrievingContext};
pub use options::RetrieveOptions;
pub use slot::ImageSlot;
