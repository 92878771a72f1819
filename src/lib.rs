//! imagekeep - image retrieval with a two-tier cache.
//!
//! Images are looked up in memory, then on disk, and only then downloaded
//! or read from a data provider. Concurrent requests for one URL share a
//! single transfer.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Application layer with the retrieval manager.
pub mod application;
/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing caches, network and configuration.
pub mod infrastructure;

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "imagekeep";
