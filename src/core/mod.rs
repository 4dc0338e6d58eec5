//! Core cache engine: planning, dispatching, decoding and eviction.
//!
//! These modules are independent of any UI; collaborators talk to the
//! [`ImageCache`] handle and listen on its [`EventBus`].

pub mod cache_events;
pub mod cache_man;
pub mod control;
pub mod debounce;
pub mod decoder;
pub mod direction;
pub mod dispatcher;
pub mod event_bus;
pub mod image_cache;
pub mod image_table;
pub mod item;
pub mod planner;
pub mod workers;

// Re-exports for convenience
pub use cache_events::{CacheStatus, DecodeGaveUp, ItemCacheChanged};
pub use cache_man::{MemoryGovernor, MemoryProbe, SysinfoProbe};
pub use control::{CacheControl, Direction, DispatchPhase, Weighting};
pub use decoder::{DecodeError, DecodedImage, ImageCrateDecoder, ImageDecoder};
pub use dispatcher::Dispatcher;
pub use event_bus::EventBus;
pub use image_cache::ImageCache;
pub use image_table::{CacheStats, ImageTable};
pub use item::{CacheItem, DecodeParams, ItemMetadata, ItemSource};
