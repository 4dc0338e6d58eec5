//! PIXCACHE - look-ahead decoded image cache for photo browsers
//!
//! Re-exports all modules for use by the binary target.

// Core engine (planning, dispatch, decoders, events)
pub mod core;

// App modules
pub mod cli;
pub mod config;

// Re-export commonly used types from core
pub use crate::core::event_bus::{BoxedEvent, EventBus, downcast_event};
pub use crate::core::{
    CacheStatus, DecodeError, DecodedImage, ImageCache, ImageCrateDecoder, ImageDecoder,
    ItemCacheChanged, ItemMetadata, ItemSource, Weighting,
};
pub use config::{CacheSettings, OrphanSweep};
