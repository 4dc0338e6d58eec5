//! Per-item bookkeeping for the look-ahead cache.
//!
//! One `CacheItem` exists for every entry of the current browsing view, in view
//! order. The list is rebuilt wholesale on folder/filter/sort changes and
//! mutated in place on navigation, decode results and deletions.
//!
//! Decode parameters arrive asynchronously from the metadata loader and may be
//! filled in long after the item was created.

use std::path::PathBuf;
use std::sync::Arc;

/// Bytes per MB used for all size estimates and budgets.
pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Fallback size estimate for items without known dimensions (a 12 MP RGBA image).
pub const DEFAULT_SIZE_MB: f64 = 4000.0 * 3000.0 * 4.0 / BYTES_PER_MB;

/// Decoded RGBA footprint in MB for given pixel dimensions.
pub fn rgba_size_mb(width: u32, height: u32) -> f64 {
    width as f64 * height as f64 * 4.0 / BYTES_PER_MB
}

/// Parameters handed to the decoder together with the path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeParams {
    /// EXIF orientation tag (1-8), 0 or 1 = as stored
    pub orientation: u16,
    /// Additional user rotation in degrees (0, 90, 180, 270)
    pub rotation: u16,
    /// Byte offset of an embedded full-size JPEG (RAW files), if any
    pub offset: Option<u64>,
    /// Byte length of the embedded image
    pub length: Option<u64>,
    /// Embedded ICC color profile
    pub icc: Option<Arc<[u8]>>,
}

/// Metadata delivered by the metadata loader for one path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemMetadata {
    pub width: u32,
    pub height: u32,
    pub params: DecodeParams,
}

impl ItemMetadata {
    /// Estimated decoded footprint, `None` while dimensions are unknown.
    pub fn size_mb(&self) -> Option<f64> {
        if self.width == 0 || self.height == 0 {
            None
        } else {
            Some(rgba_size_mb(self.width, self.height))
        }
    }
}

/// One row of the ordered view as supplied by the sort/filter layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemSource {
    /// Index in the unsorted, unfiltered source list
    pub orig_key: usize,
    pub path: PathBuf,
    /// Size estimate, `None` = unknown (metadata not loaded yet)
    pub size_mb: Option<f64>,
}

impl ItemSource {
    pub fn new(orig_key: usize, path: impl Into<PathBuf>, size_mb: Option<f64>) -> Self {
        Self {
            orig_key,
            path: path.into(),
            size_mb,
        }
    }
}

/// Cache bookkeeping for one item in the current view.
#[derive(Debug, Clone)]
pub struct CacheItem {
    /// Index in current view order
    pub key: usize,
    pub orig_key: usize,
    pub path: PathBuf,
    /// Estimated decoded footprint; replaced by the real size once decoded
    pub size_mb: f64,
    pub is_target: bool,
    pub is_cached: bool,
    pub is_caching: bool,
    /// 0 = current item, lower = more important
    pub priority: usize,
    pub attempts: u32,
    /// Decoder currently (or last) bound to this item
    pub assigned_worker: Option<usize>,
    pub params: DecodeParams,
}

impl CacheItem {
    pub fn new(key: usize, source: ItemSource) -> Self {
        Self {
            key,
            orig_key: source.orig_key,
            path: source.path,
            size_mb: source.size_mb.unwrap_or(DEFAULT_SIZE_MB),
            is_target: false,
            is_cached: false,
            is_caching: false,
            priority: key,
            attempts: 0,
            assigned_worker: None,
            params: DecodeParams::default(),
        }
    }

    /// Apply late metadata. Returns true if the size estimate changed.
    pub fn apply_metadata(&mut self, meta: ItemMetadata) -> bool {
        let mut resized = false;
        // A decoded image already knows its real footprint
        if !self.is_cached {
            if let Some(size) = meta.size_mb() {
                resized = (size - self.size_mb).abs() > f64::EPSILON;
                self.size_mb = size;
            }
        }
        self.params = meta.params;
        resized
    }

    /// Drop all caching state (used for orphans and flag repair).
    pub fn reset_flags(&mut self) {
        self.is_cached = false;
        self.is_caching = false;
        self.assigned_worker = None;
    }
}
