//! Decoded image table: path -> (bitmap, size)
//!
//! Only the dispatcher mutates the table. Readers (UI, status display) take the
//! same mutex for short lookups; bitmaps are handed out as `Arc` clones so no
//! lock is held while an image is drawn.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use super::decoder::DecodedImage;

/// Lookup statistics for monitoring hit rate
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }
}

#[derive(Debug, Clone)]
struct TableEntry {
    image: Arc<DecodedImage>,
    size_mb: f64,
}

/// Guarded map of decoded images keyed by path
#[derive(Debug, Default)]
pub struct ImageTable {
    entries: Mutex<HashMap<PathBuf, TableEntry>>,
    stats: CacheStats,
}

impl ImageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a decoded image, counting a hit or miss.
    pub fn get(&self, path: &Path) -> Option<Arc<DecodedImage>> {
        let result = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.get(path).map(|e| Arc::clone(&e.image))
        };

        if result.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        result
    }

    /// Presence check without touching statistics
    pub fn contains(&self, path: &Path) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path)
    }

    /// Insert an image. Returns the size of a replaced entry, if any.
    pub fn insert(&self, path: PathBuf, image: Arc<DecodedImage>, size_mb: f64) -> Option<f64> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let replaced = entries
            .insert(path, TableEntry { image, size_mb })
            .map(|old| old.size_mb);
        if let Some(old) = replaced {
            debug!("Replaced table entry ({:.1} MB)", old);
        }
        replaced
    }

    /// Remove an entry, returning its size.
    pub fn remove(&self, path: &Path) -> Option<f64> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path)
            .map(|e| e.size_mb)
    }

    /// Keep only entries for which `keep` returns true. Returns total MB freed.
    pub fn retain(&self, mut keep: impl FnMut(&Path) -> bool) -> f64 {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut freed = 0.0;
        entries.retain(|path, entry| {
            let kept = keep(path);
            if !kept {
                freed += entry.size_mb;
            }
            kept
        });
        freed
    }

    /// Remove everything. Returns total MB freed.
    pub fn clear(&self) -> f64 {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let freed = entries.values().map(|e| e.size_mb).sum();
        let count = entries.len();
        entries.clear();
        debug!("Cleared image table: {} images, {:.1} MB", count, freed);
        freed
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// Sum of entry sizes
    pub fn total_mb(&self) -> f64 {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|e| e.size_mb)
            .sum()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}
