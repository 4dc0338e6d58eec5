//! Events published by the image cache.

use std::path::PathBuf;

use serde::Serialize;

use super::control::{DispatchPhase, Direction};

/// An item entered or left the image table
#[derive(Debug, Clone, PartialEq)]
pub struct ItemCacheChanged {
    pub path: PathBuf,
    pub cached: bool,
}

/// Decoding an item failed `attempts` times and is given up for this session
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeGaveUp {
    pub path: PathBuf,
    pub attempts: u32,
    pub error: String,
}

/// Aggregate cache status for status displays
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStatus {
    /// Effective budget
    pub max_mb: f64,
    pub min_mb: f64,
    pub current_mb: f64,
    pub target_first: Option<usize>,
    pub target_last: Option<usize>,
    pub current_key: usize,
    pub direction: Direction,
    pub phase: DispatchPhase,
    /// Any decoder busy or any dispatching in progress
    pub running: bool,
    pub busy_decoders: usize,
    pub total_items: usize,
    pub cached_items: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStatus {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

/// Events queued by the dispatcher while it holds its lock, emitted afterwards
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    ItemChanged(ItemCacheChanged),
    GaveUp(DecodeGaveUp),
}
