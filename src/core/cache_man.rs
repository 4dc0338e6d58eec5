//! Memory budget governor.
//!
//! **Why**: The configured budget is a ceiling, not a promise. When other
//! processes eat into system memory the effective budget shrinks so the cache
//! never asks for more than the OS can actually give, but it never drops below
//! the configured floor.
//!
//! **Used by**: Dispatcher, on every full re-plan.

use std::sync::{Arc, Mutex};

use log::{debug, info};
use sysinfo::System;

use super::control::CacheControl;
use super::item::BYTES_PER_MB;

/// OS collaborator reporting currently available memory
pub trait MemoryProbe: Send + Sync {
    fn available_mb(&self) -> f64;
}

/// Available memory via `sysinfo`
#[derive(Debug)]
pub struct SysinfoProbe {
    sys: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        info!(
            "System memory: {} MB total, {} MB available",
            sys.total_memory() / 1024 / 1024,
            sys.available_memory() / 1024 / 1024
        );

        Self { sys: Mutex::new(sys) }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn available_mb(&self) -> f64 {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_memory();
        sys.available_memory() as f64 / BYTES_PER_MB
    }
}

/// Probe returning a constant, for tests and for callers that manage memory themselves
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub f64);

impl MemoryProbe for FixedProbe {
    fn available_mb(&self) -> f64 {
        self.0
    }
}

/// Effective budget for the given usage and available memory.
///
/// Starts from `configured_max_mb`; if the room still wanted (plus headroom)
/// exceeds what is available, the budget shrinks to what usage plus available
/// memory allows, clamped to `min_mb`.
pub fn effective_budget(
    configured_max_mb: f64,
    min_mb: f64,
    current_mb: f64,
    headroom_mb: f64,
    available_mb: f64,
) -> f64 {
    let wanted = (configured_max_mb - current_mb).max(0.0) + headroom_mb;
    if wanted <= available_mb {
        return configured_max_mb.max(min_mb);
    }
    let shrunk = current_mb + (available_mb - headroom_mb).max(0.0);
    shrunk.min(configured_max_mb).max(min_mb)
}

/// Applies [`effective_budget`] to the session on each re-plan
#[derive(Clone)]
pub struct MemoryGovernor {
    probe: Arc<dyn MemoryProbe>,
    headroom_mb: f64,
}

impl std::fmt::Debug for MemoryGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGovernor")
            .field("headroom_mb", &self.headroom_mb)
            .finish()
    }
}

impl MemoryGovernor {
    pub fn new(probe: Arc<dyn MemoryProbe>, headroom_mb: f64) -> Self {
        Self { probe, headroom_mb }
    }

    /// Recompute `ctl.max_mb`. Returns true if the effective budget changed.
    pub fn govern(&self, ctl: &mut CacheControl) -> bool {
        let available = self.probe.available_mb();
        let budget = effective_budget(
            ctl.configured_max_mb,
            ctl.min_mb,
            ctl.current_mb,
            self.headroom_mb,
            available,
        );

        if (budget - ctl.max_mb).abs() < f64::EPSILON {
            return false;
        }

        if budget < ctl.configured_max_mb {
            info!(
                "Cache budget limited to {:.0} MB (configured {:.0} MB, {:.0} MB available)",
                budget, ctl.configured_max_mb, available
            );
        } else {
            debug!("Cache budget restored to {:.0} MB", budget);
        }
        ctl.max_mb = budget;
        true
    }
}
