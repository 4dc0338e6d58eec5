//! Dispatcher: the cache's control state machine.
//!
//! **Why**: Navigation, budget changes, view rebuilds and decoder results all
//! mutate the same item list and image table. Funnelling every mutation through
//! one owned object (held under one mutex by the runtime) makes each step
//! atomic: a re-plan always completes before the next dispatch or result is
//! processed.
//!
//! **Used by**: `ImageCache` control thread; tests drive it synchronously.
//!
//! # Phases
//!
//! `Idle` -> `Planning` (direction, priorities, target window) -> `Dispatching`
//! (every Ready decoder gets the most important undecoded target) -> `Draining`
//! (nothing left to assign, decoders still busy) -> `Idle`.
//!
//! # Invariants
//!
//! - A path is bound to at most one decoder at a time. An item that is
//!   `is_caching` is only handed out again to the decoder that already owns it,
//!   after that decoder's own failed attempt.
//! - Every image table entry belongs to an item with `is_cached`.
//! - Dispatching never happens while the session token is cancelled.
//!
//! Results that no longer match the view (older epoch, removed path) are
//! dropped without touching any item.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, info, trace, warn};

use super::cache_events::{CacheEvent, CacheStatus, DecodeGaveUp, ItemCacheChanged};
use super::cache_man::MemoryGovernor;
use super::control::{CacheControl, DispatchPhase, Weighting};
use super::decoder::{DecodeError, DecodedImage};
use super::direction::update_direction;
use super::image_table::ImageTable;
use super::item::{CacheItem, ItemMetadata, ItemSource};
use super::planner::{assign_priorities, select_targets};
use super::workers::{CancelToken, DecodeJob, DecodeReport};

/// Default decode retry cap
pub const MAX_ATTEMPTS: u32 = 5;

/// Size estimate error tolerated without re-planning
const SIZE_EPSILON_MB: f64 = 0.01;

/// Decoder state as seen by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Ready,
    Busy,
    /// Result delivered, not yet consumed
    Done,
}

#[derive(Debug, Clone, Default)]
struct WorkerSlot {
    state: WorkerState,
    /// Path being decoded while Busy
    path: Option<PathBuf>,
    epoch: u64,
    /// Item kept reserved after this decoder's failed attempt
    retry: Option<PathBuf>,
}

/// Tunables of the dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_mb: f64,
    pub min_mb: f64,
    pub weighting: Weighting,
    pub max_attempts: u32,
    /// Run orphan reconciliation whenever a dispatch round settles
    pub sweep_on_settle: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_mb: 2048.0,
            min_mb: 256.0,
            weighting: Weighting::Even,
            max_attempts: MAX_ATTEMPTS,
            sweep_on_settle: true,
        }
    }
}

/// Owned cache state: item list, session control and decoder bookkeeping
#[derive(Debug)]
pub struct Dispatcher {
    items: IndexMap<PathBuf, CacheItem>,
    ctl: CacheControl,
    table: Arc<ImageTable>,
    governor: MemoryGovernor,
    workers: Vec<WorkerSlot>,
    phase: DispatchPhase,
    max_attempts: u32,
    sweep_on_settle: bool,
    epoch: u64,
    token: CancelToken,
    events: Vec<CacheEvent>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        num_workers: usize,
        table: Arc<ImageTable>,
        governor: MemoryGovernor,
    ) -> Self {
        let mut ctl = CacheControl::new(config.max_mb, config.min_mb, config.weighting);
        ctl.max_mb = config.max_mb.max(config.min_mb);

        Self {
            items: IndexMap::new(),
            ctl,
            table,
            governor,
            workers: vec![WorkerSlot::default(); num_workers.max(1)],
            phase: DispatchPhase::Idle,
            max_attempts: config.max_attempts.max(1),
            sweep_on_settle: config.sweep_on_settle,
            epoch: 0,
            token: CancelToken::new(),
            events: Vec::new(),
        }
    }

    // ========== Events from collaborators ==========

    /// Replace the view (new folder content, filter or sort change).
    ///
    /// Images already decoded for paths that survive stay cached; all others
    /// are removed from the table. Decodes in flight for surviving paths keep
    /// their reservation.
    pub fn rebuild(&mut self, sources: Vec<ItemSource>, current_key: usize) -> Vec<DecodeJob> {
        let old = std::mem::take(&mut self.items);
        let mut items: IndexMap<PathBuf, CacheItem> = IndexMap::with_capacity(sources.len());

        for source in sources {
            if items.contains_key(&source.path) {
                warn!("Duplicate path in view ignored: {}", source.path.display());
                continue;
            }
            let mut item = CacheItem::new(items.len(), source);
            if let Some(prev) = old.get(&item.path) {
                item.attempts = prev.attempts;
                item.params = prev.params.clone();
                if prev.is_cached && self.table.contains(&item.path) {
                    item.is_cached = true;
                    item.size_mb = prev.size_mb;
                }
            }
            if let Some(worker) = self.busy_worker_for(&item.path) {
                item.is_caching = true;
                item.assigned_worker = Some(worker);
            }
            items.insert(item.path.clone(), item);
        }
        self.items = items;

        for slot in &mut self.workers {
            slot.retry = None;
        }

        // Filter-exclusion cleanup
        let excluded: Vec<PathBuf> = self
            .table
            .paths()
            .into_iter()
            .filter(|p| !self.items.get(p).is_some_and(|i| i.is_cached))
            .collect();
        for path in excluded {
            self.drop_table_entry(path);
        }

        let kept = self.items.values().filter(|i| i.is_cached).count();
        info!("View rebuilt: {} items, {} still cached", self.items.len(), kept);

        self.ctl.reset();
        let key = current_key.min(self.items.len().saturating_sub(1));
        self.ctl.current_key = key;
        self.navigate(key)
    }

    /// Full reset (folder change, abort): cancel the session, forget every
    /// item and image. Decoders still busy report into the old epoch and
    /// their results are discarded.
    pub fn clear(&mut self) {
        self.token.cancel();
        self.token = CancelToken::new();
        self.epoch += 1;

        for path in self.table.paths() {
            self.events.push(CacheEvent::ItemChanged(ItemCacheChanged { path, cached: false }));
        }
        self.table.clear();
        self.items.clear();
        self.ctl.reset();
        self.ctl.current_mb = 0.0;
        for slot in &mut self.workers {
            slot.retry = None;
        }
        self.phase = if self.busy_decoders() > 0 {
            DispatchPhase::Draining
        } else {
            DispatchPhase::Idle
        };

        info!("Cache cleared (epoch {})", self.epoch);
    }

    /// Current position changed
    pub fn navigate(&mut self, key: usize) -> Vec<DecodeJob> {
        let n = self.items.len();
        if n == 0 {
            self.ctl.current_key = 0;
            return self.replan();
        }

        let key = key.min(n - 1);
        update_direction(&mut self.ctl, key, n);
        self.plan();
        self.dispatch()
    }

    /// Budget preference changed
    pub fn set_budget(&mut self, max_mb: f64, min_mb: f64) -> Vec<DecodeJob> {
        info!("Cache budget set: max {:.0} MB, min {:.0} MB", max_mb, min_mb);
        self.ctl.configured_max_mb = max_mb;
        self.ctl.min_mb = min_mb;
        self.ctl.max_mb = max_mb.max(min_mb);
        self.replan()
    }

    /// Ahead/behind weighting preference changed
    pub fn set_weighting(&mut self, weighting: Weighting) -> Vec<DecodeJob> {
        debug!("Weighting: {} -> {}", self.ctl.weighting, weighting);
        self.ctl.set_weighting(weighting);
        self.replan()
    }

    /// Items deleted from the view
    pub fn remove(&mut self, paths: &[PathBuf]) -> Vec<DecodeJob> {
        let mut removed = 0;
        for path in paths {
            let Some((idx, path, item)) = self.items.shift_remove_full(path.as_path()) else {
                continue;
            };
            removed += 1;
            if idx < self.ctl.current_key {
                self.ctl.current_key -= 1;
            }
            if idx < self.ctl.previous_key {
                self.ctl.previous_key -= 1;
            }
            if item.is_cached {
                self.drop_table_entry(path);
            }
        }

        if removed == 0 {
            return Vec::new();
        }

        for (i, item) in self.items.values_mut().enumerate() {
            item.key = i;
        }
        let last = self.items.len().saturating_sub(1);
        self.ctl.current_key = self.ctl.current_key.min(last);
        self.ctl.previous_key = self.ctl.previous_key.min(last);

        debug!("Removed {} items, current key now {}", removed, self.ctl.current_key);
        self.replan()
    }

    /// Metadata arrived for some items. Re-plans once if any size estimate changed.
    pub fn apply_metadata(&mut self, batch: Vec<(PathBuf, ItemMetadata)>) -> Vec<DecodeJob> {
        let mut resized = false;
        for (path, meta) in batch {
            match self.items.get_mut(&path) {
                Some(item) => resized |= item.apply_metadata(meta),
                None => trace!("Metadata for unknown path {}", path.display()),
            }
        }

        if resized { self.replan() } else { Vec::new() }
    }

    /// Consume one decoder result and hand out follow-up work.
    pub fn complete(&mut self, report: DecodeReport) -> Vec<DecodeJob> {
        let DecodeReport { worker, epoch, path, result } = report;
        let Some(slot) = self.workers.get_mut(worker) else {
            warn!("Report from unknown decoder {}", worker);
            return Vec::new();
        };
        slot.state = WorkerState::Done;
        slot.path = None;

        let mut resized = false;
        if epoch != self.epoch {
            debug!("Stale report (epoch {} != {}) for {}", epoch, self.epoch, path.display());
            self.release(&path, worker);
        } else {
            match self.items.get_index_of(&path) {
                Some(idx) => resized = self.consume(worker, idx, result),
                None => debug!("Stale report for {} (no longer in view)", path.display()),
            }
        }

        self.workers[worker].state = WorkerState::Ready;
        // Window was sized with an estimate
        if resized {
            self.plan();
        }
        self.dispatch()
    }

    // ========== Planning ==========

    /// Re-plan and dispatch without a position change
    pub fn replan(&mut self) -> Vec<DecodeJob> {
        if self.items.is_empty() {
            self.ctl.target_first = None;
            self.ctl.target_last = None;
        } else {
            self.plan();
        }
        self.dispatch()
    }

    fn plan(&mut self) {
        self.phase = DispatchPhase::Planning;
        self.governor.govern(&mut self.ctl);

        let priorities = assign_priorities(
            self.ctl.current_key,
            self.ctl.direction,
            self.ctl.ahead_weight,
            self.ctl.behind_weight,
            self.items.len(),
        );
        let sizes: Vec<f64> = self.items.values().map(|i| i.size_mb).collect();
        let window = select_targets(&priorities, &sizes, self.ctl.current_key, self.ctl.max_mb);

        self.ctl.target_first = window.map(|(first, _)| first);
        self.ctl.target_last = window.map(|(_, last)| last);

        for (i, (item, &priority)) in self.items.values_mut().zip(&priorities).enumerate() {
            item.priority = priority;
            item.is_target = window.is_some_and(|(first, last)| i >= first && i <= last);
        }

        debug!(
            "Planned key {} {:?}: target {:?}, budget {:.0}/{:.0} MB",
            self.ctl.current_key, self.ctl.direction, window, self.ctl.current_mb, self.ctl.max_mb
        );
    }

    // ========== Dispatching ==========

    /// Give every Ready decoder its next item.
    pub fn dispatch(&mut self) -> Vec<DecodeJob> {
        let mut jobs = Vec::new();

        if !self.token.is_cancelled() {
            for worker in 0..self.workers.len() {
                if self.workers[worker].state != WorkerState::Ready {
                    continue;
                }
                match self.next_to_cache(worker) {
                    Some(idx) => jobs.push(self.assign(worker, idx)),
                    None => self.release_retry(worker),
                }
            }
        }

        self.update_phase();
        jobs
    }

    /// Most important undecoded target item `worker` may take.
    ///
    /// Scans the target window in view order. Items reserved by another
    /// decoder are skipped; the decoder's own reservation (after a failure)
    /// is eligible for a retry.
    pub fn next_to_cache(&self, worker: usize) -> Option<usize> {
        let (first, last) = self.window()?;
        let last = last.min(self.items.len().checked_sub(1)?);

        let mut best: Option<usize> = None;
        for i in first..=last {
            let item = &self.items[i];
            let eligible = !item.is_cached
                && item.attempts < self.max_attempts
                && (!item.is_caching || item.assigned_worker == Some(worker));
            if eligible && best.is_none_or(|b| item.priority < self.items[b].priority) {
                best = Some(i);
            }
        }
        best
    }

    /// Least important cached item (largest priority), scanning the whole list
    /// from the end.
    pub fn next_to_decache(&self) -> Option<usize> {
        self.least_important_cached(false)
    }

    fn least_important_cached(&self, outside_window_only: bool) -> Option<usize> {
        let mut worst: Option<usize> = None;
        for i in (0..self.items.len()).rev() {
            let item = &self.items[i];
            let candidate = item.is_cached && !(outside_window_only && item.is_target);
            if candidate && worst.is_none_or(|w| item.priority > self.items[w].priority) {
                worst = Some(i);
            }
        }
        worst
    }

    fn assign(&mut self, worker: usize, idx: usize) -> DecodeJob {
        if let Some(held) = self.workers[worker].retry.take() {
            if held != self.items[idx].path {
                self.release(&held, worker);
            }
        }

        let item = &mut self.items[idx];
        item.is_caching = true;
        item.assigned_worker = Some(worker);

        let slot = &mut self.workers[worker];
        slot.state = WorkerState::Busy;
        slot.path = Some(item.path.clone());
        slot.epoch = self.epoch;

        trace!(
            "Decoder {} <- key {} prio {} (attempt {}) {}",
            worker,
            item.key,
            item.priority,
            item.attempts + 1,
            item.path.display()
        );

        DecodeJob {
            worker,
            epoch: self.epoch,
            path: item.path.clone(),
            params: item.params.clone(),
            token: self.token.clone(),
        }
    }

    /// Drop `worker`'s reservation on `path`, if it still holds one.
    fn release(&mut self, path: &Path, worker: usize) {
        if let Some(item) = self.items.get_mut(path) {
            if item.is_caching && item.assigned_worker == Some(worker) {
                item.is_caching = false;
                item.assigned_worker = None;
            }
        }
    }

    fn release_retry(&mut self, worker: usize) {
        if let Some(held) = self.workers[worker].retry.take() {
            self.release(&held, worker);
        }
    }

    fn update_phase(&mut self) {
        self.phase = if self.busy_decoders() == 0 {
            self.settle();
            DispatchPhase::Idle
        } else if self.has_unassigned_work() {
            DispatchPhase::Dispatching
        } else {
            DispatchPhase::Draining
        };
    }

    fn settle(&mut self) {
        self.phase = DispatchPhase::Draining;
        if self.sweep_on_settle {
            self.reconcile_orphans();
        }
    }

    /// A target item nobody is decoding and that is still worth a try
    fn has_unassigned_work(&self) -> bool {
        let Some((first, last)) = self.window() else {
            return false;
        };
        self.items
            .values()
            .skip(first)
            .take(last + 1 - first)
            .any(|i| !i.is_cached && !i.is_caching && i.attempts < self.max_attempts)
    }

    // ========== Results & eviction ==========

    /// Returns true if the item's size estimate was off.
    fn consume(&mut self, worker: usize, idx: usize, result: Result<DecodedImage, DecodeError>) -> bool {
        match result {
            Ok(image) => return self.insert_decoded(idx, image),
            Err(DecodeError::Cancelled) => {
                let path = self.items[idx].path.clone();
                self.release(&path, worker);
            }
            Err(e) => {
                let max_attempts = self.max_attempts;
                let item = &mut self.items[idx];
                item.attempts += 1;
                let path = item.path.clone();

                if item.attempts >= max_attempts {
                    item.is_caching = false;
                    item.assigned_worker = None;
                    warn!("Giving up on {} after {} attempts: {}", path.display(), item.attempts, e);
                    self.events.push(CacheEvent::GaveUp(DecodeGaveUp {
                        path,
                        attempts: item.attempts,
                        error: e.to_string(),
                    }));
                } else {
                    // Stay reserved for this decoder's retry
                    item.is_caching = true;
                    item.assigned_worker = Some(worker);
                    debug!("Decode failed ({}/{}) {}: {}", item.attempts, max_attempts, path.display(), e);
                    self.workers[worker].retry = Some(path);
                }
            }
        }
        false
    }

    fn insert_decoded(&mut self, idx: usize, image: DecodedImage) -> bool {
        let size = image.size_mb();
        // A late result outside the window must not push out window images
        self.make_room(size, !self.items[idx].is_target);

        let path = self.items[idx].path.clone();
        if let Some(old) = self.table.insert(path.clone(), Arc::new(image), size) {
            self.ctl.current_mb = (self.ctl.current_mb - old).max(0.0);
        }
        self.ctl.current_mb += size;

        let item = &mut self.items[idx];
        let resized = (item.size_mb - size).abs() > SIZE_EPSILON_MB;
        item.size_mb = size;
        item.is_cached = true;
        item.is_caching = false;
        item.assigned_worker = None;

        if self.ctl.current_mb > self.ctl.max_mb {
            debug!(
                "Over budget after inserting {}: {:.1}/{:.1} MB",
                path.display(),
                self.ctl.current_mb,
                self.ctl.max_mb
            );
        } else {
            trace!("Cached key {} ({:.1} MB) {}", item.key, size, path.display());
        }
        self.events.push(CacheEvent::ItemChanged(ItemCacheChanged { path, cached: true }));
        resized
    }

    /// Evict least important images until `size_mb` fits. Gives up when
    /// nothing is left to evict; the insert then goes over budget.
    fn make_room(&mut self, size_mb: f64, outside_window_only: bool) {
        while self.ctl.max_mb - self.ctl.current_mb < size_mb {
            match self.least_important_cached(outside_window_only) {
                Some(idx) => self.evict(idx),
                None => break,
            }
        }
    }

    fn evict(&mut self, idx: usize) {
        let held = self.held_by_busy_decoder(idx);
        let item = &mut self.items[idx];
        if held {
            item.is_cached = false;
        } else {
            item.reset_flags();
        }
        let path = item.path.clone();
        debug!("Evicted key {} prio {} {}", item.key, item.priority, path.display());
        self.drop_table_entry(path);
    }

    fn drop_table_entry(&mut self, path: PathBuf) {
        if let Some(size) = self.table.remove(&path) {
            self.ctl.current_mb = (self.ctl.current_mb - size).max(0.0);
            self.events.push(CacheEvent::ItemChanged(ItemCacheChanged { path, cached: false }));
        }
    }

    // ========== Orphans ==========

    /// Repair state left behind by superseded target windows.
    ///
    /// - reservations outside the window whose decoder moved on are released
    /// - cached images outside the window are evicted
    /// - `is_cached` flags without a table entry are cleared, table entries
    ///   without a cached item are dropped
    ///
    /// Returns the number of repairs.
    pub fn reconcile_orphans(&mut self) -> usize {
        let mut repaired = 0;

        for idx in 0..self.items.len() {
            let held = self.held_by_busy_decoder(idx);
            let item = &mut self.items[idx];
            if item.is_caching && !item.is_target && !held {
                item.is_caching = false;
                item.assigned_worker = None;
                repaired += 1;
            }
        }

        let outside: Vec<usize> = (0..self.items.len())
            .filter(|&i| self.items[i].is_cached && !self.items[i].is_target)
            .collect();
        repaired += outside.len();
        for idx in outside {
            self.evict(idx);
        }

        for item in self.items.values_mut() {
            if item.is_cached && !self.table.contains(&item.path) {
                warn!("Cached flag without image, reset: {}", item.path.display());
                item.is_cached = false;
                repaired += 1;
                self.events.push(CacheEvent::ItemChanged(ItemCacheChanged {
                    path: item.path.clone(),
                    cached: false,
                }));
            }
        }

        let items = &self.items;
        let freed = self.table.retain(|p| items.get(p).is_some_and(|i| i.is_cached));
        if freed > 0.0 {
            warn!("Dropped {:.1} MB of images without a cached item", freed);
            repaired += 1;
        }
        self.ctl.current_mb = self.table.total_mb();

        if repaired > 0 {
            debug!("Orphan sweep repaired {} items", repaired);
        }
        repaired
    }

    fn held_by_busy_decoder(&self, idx: usize) -> bool {
        let item = &self.items[idx];
        item.assigned_worker.is_some_and(|w| {
            self.workers.get(w).is_some_and(|slot| {
                slot.state == WorkerState::Busy
                    && slot.epoch == self.epoch
                    && slot.path.as_deref() == Some(item.path.as_path())
            })
        })
    }

    fn busy_worker_for(&self, path: &Path) -> Option<usize> {
        self.workers.iter().position(|slot| {
            slot.state == WorkerState::Busy
                && slot.epoch == self.epoch
                && slot.path.as_deref() == Some(path)
        })
    }

    // ========== Queries ==========

    fn window(&self) -> Option<(usize, usize)> {
        self.ctl.target_first.zip(self.ctl.target_last)
    }

    pub fn status(&self) -> CacheStatus {
        let busy = self.busy_decoders();
        CacheStatus {
            max_mb: self.ctl.max_mb,
            min_mb: self.ctl.min_mb,
            current_mb: self.ctl.current_mb,
            target_first: self.ctl.target_first,
            target_last: self.ctl.target_last,
            current_key: self.ctl.current_key,
            direction: self.ctl.direction,
            phase: self.phase,
            running: busy > 0 || self.phase != DispatchPhase::Idle,
            busy_decoders: busy,
            total_items: self.items.len(),
            cached_items: self.items.values().filter(|i| i.is_cached).count(),
            hits: self.table.stats().hits(),
            misses: self.table.stats().misses(),
        }
    }

    /// Take events queued since the last call
    pub fn take_events(&mut self) -> Vec<CacheEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn items(&self) -> impl Iterator<Item = &CacheItem> {
        self.items.values()
    }

    pub fn item(&self, path: &Path) -> Option<&CacheItem> {
        self.items.get(path)
    }

    pub fn item_at(&self, key: usize) -> Option<&CacheItem> {
        self.items.get_index(key).map(|(_, item)| item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn control(&self) -> &CacheControl {
        &self.ctl
    }

    pub fn phase(&self) -> DispatchPhase {
        self.phase
    }

    pub fn worker_state(&self, worker: usize) -> Option<WorkerState> {
        self.workers.get(worker).map(|s| s.state)
    }

    pub fn busy_decoders(&self) -> usize {
        self.workers.iter().filter(|s| s.state == WorkerState::Busy).count()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn table(&self) -> &Arc<ImageTable> {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache_man::FixedProbe;
    use crate::core::control::Direction;
    use crate::core::item::DecodeParams;
    use std::collections::{HashSet, VecDeque};

    fn path(i: usize) -> PathBuf {
        PathBuf::from(format!("/photos/img_{:04}.jpg", i))
    }

    fn sources(n: usize, size_mb: f64) -> Vec<ItemSource> {
        (0..n).map(|i| ItemSource::new(i, path(i), Some(size_mb))).collect()
    }

    fn dispatcher(max_mb: f64, workers: usize) -> Dispatcher {
        let config = DispatcherConfig {
            max_mb,
            min_mb: 1.0,
            ..Default::default()
        };
        let governor = MemoryGovernor::new(Arc::new(FixedProbe(1_000_000.0)), 0.0);
        Dispatcher::new(config, workers, Arc::new(ImageTable::new()), governor)
    }

    /// 512x512 RGBA = 1 MB per unit
    fn image_mb(mb: u32) -> DecodedImage {
        DecodedImage::blank(512, 512 * mb)
    }

    fn ok_report(job: &DecodeJob, mb: u32) -> DecodeReport {
        DecodeReport {
            worker: job.worker,
            epoch: job.epoch,
            path: job.path.clone(),
            result: Ok(image_mb(mb)),
        }
    }

    fn err_report(job: &DecodeJob) -> DecodeReport {
        DecodeReport {
            worker: job.worker,
            epoch: job.epoch,
            path: job.path.clone(),
            result: Err(DecodeError::Image("corrupt".into())),
        }
    }

    /// Complete jobs one at a time (FIFO) until no work is left.
    fn drain(d: &mut Dispatcher, jobs: Vec<DecodeJob>, mut decode: impl FnMut(&DecodeJob) -> DecodeReport) {
        let mut queue: VecDeque<DecodeJob> = jobs.into();
        while let Some(job) = queue.pop_front() {
            let report = decode(&job);
            queue.extend(d.complete(report));
        }
    }

    fn cached_keys(d: &Dispatcher) -> Vec<usize> {
        d.items().filter(|i| i.is_cached).map(|i| i.key).collect()
    }

    fn assert_table_consistent(d: &Dispatcher) {
        for p in d.table().paths() {
            assert!(d.item(&p).is_some_and(|i| i.is_cached), "orphan table entry {}", p.display());
        }
        let total: f64 = d.items().filter(|i| i.is_cached).map(|i| i.size_mb).sum();
        assert!((total - d.table().total_mb()).abs() < 1e-9);
        assert!((d.control().current_mb - d.table().total_mb()).abs() < 1e-9);
    }

    #[test]
    fn test_initial_window_from_start() {
        let mut d = dispatcher(4.0, 2);
        let jobs = d.rebuild(sources(10, 1.0), 0);

        assert_eq!(d.control().target_first, Some(0));
        assert_eq!(d.control().target_last, Some(3));
        assert_eq!(jobs.len(), 2);
        assert_eq!(d.phase(), DispatchPhase::Dispatching);

        drain(&mut d, jobs, |j| ok_report(j, 1));
        assert_eq!(cached_keys(&d), vec![0, 1, 2, 3]);
        assert_eq!(d.control().current_mb, 4.0);
        assert_eq!(d.phase(), DispatchPhase::Idle);
        assert_table_consistent(&d);
    }

    #[test]
    fn test_jump_to_end_forces_backward() {
        let mut d = dispatcher(4.0, 2);
        let jobs = d.rebuild(sources(10, 1.0), 0);
        drain(&mut d, jobs, |j| ok_report(j, 1));

        let jobs = d.navigate(9);
        assert_eq!(d.control().direction, Direction::Backward);
        assert_eq!(d.control().target_first, Some(6));
        assert_eq!(d.control().target_last, Some(9));

        drain(&mut d, jobs, |j| ok_report(j, 1));
        assert_eq!(cached_keys(&d), vec![6, 7, 8, 9]);
        assert!(d.control().current_mb <= 4.0);
        assert_table_consistent(&d);
    }

    #[test]
    fn test_jobs_follow_priority_order() {
        let mut d = dispatcher(6.0, 1);
        let jobs = d.rebuild(sources(20, 1.0), 10);
        let mut order = Vec::new();
        drain(&mut d, jobs, |j| {
            order.push(j.path.clone());
            ok_report(j, 1)
        });
        // 1:1 forward from 10: 10, 11, 9, 12, 8, 13
        let expected: Vec<PathBuf> = [10, 11, 9, 12, 8, 13].into_iter().map(path).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_backtracking_keeps_window_direction() {
        let mut d = dispatcher(4.0, 1);
        let jobs = d.rebuild(sources(10, 1.0), 5);
        drain(&mut d, jobs, |j| ok_report(j, 1));

        for key in [4, 5, 4] {
            let jobs = d.navigate(key);
            drain(&mut d, jobs, |j| ok_report(j, 1));
            assert_eq!(d.control().direction, Direction::Forward);
        }
    }

    #[test]
    fn test_failed_item_is_retried() {
        let mut d = dispatcher(4.0, 2);
        let jobs = d.rebuild(sources(10, 1.0), 6);
        let mut failures = 0;
        drain(&mut d, jobs, |j| {
            if j.path == path(7) && failures < 2 {
                failures += 1;
                err_report(j)
            } else {
                ok_report(j, 1)
            }
        });

        let item = d.item(&path(7)).unwrap();
        assert_eq!(item.attempts, 2);
        assert!(item.is_cached);
        assert!(!item.is_caching);
    }

    #[test]
    fn test_retry_stays_with_same_decoder() {
        let mut d = dispatcher(4.0, 2);
        let jobs = d.rebuild(sources(10, 1.0), 0);
        let first = jobs.iter().find(|j| j.path == path(0)).cloned().unwrap();

        let next = d.complete(err_report(&first));
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].worker, first.worker);
        assert_eq!(next[0].path, path(0));

        // The other decoder never sees the reserved item
        let other = 1 - first.worker;
        assert_ne!(d.next_to_cache(other), Some(0));
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut d = dispatcher(4.0, 2);
        let jobs = d.rebuild(sources(10, 1.0), 0);
        drain(&mut d, jobs, |j| if j.path == path(2) { err_report(j) } else { ok_report(j, 1) });

        let item = d.item(&path(2)).unwrap();
        assert_eq!(item.attempts, MAX_ATTEMPTS);
        assert!(!item.is_cached && !item.is_caching);
        assert_eq!(d.phase(), DispatchPhase::Idle);

        let gave_up: Vec<_> = d
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                CacheEvent::GaveUp(g) => Some(g),
                _ => None,
            })
            .collect();
        assert_eq!(gave_up.len(), 1);
        assert_eq!(gave_up[0].path, path(2));
    }

    #[test]
    fn test_filter_during_decode_discards_report() {
        let mut d = dispatcher(4.0, 4);
        let jobs = d.rebuild(sources(10, 1.0), 2);
        assert_eq!(jobs.len(), 4);
        assert!(jobs.iter().any(|j| j.path == path(4)));

        // Filter removes items 3..=5 while their decodes are in flight
        let filtered: Vec<ItemSource> = (0..10)
            .filter(|i| !(3..=5).contains(i))
            .map(|i| ItemSource::new(i, path(i), Some(1.0)))
            .collect();
        let more = d.rebuild(filtered, 2);
        assert!(more.is_empty());

        drain(&mut d, jobs, |j| ok_report(j, 1));
        assert!(d.item(&path(4)).is_none());
        assert!(!d.table().contains(&path(4)));
        assert!(!d.table().contains(&path(3)));
        assert_eq!(d.phase(), DispatchPhase::Idle);
        assert_table_consistent(&d);
    }

    #[test]
    fn test_rebuild_keeps_surviving_images() {
        let mut d = dispatcher(4.0, 2);
        let jobs = d.rebuild(sources(10, 1.0), 0);
        drain(&mut d, jobs, |j| ok_report(j, 1));

        // Reverse sort: old items 0..=3 are now at the end
        let reversed: Vec<ItemSource> = (0..10).rev().map(|i| ItemSource::new(i, path(i), Some(1.0))).collect();
        let jobs = d.rebuild(reversed, 9);
        assert!(jobs.is_empty());
        assert_eq!(cached_keys(&d), vec![6, 7, 8, 9]);
        assert_eq!(d.item_at(9).map(|i| i.path.clone()), Some(path(0)));
    }

    #[test]
    fn test_no_duplicate_assignment() {
        let mut d = dispatcher(8.0, 3);
        let mut in_flight: Vec<DecodeJob> = d.rebuild(sources(30, 1.0), 10);

        for (step, key) in [12usize, 3, 25, 24, 29, 0, 15].into_iter().enumerate() {
            in_flight.extend(d.navigate(key));
            // Finish one outstanding job per step, in varying order
            if !in_flight.is_empty() {
                let job = in_flight.remove(step % in_flight.len());
                in_flight.extend(d.complete(ok_report(&job, 1)));
            }
            let paths: HashSet<_> = in_flight.iter().map(|j| j.path.clone()).collect();
            assert_eq!(paths.len(), in_flight.len());
            let workers: HashSet<_> = in_flight.iter().map(|j| j.worker).collect();
            assert_eq!(workers.len(), in_flight.len());
        }

        drain(&mut d, in_flight, |j| ok_report(j, 1));
        assert_eq!(d.phase(), DispatchPhase::Idle);
        assert_table_consistent(&d);
    }

    #[test]
    fn test_eviction_prefers_lowest_priority_outside_window() {
        let mut d = dispatcher(4.0, 1);
        let jobs = d.rebuild(sources(10, 1.0), 0);
        drain(&mut d, jobs, |j| ok_report(j, 1));

        // Move forward: 4 becomes a target, 0 falls out and ranks last
        let jobs = d.navigate(2);
        assert!(!d.item(&path(0)).unwrap().is_target);
        let victim = d.next_to_decache().unwrap();
        assert_eq!(victim, 0);
        assert!(!d.control().in_target(victim));

        drain(&mut d, jobs, |j| ok_report(j, 1));
        assert_eq!(cached_keys(&d), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_late_result_outside_window_keeps_window_images() {
        let mut d = dispatcher(4.0, 2);
        let jobs = d.rebuild(sources(20, 1.0), 10);
        let late = jobs.iter().find(|j| j.path == path(11)).cloned().unwrap();
        let early: Vec<DecodeJob> = jobs.into_iter().filter(|j| j.path == path(10)).collect();

        // Jump to the start while both decoders are still busy
        assert!(d.navigate(0).is_empty());
        assert_eq!((d.control().target_first, d.control().target_last), (Some(0), Some(3)));

        drain(&mut d, early, |j| ok_report(j, 1));
        assert_eq!(cached_keys(&d), vec![0, 1, 2, 3]);
        d.take_events();

        // Item 11 arrives with the budget full of window images
        let follow_up = d.complete(ok_report(&late, 1));
        assert!(follow_up.is_empty(), "no window image was evicted and re-queued");
        assert_eq!(cached_keys(&d), vec![0, 1, 2, 3]);
        assert!(!d.table().contains(&path(11)), "swept once the round settled");

        let evicted: Vec<PathBuf> = d
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                CacheEvent::ItemChanged(c) if !c.cached => Some(c.path),
                _ => None,
            })
            .collect();
        assert_eq!(evicted, vec![path(11)]);
        assert_table_consistent(&d);
    }

    #[test]
    fn test_tight_memory_narrows_window_down_to_floor() {
        let config = DispatcherConfig {
            max_mb: 10.0,
            min_mb: 3.0,
            ..Default::default()
        };
        let tight = MemoryGovernor::new(Arc::new(FixedProbe(6.0)), 0.0);
        let mut d = Dispatcher::new(config.clone(), 2, Arc::new(ImageTable::new()), tight);
        let jobs = d.rebuild(sources(20, 1.0), 0);
        // Wants 10 MB, only 6 MB available
        assert_eq!(d.control().max_mb, 6.0);
        assert_eq!(d.control().target_last, Some(5));
        drain(&mut d, jobs, |j| ok_report(j, 1));
        assert!(d.control().current_mb <= 6.0);

        let starved = MemoryGovernor::new(Arc::new(FixedProbe(0.5)), 0.0);
        let mut d = Dispatcher::new(config, 2, Arc::new(ImageTable::new()), starved);
        let jobs = d.rebuild(sources(20, 1.0), 0);
        assert_eq!(d.control().max_mb, 3.0);
        assert_eq!(d.control().target_last, Some(2));

        // Re-plans after inserts keep the floor even as usage grows
        drain(&mut d, jobs, |j| ok_report(j, 1));
        assert!(d.control().max_mb >= 3.0);
        assert_eq!(cached_keys(&d), vec![0, 1, 2]);
        assert_eq!(d.replan().len(), 0);
        assert!(d.control().max_mb >= 3.0);
    }

    #[test]
    fn test_oversized_image_inserted_over_budget() {
        let mut d = dispatcher(4.0, 1);
        let jobs = d.rebuild(sources(3, 1.0), 0);
        drain(&mut d, jobs, |j| ok_report(j, if j.path == path(0) { 10 } else { 1 }));

        assert!(d.table().contains(&path(0)));
        assert!(d.control().current_mb >= 10.0);
        // Re-planned with the real size: only the current item fits
        assert_eq!((d.control().target_first, d.control().target_last), (Some(0), Some(0)));
        assert_eq!(d.phase(), DispatchPhase::Idle);
    }

    #[test]
    fn test_budget_bound_under_random_navigation() {
        let mut d = dispatcher(12.0, 3);
        let mut jobs = d.rebuild(sources(60, 2.0), 0);
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..300 {
            if next() % 3 == 0 {
                jobs.extend(d.navigate((next() % 60) as usize));
            }
            if !jobs.is_empty() {
                let job = jobs.remove((next() % jobs.len() as u64) as usize);
                let mb = 1 + (next() % 3) as u32;
                jobs.extend(d.complete(ok_report(&job, mb)));
            }
            let cached: f64 = d.items().filter(|i| i.is_cached).map(|i| i.size_mb).sum();
            assert!(cached <= d.control().max_mb + 3.0, "cached {} MB", cached);
        }
        drain(&mut d, jobs, |j| ok_report(j, 2));
        assert_table_consistent(&d);
    }

    #[test]
    fn test_window_always_contains_key() {
        let mut d = dispatcher(5.0, 2);
        let jobs = d.rebuild(sources(40, 1.0), 0);
        drain(&mut d, jobs, |j| ok_report(j, 1));
        for key in [39, 0, 20, 21, 19, 18, 17, 5] {
            let jobs = d.navigate(key);
            let (first, last) = (d.control().target_first.unwrap(), d.control().target_last.unwrap());
            assert!(first <= key && key <= last);
            let targets: Vec<usize> = d.items().filter(|i| i.is_target).map(|i| i.key).collect();
            assert_eq!(targets, (first..=last).collect::<Vec<_>>());
            drain(&mut d, jobs, |j| ok_report(j, 1));
        }
    }

    #[test]
    fn test_orphan_sweep_after_superseded_window() {
        let mut d = dispatcher(4.0, 2);
        let jobs = d.rebuild(sources(20, 1.0), 0);
        // Jump away before the first decodes finish
        let more = d.navigate(15);
        assert!(more.is_empty());

        let all: Vec<DecodeJob> = jobs;
        drain(&mut d, all, |j| ok_report(j, 1));

        assert_eq!(d.phase(), DispatchPhase::Idle);
        let cached = cached_keys(&d);
        assert!(cached.iter().all(|&k| d.control().in_target(k)), "{:?}", cached);
        assert!(d.items().all(|i| !i.is_caching));
        assert_table_consistent(&d);
    }

    #[test]
    fn test_sweep_disabled_leaves_orphans_until_reconciled() {
        let config = DispatcherConfig {
            max_mb: 4.0,
            min_mb: 1.0,
            sweep_on_settle: false,
            ..Default::default()
        };
        let governor = MemoryGovernor::new(Arc::new(FixedProbe(1_000_000.0)), 0.0);
        let mut d = Dispatcher::new(config, 2, Arc::new(ImageTable::new()), governor);

        let jobs = d.rebuild(sources(20, 1.0), 0);
        drain(&mut d, jobs, |j| ok_report(j, 1));

        // New window is still being decoded; the old one is orphaned
        let jobs = d.navigate(15);
        assert_eq!(jobs.len(), 2);
        assert_eq!(d.items().filter(|i| i.is_cached && !i.is_target).count(), 4);

        assert_eq!(d.reconcile_orphans(), 4);
        assert!(d.items().all(|i| !i.is_cached || i.is_target));
        assert!(d.item(&path(15)).unwrap().is_caching, "in-flight reservation kept");
        assert_table_consistent(&d);

        drain(&mut d, jobs, |j| ok_report(j, 1));
        assert_eq!(cached_keys(&d), vec![14, 15, 16, 17]);
    }

    #[test]
    fn test_inconsistent_flags_are_repaired() {
        let mut d = dispatcher(4.0, 2);
        let jobs = d.rebuild(sources(10, 1.0), 0);
        drain(&mut d, jobs, |j| ok_report(j, 1));

        // Image vanished behind the dispatcher's back, and a stray entry appeared
        d.table().remove(&path(1));
        d.table().insert(PathBuf::from("/elsewhere.jpg"), Arc::new(image_mb(1)), 1.0);

        assert!(d.reconcile_orphans() >= 2);
        assert!(!d.item(&path(1)).unwrap().is_cached);
        assert!(!d.table().contains(Path::new("/elsewhere.jpg")));
        assert_table_consistent(&d);

        // The repaired item is decoded again on the next pass
        let jobs = d.replan();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].path, path(1));
    }

    #[test]
    fn test_clear_discards_in_flight_results() {
        let mut d = dispatcher(4.0, 2);
        let jobs = d.rebuild(sources(10, 1.0), 0);
        d.clear();
        assert!(d.is_empty());
        assert_eq!(d.phase(), DispatchPhase::Draining);

        // Same folder reopened before the old decodes report back
        let fresh = d.rebuild(sources(10, 1.0), 0);
        assert!(fresh.is_empty(), "decoders still busy with the old epoch");

        let mut follow_up = Vec::new();
        for job in &jobs {
            follow_up.extend(d.complete(ok_report(job, 1)));
        }
        assert!(d.table().is_empty());
        assert_eq!(follow_up.len(), 2);
        assert!(follow_up.iter().all(|j| j.epoch == d.epoch()));

        drain(&mut d, follow_up, |j| ok_report(j, 1));
        assert_eq!(cached_keys(&d), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_remove_renumbers_and_shifts_current() {
        let mut d = dispatcher(4.0, 2);
        let jobs = d.rebuild(sources(10, 1.0), 5);
        drain(&mut d, jobs, |j| ok_report(j, 1));
        assert!(d.item(&path(5)).unwrap().is_cached);

        let jobs = d.remove(&[path(1), path(5), path(42)]);
        assert_eq!(d.len(), 8);
        assert_eq!(d.control().current_key, 4);
        assert_eq!(d.item_at(4).map(|i| i.path.clone()), Some(path(6)));
        assert!(!d.table().contains(&path(5)));
        assert!(d.items().enumerate().all(|(i, item)| item.key == i));

        drain(&mut d, jobs, |j| ok_report(j, 1));
        assert_table_consistent(&d);
    }

    #[test]
    fn test_removing_every_item_empties_window() {
        let mut d = dispatcher(4.0, 2);
        let jobs = d.rebuild(sources(5, 1.0), 0);
        drain(&mut d, jobs, |j| ok_report(j, 1));
        assert_eq!(d.status().target_last, Some(3));

        let all: Vec<PathBuf> = (0..5).map(path).collect();
        assert!(d.remove(&all).is_empty());

        let status = d.status();
        assert_eq!(status.total_items, 0);
        assert_eq!((status.target_first, status.target_last), (None, None));
        assert!(!d.control().in_target(0));
        assert!(d.table().is_empty());
        assert_eq!(d.phase(), DispatchPhase::Idle);
    }

    #[test]
    fn test_metadata_grows_window() {
        let mut d = dispatcher(64.0, 2);
        let unknown: Vec<ItemSource> = (0..10).map(|i| ItemSource::new(i, path(i), None)).collect();
        let jobs = d.rebuild(unknown, 0);
        // Default 12 MP estimate: only a single ~46 MB item fits
        assert_eq!(d.control().target_last, Some(0));

        let batch = (0..10)
            .map(|i| {
                let meta = ItemMetadata {
                    width: 1024,
                    height: 1024,
                    params: DecodeParams { orientation: 1, ..Default::default() },
                };
                (path(i), meta)
            })
            .collect();
        let more = d.apply_metadata(batch);
        assert_eq!(d.control().target_last, Some(9));
        assert!(!more.is_empty());

        let mut all = jobs;
        all.extend(more);
        drain(&mut d, all, |j| ok_report(j, 4));
        assert_eq!(d.status().cached_items, 10);
    }

    #[test]
    fn test_status_reflects_state() {
        let mut d = dispatcher(4.0, 2);
        let jobs = d.rebuild(sources(10, 1.0), 0);
        let status = d.status();
        assert!(status.running);
        assert_eq!(status.busy_decoders, 2);
        assert_eq!(status.total_items, 10);
        assert_eq!(d.worker_state(0), Some(WorkerState::Busy));
        assert_eq!(d.worker_state(2), None);

        drain(&mut d, jobs, |j| ok_report(j, 1));
        assert_eq!(d.worker_state(0), Some(WorkerState::Ready));
        assert_eq!(d.worker_state(1), Some(WorkerState::Ready));
        let status = d.status();
        assert!(!status.running);
        assert_eq!(status.cached_items, 4);
        assert_eq!((status.target_first, status.target_last), (Some(0), Some(3)));
    }

    #[test]
    fn test_empty_view() {
        let mut d = dispatcher(4.0, 2);
        assert!(d.rebuild(Vec::new(), 0).is_empty());
        assert!(d.navigate(3).is_empty());
        assert_eq!(d.control().target_first, None);
        assert_eq!(d.phase(), DispatchPhase::Idle);
    }
}
