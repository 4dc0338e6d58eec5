//! ImageCache: runtime handle around the dispatcher.
//!
//! Owns three things:
//! - the [`Dispatcher`] behind one mutex (the only place cache state changes)
//! - a control thread consuming [`Command`]s: UI requests and decoder reports
//!   go through the same channel, so they are processed strictly one at a time
//! - the [`DecoderPool`], whose report callback feeds that channel
//!
//! The UI thread never blocks on decoding: every mutating call just enqueues a
//! command. Lookups (`get`, `is_cached`) go straight to the image table.
//!
//! Events are collected while the dispatcher is locked and emitted on the
//! [`EventBus`] afterwards.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use log::{debug, info, warn};

use super::cache_events::{CacheEvent, CacheStatus};
use super::cache_man::{MemoryGovernor, MemoryProbe, SysinfoProbe};
use super::control::{DispatchPhase, Weighting};
use super::debounce::DebouncedSweep;
use super::decoder::{DecodeError, DecodedImage, ImageDecoder};
use super::dispatcher::Dispatcher;
use super::event_bus::EventBus;
use super::image_table::{CacheStats, ImageTable};
use super::item::{DecodeParams, ItemMetadata, ItemSource};
use super::workers::{DecodeJob, DecodeReport, DecoderPool};
use crate::config::{CacheSettings, OrphanSweep};

/// Upper bound for waiting on in-flight decodes during clear/shutdown
const ABORT_WAIT: Duration = Duration::from_secs(5);

/// Messages processed by the control thread
#[derive(Debug)]
enum Command {
    Rebuild { items: Vec<ItemSource>, current_key: usize },
    Navigate(usize),
    SetBudget { max_mb: f64, min_mb: f64 },
    SetWeighting(Weighting),
    Remove(Vec<PathBuf>),
    Metadata(Vec<(PathBuf, ItemMetadata)>),
    Decoded(DecodeReport),
    Clear,
    Shutdown,
}

struct Shared {
    dispatcher: Mutex<Dispatcher>,
    table: Arc<ImageTable>,
    bus: EventBus,
    /// Commands enqueued by the handle / fully processed by the control thread
    sent: AtomicU64,
    processed: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Dispatcher> {
        self.dispatcher.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count and enqueue a command. False if the control thread is gone.
    fn enqueue(&self, tx: &Sender<Command>, cmd: Command) -> bool {
        self.sent.fetch_add(1, Ordering::SeqCst);
        if tx.send(cmd).is_err() {
            self.sent.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn mark_processed(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Look-ahead cache of decoded images for one browsing session
pub struct ImageCache {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    control: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("images", &self.shared.table.len())
            .field("mb", &self.shared.table.total_mb())
            .finish()
    }
}

impl ImageCache {
    /// Start a cache using system memory probing.
    pub fn new(settings: &CacheSettings, decoder: Arc<dyn ImageDecoder>) -> std::io::Result<Self> {
        Self::with_probe(settings, decoder, Arc::new(SysinfoProbe::new()))
    }

    pub fn with_probe(
        settings: &CacheSettings,
        decoder: Arc<dyn ImageDecoder>,
        probe: Arc<dyn MemoryProbe>,
    ) -> std::io::Result<Self> {
        let num_decoders = settings.decoder_count();
        let table = Arc::new(ImageTable::new());
        let governor = MemoryGovernor::new(probe, settings.headroom_mb);
        let dispatcher = Dispatcher::new(
            settings.dispatcher_config(),
            num_decoders,
            Arc::clone(&table),
            governor,
        );

        let shared = Arc::new(Shared {
            dispatcher: Mutex::new(dispatcher),
            table,
            bus: EventBus::new(),
            sent: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        });

        let (tx, rx) = unbounded::<Command>();
        let report_tx = tx.clone();
        let report_shared = Arc::clone(&shared);
        let pool = DecoderPool::new(
            num_decoders,
            decoder,
            Arc::new(move |report: DecodeReport| {
                report_shared.enqueue(&report_tx, Command::Decoded(report));
            }),
        )?;

        let sweep = match settings.orphan_sweep {
            OrphanSweep::Debounced { delay_ms } => Some(DebouncedSweep::new(delay_ms)),
            OrphanSweep::OnSettle | OrphanSweep::Off => None,
        };

        let control_loop = ControlLoop {
            shared: Arc::clone(&shared),
            rx,
            tx: tx.clone(),
            pool,
            sweep,
            deferred: VecDeque::new(),
            last_status: None,
        };
        let control = thread::Builder::new()
            .name("pixcache-dispatcher".into())
            .spawn(move || control_loop.run())?;

        info!(
            "Image cache started: {} decoders, budget {:.0} MB (min {:.0} MB), weighting {}",
            num_decoders, settings.max_mb, settings.min_mb, settings.weighting
        );

        Ok(Self {
            shared,
            commands: tx,
            control: Some(control),
        })
    }

    fn send(&self, cmd: Command) {
        if !self.shared.enqueue(&self.commands, cmd) {
            warn!("Cache control thread is gone, command dropped");
        }
    }

    // ========== Requests ==========

    /// Replace the view. Images of surviving paths stay cached.
    pub fn rebuild(&self, items: Vec<ItemSource>, current_key: usize) {
        self.send(Command::Rebuild { items, current_key });
    }

    pub fn navigate(&self, key: usize) {
        self.send(Command::Navigate(key));
    }

    pub fn set_budget(&self, max_mb: f64, min_mb: f64) {
        self.send(Command::SetBudget { max_mb, min_mb });
    }

    pub fn set_weighting(&self, weighting: Weighting) {
        self.send(Command::SetWeighting(weighting));
    }

    pub fn remove(&self, paths: Vec<PathBuf>) {
        self.send(Command::Remove(paths));
    }

    pub fn update_metadata(&self, batch: Vec<(PathBuf, ItemMetadata)>) {
        if !batch.is_empty() {
            self.send(Command::Metadata(batch));
        }
    }

    /// Stop all decoding, wait for in-flight decodes, drop every image.
    pub fn clear(&self) {
        self.send(Command::Clear);
    }

    // ========== Lookups ==========

    /// Decoded image for `path`; counts a hit or miss.
    pub fn get(&self, path: &Path) -> Option<Arc<DecodedImage>> {
        self.shared.table.get(path)
    }

    /// Cached image, or a synchronous decode on the caller's thread. The
    /// fallback result is not inserted.
    pub fn get_or_decode(
        &self,
        path: &Path,
        params: &DecodeParams,
        decoder: &dyn ImageDecoder,
    ) -> Result<Arc<DecodedImage>, DecodeError> {
        match self.get(path) {
            Some(image) => Ok(image),
            None => decoder.decode(path, params).map(Arc::new),
        }
    }

    pub fn is_cached(&self, path: &Path) -> bool {
        self.shared.table.contains(path)
    }

    pub fn stats(&self) -> &CacheStats {
        self.shared.table.stats()
    }

    pub fn status(&self) -> CacheStatus {
        self.shared.lock().status()
    }

    /// Subscribe here for `ItemCacheChanged`, `DecodeGaveUp` and `CacheStatus`.
    pub fn events(&self) -> &EventBus {
        &self.shared.bus
    }

    /// Read-only access to the dispatcher state
    pub fn inspect<R>(&self, f: impl FnOnce(&Dispatcher) -> R) -> R {
        f(&self.shared.lock())
    }

    /// Block until every request so far is processed and no decoder is busy.
    /// Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let drained =
                self.shared.processed.load(Ordering::SeqCst) >= self.shared.sent.load(Ordering::SeqCst);
            if drained {
                let d = self.shared.lock();
                if d.phase() == DispatchPhase::Idle && d.busy_decoders() == 0 {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }
}

impl Drop for ImageCache {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.control.take() {
            if handle.join().is_err() {
                warn!("Cache control thread panicked");
            }
        }
    }
}

enum Wake {
    Command(Command),
    SweepDue,
    Closed,
}

/// State of the control thread
struct ControlLoop {
    shared: Arc<Shared>,
    rx: Receiver<Command>,
    /// Loops rejected jobs back as failed reports
    tx: Sender<Command>,
    pool: DecoderPool,
    sweep: Option<DebouncedSweep>,
    /// Commands that arrived while an abort was draining reports
    deferred: VecDeque<Command>,
    last_status: Option<CacheStatus>,
}

impl ControlLoop {
    fn run(mut self) {
        debug!("Cache control loop started");
        loop {
            match self.wait() {
                Wake::Command(Command::Shutdown) => {
                    self.abort();
                    break;
                }
                Wake::Command(Command::Clear) => {
                    self.abort();
                    self.shared.mark_processed();
                }
                Wake::Command(cmd) => self.handle(cmd),
                Wake::SweepDue => self.sweep_if_due(),
                Wake::Closed => break,
            }
        }
        debug!("Cache control loop stopped");
    }

    fn wait(&mut self) -> Wake {
        if let Some(cmd) = self.deferred.pop_front() {
            return Wake::Command(cmd);
        }
        match self.sweep.as_ref().and_then(DebouncedSweep::remaining) {
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(cmd) => Wake::Command(cmd),
                Err(RecvTimeoutError::Timeout) => Wake::SweepDue,
                Err(RecvTimeoutError::Disconnected) => Wake::Closed,
            },
            None => match self.rx.recv() {
                Ok(cmd) => Wake::Command(cmd),
                Err(_) => Wake::Closed,
            },
        }
    }

    fn handle(&mut self, cmd: Command) {
        let (jobs, events, status) = {
            let mut d = self.shared.lock();
            let jobs = match cmd {
                Command::Rebuild { items, current_key } => d.rebuild(items, current_key),
                Command::Navigate(key) => d.navigate(key),
                Command::SetBudget { max_mb, min_mb } => d.set_budget(max_mb, min_mb),
                Command::SetWeighting(weighting) => d.set_weighting(weighting),
                Command::Remove(paths) => d.remove(&paths),
                Command::Metadata(batch) => d.apply_metadata(batch),
                Command::Decoded(report) => d.complete(report),
                Command::Clear | Command::Shutdown => Vec::new(),
            };
            (jobs, d.take_events(), d.status())
        };

        self.submit(jobs);
        let idle = status.phase == DispatchPhase::Idle;
        self.publish(events, status);

        if let Some(sweep) = self.sweep.as_mut() {
            if idle { sweep.schedule() } else { sweep.postpone() }
        }
        self.shared.mark_processed();
    }

    fn submit(&self, jobs: Vec<DecodeJob>) {
        for job in jobs {
            if let Err(job) = self.pool.submit(job) {
                warn!("Decoder {} unavailable, failing {}", job.worker, job.path.display());
                let report = DecodeReport {
                    worker: job.worker,
                    epoch: job.epoch,
                    path: job.path,
                    result: Err(DecodeError::Io("decoder unavailable".into())),
                };
                self.shared.enqueue(&self.tx, Command::Decoded(report));
            }
        }
    }

    fn publish(&mut self, events: Vec<CacheEvent>, status: CacheStatus) {
        let bus = &self.shared.bus;
        for event in events {
            match event {
                CacheEvent::ItemChanged(e) => bus.emit(e),
                CacheEvent::GaveUp(e) => bus.emit(e),
            }
        }
        if self.last_status.as_ref() != Some(&status) {
            bus.emit(status.clone());
            self.last_status = Some(status);
        }
    }

    fn sweep_if_due(&mut self) {
        let due = self.sweep.as_mut().is_some_and(DebouncedSweep::tick);
        if !due {
            return;
        }
        let (events, status) = {
            let mut d = self.shared.lock();
            d.reconcile_orphans();
            (d.take_events(), d.status())
        };
        self.publish(events, status);
    }

    /// Cancel the session, consume reports of busy decoders, then clear.
    fn abort(&mut self) {
        self.shared.lock().token().cancel();

        let deadline = Instant::now() + ABORT_WAIT;
        while self.shared.lock().busy_decoders() > 0 {
            let timeout = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(timeout) {
                // Dispatching is off while the token is cancelled
                Ok(Command::Decoded(report)) => {
                    let _ = self.shared.lock().complete(report);
                    self.shared.mark_processed();
                }
                Ok(other) => self.deferred.push_back(other),
                Err(_) => {
                    warn!("Decoders still busy after {:?}, clearing anyway", ABORT_WAIT);
                    break;
                }
            }
        }

        let (events, status) = {
            let mut d = self.shared.lock();
            d.clear();
            (d.take_events(), d.status())
        };
        if let Some(sweep) = self.sweep.as_mut() {
            sweep.cancel();
        }
        self.publish(events, status);
    }
}
