//! Decoder pool: one thread per decoder, one job at a time.
//!
//! Each decoder owns a single-slot job channel. The dispatcher binds exactly one
//! path to one idle decoder and the decoder answers with exactly one
//! [`DecodeReport`] through the completion callback, whether the decode
//! succeeded, failed or was cancelled before it started.
//!
//! The Ready/Busy/Done state of every decoder is tracked by the dispatcher, not
//! here; threads themselves only block on their job channel or inside the
//! decode call.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Sender, bounded};
use log::{debug, trace};

use super::decoder::{DecodeError, DecodedImage, ImageDecoder};
use super::item::DecodeParams;

/// Shared cancellation flag for one cache session
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One unit of work for one decoder
#[derive(Debug, Clone)]
pub struct DecodeJob {
    pub worker: usize,
    /// Session epoch the job belongs to
    pub epoch: u64,
    pub path: PathBuf,
    pub params: DecodeParams,
    pub token: CancelToken,
}

/// Result of one job, delivered exactly once per dispatch
#[derive(Debug)]
pub struct DecodeReport {
    pub worker: usize,
    pub epoch: u64,
    pub path: PathBuf,
    pub result: Result<DecodedImage, DecodeError>,
}

impl DecodeReport {
    /// Report for a job that never reached the decoder
    pub fn cancelled(job: DecodeJob) -> Self {
        Self {
            worker: job.worker,
            epoch: job.epoch,
            path: job.path,
            result: Err(DecodeError::Cancelled),
        }
    }
}

/// Completion callback invoked on the decoder thread
pub type ReportFn = Arc<dyn Fn(DecodeReport) + Send + Sync>;

/// Fixed pool of decoder threads
pub struct DecoderPool {
    jobs: Vec<Sender<DecodeJob>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for DecoderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderPool")
            .field("decoders", &self.jobs.len())
            .finish()
    }
}

impl DecoderPool {
    /// Spawn `num_threads` decoders.
    ///
    /// Recommended: `num_cpus::get()` (decoding is the only heavy work).
    pub fn new(
        num_threads: usize,
        decoder: Arc<dyn ImageDecoder>,
        on_report: ReportFn,
    ) -> std::io::Result<Self> {
        let num_threads = num_threads.max(1);
        let mut jobs = Vec::with_capacity(num_threads);
        let mut handles = Vec::with_capacity(num_threads);

        for worker_id in 0..num_threads {
            let (tx, rx) = bounded::<DecodeJob>(1);
            let decoder = Arc::clone(&decoder);
            let on_report = Arc::clone(&on_report);

            let handle = thread::Builder::new()
                .name(format!("pixcache-decoder-{}", worker_id))
                .spawn(move || {
                    trace!("Decoder {} started", worker_id);

                    // Ends when the pool drops its sender
                    for job in rx.iter() {
                        if job.token.is_cancelled() {
                            on_report(DecodeReport::cancelled(job));
                            continue;
                        }

                        let result = decoder.decode(&job.path, &job.params);
                        on_report(DecodeReport {
                            worker: job.worker,
                            epoch: job.epoch,
                            path: job.path,
                            result,
                        });
                    }

                    trace!("Decoder {} stopped", worker_id);
                })?;

            jobs.push(tx);
            handles.push(handle);
        }

        debug!("Decoder pool initialized: {} threads", num_threads);
        Ok(Self { jobs, handles })
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Hand a job to its decoder. Gives the job back if that decoder is gone.
    pub fn submit(&self, job: DecodeJob) -> Result<(), DecodeJob> {
        match self.jobs.get(job.worker) {
            Some(tx) => tx.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }
}

impl Drop for DecoderPool {
    fn drop(&mut self) {
        use std::time::{Duration, Instant};

        let num_threads = self.handles.len();
        trace!("Decoder pool shutting down ({} threads)...", num_threads);

        // Closing the job channels ends every decoder loop
        self.jobs.clear();

        // A decoder stuck in a slow decode must not hang shutdown
        let deadline = Instant::now() + Duration::from_millis(2000);

        let handles = std::mem::take(&mut self.handles);
        for handle in handles {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, detaching remaining decoders");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }

        trace!("All {} decoders stopped", num_threads);
    }
}
