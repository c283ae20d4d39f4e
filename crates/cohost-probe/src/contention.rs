//! Contention generator
//!
//! Two modes are supported:
//! - memory bus: workers hammer lock-prefixed adds on counters that straddle
//!   cache lines, forcing bus locks that every core on the socket observes
//! - LLC: workers walk disjoint chunks of a large buffer in random line order,
//!   evicting the shared last-level cache
//!
//! A run blocks the calling thread until the deadline passes or the stop flag
//! is raised; until-stopped runs have no deadline. Each worker owns a
//! generator seeded with `seed + worker_index`.

use crate::error::ContentionError;
use crate::lowlevel::{self, MisalignedRegion, CACHE_LINE, SPLIT_LOCK_SUPPORTED};
use cohost_core::{AgentConfig, ContentionMode, LockRequest};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lines touched between two deadline checks in LLC mode
const LLC_CHECK_INTERVAL: usize = 4096;

static SPLIT_LOCK_WARNING: Once = Once::new();

/// Static parameters of the generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentionConfig {
    /// Counter slots in the misaligned region
    pub slots: usize,

    /// Byte offset of the first counter from a line boundary
    pub misalignment: usize,

    /// Size of the LLC thrash buffer in bytes
    pub llc_buffer_bytes: usize,
}

impl ContentionConfig {
    pub fn validate(&self) -> Result<(), ContentionError> {
        if self.slots == 0 {
            return Err(ContentionError::InvalidConfiguration(
                "slot count must be > 0".to_string(),
            ));
        }

        if self.misalignment % lowlevel::COUNTER_WIDTH == 0 || self.misalignment >= CACHE_LINE {
            return Err(ContentionError::InvalidConfiguration(format!(
                "misalignment {} keeps every counter inside one cache line",
                self.misalignment
            )));
        }

        if self.llc_buffer_bytes < CACHE_LINE {
            return Err(ContentionError::InvalidConfiguration(
                "LLC buffer must hold at least one cache line".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for ContentionConfig {
    fn default() -> Self {
        Self {
            slots: 64,
            misalignment: 3,
            llc_buffer_bytes: 64 * 1024 * 1024,
        }
    }
}

impl From<&AgentConfig> for ContentionConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            slots: config.lock_slots,
            misalignment: config.lock_misalignment,
            llc_buffer_bytes: config.llc_buffer_mib * 1024 * 1024,
        }
    }
}

/// What a finished run did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentionSummary {
    pub mode: ContentionMode,
    pub workers: usize,
    pub elapsed: Duration,
    /// Counter increments or line touches across all workers
    pub operations: u64,
    /// The stop flag ended the run before its deadline
    pub stopped_early: bool,
}

/// Generator of memory bus or LLC contention
#[derive(Debug, Clone)]
pub struct ContentionGenerator {
    config: ContentionConfig,
}

impl ContentionGenerator {
    pub fn new(config: ContentionConfig) -> Result<Self, ContentionError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ContentionConfig {
        &self.config
    }

    /// Run for `request.duration()` or until `stop` is raised
    ///
    /// Requests with `until_stopped` set ignore the duration.
    pub fn run(&self, request: &LockRequest, stop: &AtomicBool) -> Result<ContentionSummary, ContentionError> {
        if request.workers == 0 {
            return Err(ContentionError::InvalidConfiguration(
                "worker count must be > 0".to_string(),
            ));
        }

        let started = Instant::now();
        let deadline = request.deadline(started);
        match deadline {
            Some(_) => debug!(
                "Starting {} contention: {} workers for {:?}",
                request.mode,
                request.workers,
                request.duration()
            ),
            None => debug!(
                "Starting {} contention: {} workers until stopped",
                request.mode, request.workers
            ),
        }

        let operations = match request.mode {
            ContentionMode::MemoryBus => self.run_memory_bus(request, deadline, stop)?,
            ContentionMode::Llc => self.run_llc(request, deadline, stop)?,
        };

        let elapsed = started.elapsed();
        let stopped_early = deadline.map_or(true, |deadline| Instant::now() < deadline);

        debug!(
            "Contention finished after {:?}: {} operations{}",
            elapsed,
            operations,
            if stopped_early { " (stopped)" } else { "" }
        );

        Ok(ContentionSummary {
            mode: request.mode,
            workers: request.workers,
            elapsed,
            operations,
            stopped_early,
        })
    }

    fn run_memory_bus(
        &self,
        request: &LockRequest,
        deadline: Option<Instant>,
        stop: &AtomicBool,
    ) -> Result<u64, ContentionError> {
        if !SPLIT_LOCK_SUPPORTED {
            SPLIT_LOCK_WARNING.call_once(|| {
                warn!("Split-lock atomics unavailable on this target, using aligned atomics");
            });
        }

        let region = MisalignedRegion::allocate(self.config.slots, self.config.misalignment)
            .ok_or(ContentionError::Allocation {
                bytes: (self.config.slots + 1) * 8,
            })?;
        let region = &region;

        run_workers(vec![(); request.workers], |worker, (), abort| {
            let mut rng = SmallRng::seed_from_u64(request.seed.wrapping_add(worker as u64));
            let order = shuffled_order(region.slots(), &mut rng);
            let mut operations = 0u64;

            while !should_stop(deadline, stop, abort) {
                for &slot in &order {
                    region.increment(slot);
                }
                operations += order.len() as u64;
            }
            operations
        })
    }

    fn run_llc(
        &self,
        request: &LockRequest,
        deadline: Option<Instant>,
        stop: &AtomicBool,
    ) -> Result<u64, ContentionError> {
        let bytes = self.config.llc_buffer_bytes - self.config.llc_buffer_bytes % CACHE_LINE;

        let mut buffer: Vec<u8> = Vec::new();
        buffer
            .try_reserve_exact(bytes)
            .map_err(|_| ContentionError::Allocation { bytes })?;
        // Touch every page up front so the walk never faults
        buffer.resize(bytes, 1);

        let lines = bytes / CACHE_LINE;
        let lines_per_worker = lines.div_ceil(request.workers).max(1);
        let chunks: Vec<&mut [u8]> = buffer.chunks_mut(lines_per_worker * CACHE_LINE).collect();

        run_workers(chunks, |worker, chunk, abort| {
            let mut rng = SmallRng::seed_from_u64(request.seed.wrapping_add(worker as u64));
            let chunk_lines = chunk.len() / CACHE_LINE;
            let mut order: Vec<usize> = (0..chunk_lines).collect();
            let mut operations = 0u64;

            while !should_stop(deadline, stop, abort) {
                order.shuffle(&mut rng);
                for (i, &line) in order.iter().enumerate() {
                    if i > 0 && i % LLC_CHECK_INTERVAL == 0 && should_stop(deadline, stop, abort) {
                        break;
                    }
                    lowlevel::touch(&mut chunk[line * CACHE_LINE]);
                    operations += 1;
                }
            }
            operations
        })
    }
}

/// Random permutation of `0..len`
pub fn shuffled_order(len: usize, rng: &mut SmallRng) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(rng);
    order
}

fn should_stop(deadline: Option<Instant>, stop: &AtomicBool, abort: &AtomicBool) -> bool {
    stop.load(Ordering::Relaxed)
        || abort.load(Ordering::Relaxed)
        || deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

/// Spawn one scoped thread per state running `body` and sum their results.
///
/// A failed spawn raises a local abort flag so already-running workers wind
/// down before the error is returned.
fn run_workers<S, F>(states: Vec<S>, body: F) -> Result<u64, ContentionError>
where
    S: Send,
    F: Fn(usize, S, &AtomicBool) -> u64 + Sync,
{
    let abort = AtomicBool::new(false);
    let abort = &abort;
    let body = &body;

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(states.len());
        let mut spawn_error = None;

        for (worker, state) in states.into_iter().enumerate() {
            let spawned = thread::Builder::new()
                .name(format!("cohost-lock-{}", worker))
                .spawn_scoped(scope, move || body(worker, state, abort));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    abort.store(true, Ordering::Relaxed);
                    spawn_error = Some(ContentionError::Spawn { worker, source });
                    break;
                }
            }
        }

        let mut operations = 0u64;
        let mut panicked = false;
        for handle in handles {
            match handle.join() {
                Ok(count) => operations += count,
                Err(_) => panicked = true,
            }
        }

        match (spawn_error, panicked) {
            (Some(err), _) => Err(err),
            (None, true) => Err(ContentionError::WorkerPanicked),
            (None, false) => Ok(operations),
        }
    })
}
