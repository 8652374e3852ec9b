// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! C9: `RequestProcessor` — thread-pool fan-out of chunk lists into jobs.
//! See spec §4.9. Grounded in the teacher's worker-thread/channel prefetch
//! pattern (`rafs` blob-cache readahead via `spmc`), generalized from a
//! single prefetch queue to a general job/future dispatcher; we use
//! `crossbeam-channel` in place of `spmc` since jobs need per-task
//! completions rather than a single shared receive loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use vds_utils::{VdsError, VdsResult};

use crate::data_block::MAX_DIMS;
use crate::page_cache::{PageCache, PageHandle};

/// Key identifying one reusable `PageCache` (spec §4.9).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PageAccessorKey {
    pub dimension_group: String,
    pub lod: u32,
    pub channel: usize,
}

struct CachedAccessor {
    cache: Arc<PageCache>,
    refcount: i64,
    last_used: Instant,
}

/// A per-chunk unit of work submitted to the worker pool. Implementors run
/// off the calling thread and must not hold any `PageCache`/`ChunkStore`
/// mutex across the call.
pub trait ChunkProcessor: Send + Sync {
    fn process(&self, page_buffer: &[u8], pitch: [u32; MAX_DIMS], chunk_index: u64) -> VdsResult<()>;
}

struct JobState {
    total: usize,
    processed: AtomicU64,
    /// Set on explicit `cancel()` or when any chunk task errors; a set flag
    /// short-circuits tasks not yet started.
    canceled: AtomicBool,
    /// Set once every chunk task has run (success or failure).
    all_processed: AtomicBool,
    first_error: Mutex<Option<VdsError>>,
}

struct JobRecord {
    state: Arc<JobState>,
    done_cv: Arc<Condvar>,
    done_flag: Arc<Mutex<bool>>,
}

/// Owns the worker pool, the `PageCache` registry, and the live job table
/// (spec §4.9).
pub struct RequestProcessor {
    accessors: Arc<Mutex<HashMap<PageAccessorKey, CachedAccessor>>>,
    jobs: Mutex<HashMap<u64, JobRecord>>,
    next_job_id: AtomicU64,
    workers: Vec<Sender<Box<dyn FnOnce() + Send>>>,
    next_worker: AtomicU64,
    idle_timeout: Duration,
    cleanup_stop: Arc<AtomicBool>,
    /// Most recent non-canceled chunk-task error across every job, surfaced
    /// by `AccessManager::current_download_error` (spec §8 scenario S4).
    last_error: Arc<Mutex<Option<VdsError>>>,
}

/// One chunk's worth of scheduled work (spec §4.9 step 3).
struct ChunkTask {
    page_cache: Arc<PageCache>,
    state: Arc<JobState>,
    done_cv: Arc<Condvar>,
    done_flag: Arc<Mutex<bool>>,
    key: PageAccessorKey,
    handle: Option<PageHandle>,
    chunk_index: u64,
    processor: Arc<dyn ChunkProcessor>,
    accessors: Arc<Mutex<HashMap<PageAccessorKey, CachedAccessor>>>,
    manager_last_error: Arc<Mutex<Option<VdsError>>>,
}

fn run_chunk_task(task: ChunkTask) {
    let ChunkTask {
        page_cache,
        state,
        done_cv,
        done_flag,
        key,
        handle,
        chunk_index,
        processor,
        accessors,
        manager_last_error,
    } = task;

    let result: VdsResult<()> = (|| {
        let handle = handle.ok_or(VdsError::Canceled)?;
        if state.canceled.load(Ordering::SeqCst) {
            let _ = page_cache.cancel_prepared_read(handle);
            page_cache.release(handle);
            return Err(VdsError::Canceled);
        }
        if let Err(err) = page_cache.read_prepared_page(handle) {
            state.canceled.store(true, Ordering::SeqCst);
            page_cache.release(handle);
            return Err(err);
        }
        let (buffer, pitch) = page_cache.get_buffer(handle)?;
        let outcome = processor.process(&buffer, pitch, chunk_index);
        page_cache.release(handle);
        if outcome.is_err() {
            state.canceled.store(true, Ordering::SeqCst);
        }
        outcome
    })();

    if let Err(err) = result {
        if !err.is_canceled() {
            let mut first_error = state.first_error.lock().unwrap();
            if first_error.is_none() {
                *first_error = Some(err.clone());
            }
            drop(first_error);
            manager_last_error.lock().unwrap().replace(err);
        }
    }

    let processed = state.processed.fetch_add(1, Ordering::SeqCst) + 1;
    if processed as usize == state.total {
        state.all_processed.store(true, Ordering::SeqCst);
        if let Some(entry) = accessors.lock().unwrap().get_mut(&key) {
            entry.refcount -= 1;
            entry.last_used = Instant::now();
        }
        *done_flag.lock().unwrap() = true;
        done_cv.notify_all();
    }
}

impl RequestProcessor {
    pub fn new(worker_count: usize, idle_timeout: Duration) -> Arc<RequestProcessor> {
        let mut workers = Vec::with_capacity(worker_count.max(1));
        for _ in 0..worker_count.max(1) {
            let (tx, rx) = bounded::<Box<dyn FnOnce() + Send>>(256);
            std::thread::spawn(move || {
                for task in rx.iter() {
                    task();
                }
            });
            workers.push(tx);
        }

        let processor = Arc::new(RequestProcessor {
            accessors: Arc::new(Mutex::new(HashMap::new())),
            jobs: Mutex::new(HashMap::new()),
            next_job_id: AtomicU64::new(1),
            workers,
            next_worker: AtomicU64::new(0),
            idle_timeout,
            cleanup_stop: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(Mutex::new(None)),
        });
        processor.spawn_cleanup_thread();
        processor
    }

    /// Cleanup thread (spec §4.9): for every `PageCache` with zero current
    /// references, once `idle_timeout` has passed since its last use, drop
    /// its LRU by setting `maxPages = 0` (spec §9 design note: this keeps
    /// outstanding pinned pages valid rather than freeing the cache object).
    fn spawn_cleanup_thread(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = (self.idle_timeout / 4).max(Duration::from_millis(50));
        let stop = self.cleanup_stop.clone();
        std::thread::spawn(move || loop {
            std::thread::sleep(period);
            if stop.load(Ordering::SeqCst) {
                return;
            }
            let Some(processor) = weak.upgrade() else {
                return;
            };
            let now = Instant::now();
            let mut accessors = processor.accessors.lock().unwrap();
            for entry in accessors.values_mut() {
                if entry.refcount == 0 && now.duration_since(entry.last_used) >= processor.idle_timeout {
                    entry.cache.set_max_pages(0);
                }
            }
        });
    }

    fn submit(&self, task: impl FnOnce() + Send + 'static) {
        let n = self.workers.len() as u64;
        let idx = (self.next_worker.fetch_add(1, Ordering::Relaxed) % n) as usize;
        let _ = self.workers[idx].send(Box::new(task));
    }

    /// Registers (or re-registers) the `PageCache` for `key`, used by
    /// `AccessManager` before calling `add_job`.
    pub fn register_accessor(&self, key: PageAccessorKey, cache: Arc<PageCache>) {
        let mut accessors = self.accessors.lock().unwrap();
        accessors
            .entry(key)
            .or_insert_with(|| CachedAccessor {
                cache,
                refcount: 0,
                last_used: Instant::now(),
            });
    }

    fn accessor(&self, key: &PageAccessorKey) -> Option<Arc<PageCache>> {
        self.accessors.lock().unwrap().get(key).map(|a| a.cache.clone())
    }

    /// Count of `PageCache`s currently registered with at least one resident
    /// page, used by scenario S6 (`countActivePages`).
    pub fn count_active_pages(&self) -> usize {
        self.accessors
            .lock()
            .unwrap()
            .values()
            .map(|a| a.cache.page_count())
            .sum()
    }

    fn accessors_handle(&self) -> Arc<Mutex<HashMap<PageAccessorKey, CachedAccessor>>> {
        self.accessors.clone()
    }

    /// spec §4.9 `addJob`.
    pub fn add_job(
        self: &Arc<Self>,
        key: PageAccessorKey,
        chunk_indexes: Vec<u64>,
        processor: Arc<dyn ChunkProcessor>,
        single_thread: bool,
    ) -> VdsResult<u64> {
        let page_cache = self
            .accessor(&key)
            .ok_or_else(|| VdsError::invalid_argument("no PageCache registered for this accessor key"))?;

        {
            let mut accessors = self.accessors.lock().unwrap();
            if let Some(entry) = accessors.get_mut(&key) {
                entry.refcount += 1;
                entry.last_used = Instant::now();
            }
        }
        page_cache.set_max_pages(page_cache.page_count().max(8).max(chunk_indexes.len()));

        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let already_done = chunk_indexes.is_empty();
        let state = Arc::new(JobState {
            total: chunk_indexes.len(),
            processed: AtomicU64::new(0),
            canceled: AtomicBool::new(false),
            all_processed: AtomicBool::new(already_done),
            first_error: Mutex::new(None),
        });
        let done_cv = Arc::new(Condvar::new());
        let done_flag = Arc::new(Mutex::new(already_done));

        self.jobs.lock().unwrap().insert(
            job_id,
            JobRecord {
                state: state.clone(),
                done_cv: done_cv.clone(),
                done_flag: done_flag.clone(),
            },
        );

        if already_done {
            if let Some(entry) = self.accessors.lock().unwrap().get_mut(&key) {
                entry.refcount -= 1;
                entry.last_used = Instant::now();
            }
            return Ok(job_id);
        }

        let mut handles = Vec::with_capacity(chunk_indexes.len());
        for &chunk_index in &chunk_indexes {
            match page_cache.prepare_read_page(chunk_index) {
                Ok(handle) => handles.push(Some(handle)),
                Err(_) => {
                    state.canceled.store(true, Ordering::SeqCst);
                    handles.push(None);
                }
            }
        }

        let tasks: Vec<ChunkTask> = handles
            .into_iter()
            .zip(chunk_indexes.into_iter())
            .map(|(handle, chunk_index)| ChunkTask {
                page_cache: page_cache.clone(),
                state: state.clone(),
                done_cv: done_cv.clone(),
                done_flag: done_flag.clone(),
                key: key.clone(),
                handle,
                chunk_index,
                processor: processor.clone(),
                accessors: self.accessors_handle(),
                manager_last_error: self.last_error.clone(),
            })
            .collect();

        if single_thread {
            // Serialize every chunk of this job on one worker so sample/trace
            // requests that fan out across chunks but write into a single
            // output buffer never run two chunk processors concurrently
            // (spec §4.9 step 4).
            self.submit(move || {
                for task in tasks {
                    run_chunk_task(task);
                }
            });
        } else {
            for task in tasks {
                self.submit(move || run_chunk_task(task));
            }
        }

        Ok(job_id)
    }

    fn job_state(&self, job_id: u64) -> Option<Arc<JobState>> {
        self.jobs.lock().unwrap().get(&job_id).map(|j| j.state.clone())
    }

    /// `true` once every chunk of the job has been processed without error
    /// or cancellation (spec §4.9, §3 Lifecycles "Job").
    pub fn is_completed(&self, job_id: u64) -> bool {
        match self.job_state(job_id) {
            Some(state) => state.all_processed.load(Ordering::SeqCst) && !state.canceled.load(Ordering::SeqCst),
            None => true,
        }
    }

    /// `true` once every chunk of the job has finished and the job was
    /// canceled (explicitly or via a chunk error cascading, spec §7).
    pub fn is_canceled(&self, job_id: u64) -> bool {
        match self.job_state(job_id) {
            Some(state) => state.all_processed.load(Ordering::SeqCst) && state.canceled.load(Ordering::SeqCst),
            None => false,
        }
    }

    /// Fraction of chunks processed so far, in `[0.0, 1.0]`.
    pub fn completion_factor(&self, job_id: u64) -> f64 {
        match self.job_state(job_id) {
            Some(state) if state.total > 0 => {
                state.processed.load(Ordering::SeqCst) as f64 / state.total as f64
            }
            Some(_) => 1.0,
            None => 1.0,
        }
    }

    /// Requests cancellation; pending tasks short-circuit and already
    /// running ones discard their result (spec §5 Cancellation). Does not
    /// block — see [`Self::wait_for_completion`].
    pub fn cancel(&self, job_id: u64) {
        if let Some(state) = self.job_state(job_id) {
            state.canceled.store(true, Ordering::SeqCst);
        }
    }

    /// Blocks until the job finishes or `timeout` elapses; returns whether
    /// it finished. Does **not** cancel on timeout (spec §5 Timeouts):
    /// callers must call [`Self::cancel`] explicitly and re-wait.
    pub fn wait_for_completion(&self, job_id: u64, timeout: Option<Duration>) -> bool {
        let Some((done_flag, done_cv)) = self
            .jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .map(|j| (j.done_flag.clone(), j.done_cv.clone()))
        else {
            return true;
        };

        let mut guard = done_flag.lock().unwrap();
        match timeout {
            None => {
                while !*guard {
                    guard = done_cv.wait(guard).unwrap();
                }
                true
            }
            Some(d) => {
                let deadline = Instant::now() + d;
                while !*guard {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return *guard;
                    }
                    let (next_guard, result) = done_cv.wait_timeout(guard, remaining).unwrap();
                    guard = next_guard;
                    if result.timed_out() && !*guard {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Cancels the job and blocks until the last future has observed the
    /// cancellation (spec §5 "`cancelAndWaitForCompletion`").
    pub fn cancel_and_wait_for_completion(&self, job_id: u64) {
        self.cancel(job_id);
        self.wait_for_completion(job_id, None);
    }

    pub fn first_error(&self, job_id: u64) -> Option<VdsError> {
        self.job_state(job_id).and_then(|s| s.first_error.lock().unwrap().clone())
    }

    /// Most recent chunk-task error across every job ever submitted to this
    /// processor, regardless of which job it belongs to (spec §8 scenario S4).
    pub fn last_error(&self) -> Option<VdsError> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn shutdown(&self) {
        self.cleanup_stop.store(true, Ordering::SeqCst);
    }
}
