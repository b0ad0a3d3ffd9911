//! # Scheduler Module
//!
//! A two-class job scheduler backing every query and reconstruction.
//!
//! ## Design Invariants
//!
//! - Two priority classes: `Query` and `Reconstruction`. Workers drain
//!   queries preferentially; queries never wait behind reconstructions.
//! - A reconstruction declares its expected transient allocation. When a
//!   memory budget is configured, a worker blocks on the budget gate
//!   until the declaration fits; queries are never gated.
//! - The facade keeps at most one reconstruction in flight, so budget
//!   contention and task overlap stay trivial by construction.
//! - Shutdown delivers one sentinel per worker, joins them all, then
//!   drains and counts the jobs that never ran.
//!
//! Two implementations: [`PooledScheduler`] (a fixed pool of OS worker
//! threads on crossbeam channels) and [`SerialScheduler`] (inline
//! execution on the calling thread, required by the tagging delete
//! policy and handy for deterministic tests).

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, TryRecvError, unbounded};
use thiserror::Error;
use tracing::{debug, info, warn};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by scheduler operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// The scheduler has begun teardown; the job was not accepted.
    #[error("Scheduler is shutting down")]
    ShutdownInProgress,
}

// ------------------------------------------------------------------------------------------------
// Jobs
// ------------------------------------------------------------------------------------------------

/// Priority class of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobClass {
    Query,
    Reconstruction,
}

/// A unit of work: a class, a memory declaration, and a closure.
pub struct Job {
    class: JobClass,
    estimated_bytes: usize,
    run: Box<dyn FnOnce() + Send + 'static>,
}

impl Job {
    pub fn query(run: impl FnOnce() + Send + 'static) -> Self {
        Self {
            class: JobClass::Query,
            estimated_bytes: 0,
            run: Box::new(run),
        }
    }

    pub fn reconstruction(estimated_bytes: usize, run: impl FnOnce() + Send + 'static) -> Self {
        Self {
            class: JobClass::Reconstruction,
            estimated_bytes,
            run: Box::new(run),
        }
    }

    pub fn class(&self) -> JobClass {
        self.class
    }
}

// ------------------------------------------------------------------------------------------------
// Core binding
// ------------------------------------------------------------------------------------------------

/// Pluggable worker-to-core binding strategy.
///
/// Affinity is an optimization, never a correctness requirement;
/// platforms without support use [`NoBinding`].
pub trait CoreBinding: Send + Sync + 'static {
    /// Called once from each worker thread before it starts servicing
    /// jobs.
    fn bind(&self, worker_index: usize);
}

/// The default binding: none.
pub struct NoBinding;

impl CoreBinding for NoBinding {
    fn bind(&self, _worker_index: usize) {}
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Snapshot of scheduler counters.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub queries_run: u64,
    pub reconstructions_run: u64,
    /// Jobs dropped at shutdown without running.
    pub jobs_dropped: u64,
    /// Bytes currently declared by in-flight reconstructions.
    pub memory_in_use: usize,
    /// High-water mark of declared reconstruction bytes.
    pub peak_memory: usize,
    pub workers: usize,
}

#[derive(Default)]
struct Counters {
    queries_run: AtomicU64,
    reconstructions_run: AtomicU64,
    jobs_dropped: AtomicU64,
}

// ------------------------------------------------------------------------------------------------
// JobScheduler trait
// ------------------------------------------------------------------------------------------------

/// Uniform interface over the pooled and serial schedulers.
pub trait JobScheduler: Send + Sync {
    /// Enqueues a job for execution. Inline schedulers run it before
    /// returning.
    fn schedule(&self, job: Job) -> Result<(), SchedulerError>;

    /// Stops accepting work, waits for running jobs, drops pending ones.
    /// Idempotent.
    fn shutdown(&self);

    fn stats(&self) -> SchedulerStats;
}

// ------------------------------------------------------------------------------------------------
// Memory budget gate
// ------------------------------------------------------------------------------------------------

struct MemoryBudget {
    /// 0 means unbounded.
    limit: usize,
    used: Mutex<usize>,
    peak: AtomicU64,
    freed: Condvar,
}

impl MemoryBudget {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            used: Mutex::new(0),
            peak: AtomicU64::new(0),
            freed: Condvar::new(),
        }
    }

    /// Blocks until `bytes` fits under the budget, then claims it.
    ///
    /// A declaration larger than the whole budget is admitted alone —
    /// waiting for it to fit would wait forever.
    fn acquire(&self, bytes: usize) {
        let mut used = self.used.lock().expect("memory budget lock poisoned");
        if self.limit > 0 {
            while *used > 0 && *used + bytes > self.limit {
                debug!(bytes, in_use = *used, "reconstruction gated on memory budget");
                used = self
                    .freed
                    .wait(used)
                    .expect("memory budget lock poisoned");
            }
        }
        *used += bytes;
        self.peak.fetch_max(*used as u64, Ordering::AcqRel);
    }

    fn release(&self, bytes: usize) {
        let mut used = self.used.lock().expect("memory budget lock poisoned");
        *used -= bytes;
        drop(used);
        self.freed.notify_all();
    }

    fn in_use(&self) -> usize {
        *self.used.lock().expect("memory budget lock poisoned")
    }
}

// ------------------------------------------------------------------------------------------------
// Shared worker state
// ------------------------------------------------------------------------------------------------

struct SchedulerShared {
    budget: MemoryBudget,
    counters: Counters,
    shutting_down: AtomicBool,
}

impl SchedulerShared {
    fn run_job(&self, job: Job) {
        match job.class {
            JobClass::Query => {
                (job.run)();
                self.counters.queries_run.fetch_add(1, Ordering::AcqRel);
            }
            JobClass::Reconstruction => {
                self.budget.acquire(job.estimated_bytes);
                (job.run)();
                self.budget.release(job.estimated_bytes);
                self.counters
                    .reconstructions_run
                    .fetch_add(1, Ordering::AcqRel);
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PooledScheduler
// ------------------------------------------------------------------------------------------------

enum Message {
    Run(Job),
    Shutdown,
}

/// A fixed pool of worker threads servicing two priority channels.
pub struct PooledScheduler {
    query_tx: Sender<Message>,
    recon_tx: Sender<Message>,
    query_rx: Receiver<Message>,
    recon_rx: Receiver<Message>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<SchedulerShared>,
    worker_count: usize,
}

impl PooledScheduler {
    /// Spawns `thread_count` workers. `memory_budget` is in bytes; 0
    /// means unbounded.
    pub fn new(thread_count: usize, memory_budget: usize, binding: Arc<dyn CoreBinding>) -> Self {
        let (query_tx, query_rx) = unbounded();
        let (recon_tx, recon_rx) = unbounded();
        let shared = Arc::new(SchedulerShared {
            budget: MemoryBudget::new(memory_budget),
            counters: Counters::default(),
            shutting_down: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(thread_count);
        for idx in 0..thread_count {
            let query_rx = query_rx.clone();
            let recon_rx = recon_rx.clone();
            let shared = Arc::clone(&shared);
            let binding = Arc::clone(&binding);

            let handle = std::thread::Builder::new()
                .name(format!("dynamize-worker-{idx}"))
                .spawn(move || {
                    binding.bind(idx);
                    Self::worker_loop(idx, &query_rx, &recon_rx, &shared);
                })
                .expect("failed to spawn scheduler worker");
            workers.push(handle);
        }

        info!(thread_count, memory_budget, "pooled scheduler started");

        Self {
            query_tx,
            recon_tx,
            query_rx,
            recon_rx,
            workers: Mutex::new(workers),
            shared,
            worker_count: thread_count,
        }
    }

    fn worker_loop(
        idx: usize,
        query_rx: &Receiver<Message>,
        recon_rx: &Receiver<Message>,
        shared: &SchedulerShared,
    ) {
        loop {
            // Queries first; fall back to blocking on both channels.
            let msg = match query_rx.try_recv() {
                Ok(msg) => Some(msg),
                Err(TryRecvError::Disconnected) => None,
                Err(TryRecvError::Empty) => {
                    crossbeam::select! {
                        recv(query_rx) -> msg => msg.ok(),
                        recv(recon_rx) -> msg => msg.ok(),
                    }
                }
            };

            match msg {
                None | Some(Message::Shutdown) => {
                    debug!(worker = idx, "worker stopping");
                    break;
                }
                Some(Message::Run(job)) => shared.run_job(job),
            }
        }
    }
}

impl JobScheduler for PooledScheduler {
    fn schedule(&self, job: Job) -> Result<(), SchedulerError> {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutdownInProgress);
        }

        let tx = match job.class {
            JobClass::Query => &self.query_tx,
            JobClass::Reconstruction => &self.recon_tx,
        };
        tx.send(Message::Run(job))
            .map_err(|_| SchedulerError::ShutdownInProgress)
    }

    fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        // One sentinel per worker on the priority channel, then join.
        for _ in 0..self.worker_count {
            let _ = self.query_tx.send(Message::Shutdown);
        }
        let workers = std::mem::take(&mut *self.workers.lock().expect("worker list poisoned"));
        for handle in workers {
            let _ = handle.join();
        }

        // Anything still queued will never run.
        let mut dropped = 0u64;
        while let Ok(msg) = self.query_rx.try_recv() {
            if matches!(msg, Message::Run(_)) {
                dropped += 1;
            }
        }
        while let Ok(msg) = self.recon_rx.try_recv() {
            if matches!(msg, Message::Run(_)) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(dropped, "jobs dropped at scheduler shutdown");
            self.shared
                .counters
                .jobs_dropped
                .fetch_add(dropped, Ordering::AcqRel);
        }

        info!("pooled scheduler stopped");
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queries_run: self.shared.counters.queries_run.load(Ordering::Acquire),
            reconstructions_run: self
                .shared
                .counters
                .reconstructions_run
                .load(Ordering::Acquire),
            jobs_dropped: self.shared.counters.jobs_dropped.load(Ordering::Acquire),
            memory_in_use: self.shared.budget.in_use(),
            peak_memory: self.shared.budget.peak.load(Ordering::Acquire) as usize,
            workers: self.worker_count,
        }
    }
}

impl Drop for PooledScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ------------------------------------------------------------------------------------------------
// SerialScheduler
// ------------------------------------------------------------------------------------------------

/// Runs every job inline on the calling thread.
///
/// The only scheduler under which the tagging delete policy is sound:
/// nothing reads a shard while a record's deleted bit flips.
pub struct SerialScheduler {
    shared: SchedulerShared,
}

impl SerialScheduler {
    pub fn new(memory_budget: usize) -> Self {
        Self {
            shared: SchedulerShared {
                budget: MemoryBudget::new(memory_budget),
                counters: Counters::default(),
                shutting_down: AtomicBool::new(false),
            },
        }
    }
}

impl Default for SerialScheduler {
    fn default() -> Self {
        Self::new(0)
    }
}

impl JobScheduler for SerialScheduler {
    fn schedule(&self, job: Job) -> Result<(), SchedulerError> {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutdownInProgress);
        }
        self.shared.run_job(job);
        Ok(())
    }

    fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queries_run: self.shared.counters.queries_run.load(Ordering::Acquire),
            reconstructions_run: self
                .shared
                .counters
                .reconstructions_run
                .load(Ordering::Acquire),
            jobs_dropped: self.shared.counters.jobs_dropped.load(Ordering::Acquire),
            memory_in_use: self.shared.budget.in_use(),
            peak_memory: self.shared.budget.peak.load(Ordering::Acquire) as usize,
            workers: 0,
        }
    }
}
