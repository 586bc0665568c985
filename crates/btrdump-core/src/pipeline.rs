/// Work queue and worker pool shared by the dump and restore engines
///
/// One mutex guards the dispatch queue, the submission-order FIFO, the
/// completed items, the outstanding count, the first recorded error and the
/// shutdown flag. Workers wait on `work_ready`; the collector waits on `idle`.
/// Jobs always run with the lock released.
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::container::Compression;
use crate::error::{MetadumpError, Result};

/// One contiguous range moving through the pipeline
#[derive(Debug)]
pub struct WorkItem {
    /// Logical start offset on the source/target device
    pub start: u64,
    /// Logical (uncompressed) size, unknown for stored items until decoded
    pub size: Option<u64>,
    /// Raw bytes, or stored bytes once encoded
    pub buffer: Vec<u8>,
    /// How `buffer` is currently encoded
    pub compression: Compression,
    pub failed: bool,
}

impl WorkItem {
    pub fn raw(start: u64, buffer: Vec<u8>) -> Self {
        Self {
            start,
            size: Some(buffer.len() as u64),
            buffer,
            compression: Compression::None,
            failed: false,
        }
    }

    pub fn stored(start: u64, buffer: Vec<u8>, compression: Compression) -> Self {
        let size = match compression {
            Compression::None => Some(buffer.len() as u64),
            Compression::Deflate => None,
        };
        Self {
            start,
            size,
            buffer,
            compression,
            failed: false,
        }
    }
}

/// CPU-bound transformation applied to each dispatched item
pub type Job = Arc<dyn Fn(&mut WorkItem) -> Result<()> + Send + Sync>;

/// Submission slot of an item; `None` for items dropped once their job is done
type Slot = Option<u64>;

#[derive(Default)]
struct QueueState {
    dispatch: VecDeque<(Slot, WorkItem)>,
    ordered: VecDeque<u64>,
    completed: HashMap<u64, WorkItem>,
    next_seq: u64,
    outstanding: usize,
    error: Option<MetadumpError>,
    done: bool,
}

impl QueueState {
    fn enqueue_ordered(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ordered.push_back(seq);
        seq
    }

    fn slot(&mut self, ordered: bool) -> Slot {
        if ordered {
            Some(self.enqueue_ordered())
        } else {
            None
        }
    }

    fn record(&mut self, err: MetadumpError) {
        if self.error.is_none() {
            self.error = Some(err);
        } else {
            tracing::debug!("Dropping secondary pipeline error: {}", err);
        }
    }

    /// Forget work that has not started yet; in-flight items still complete
    fn discard_pending(&mut self) {
        let discarded = self.dispatch.len();
        self.dispatch.clear();
        self.outstanding -= discarded;
    }
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    idle: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock()
    }

    /// Append an item that needs no processing
    pub fn push_ready(&self, item: WorkItem) {
        let mut state = self.lock();
        let seq = state.enqueue_ordered();
        state.completed.insert(seq, item);
    }

    /// Hand an item to one waiting worker; ordered items are kept for
    /// `drain_ordered`, the rest are dropped when their job finishes
    pub fn push_dispatch(&self, item: WorkItem, ordered: bool) {
        let mut state = self.lock();
        let slot = state.slot(ordered);
        state.dispatch.push_back((slot, item));
        state.outstanding += 1;
        drop(state);
        self.work_ready.notify_one();
    }

    /// Process an item on the calling thread
    pub fn run_inline(&self, mut item: WorkItem, ordered: bool, job: &Job) {
        let slot = {
            let mut state = self.lock();
            state.outstanding += 1;
            state.slot(ordered)
        };
        let result = job(&mut item);
        self.complete(slot, item, result);
    }

    /// Block until there is work or the queue is shut down
    fn next_work(&self) -> Option<(Slot, WorkItem)> {
        let mut state = self.lock();
        loop {
            if let Some(work) = state.dispatch.pop_front() {
                return Some(work);
            }
            if state.done {
                return None;
            }
            self.work_ready.wait(&mut state);
        }
    }

    fn complete(&self, slot: Slot, mut item: WorkItem, result: Result<()>) {
        let mut state = self.lock();
        if let Err(err) = result {
            item.failed = true;
            state.record(err);
        }
        if let Some(seq) = slot {
            state.completed.insert(seq, item);
        }
        state.outstanding -= 1;
        let wake = state.outstanding == 0 || state.error.is_some();
        drop(state);
        if wake {
            self.idle.notify_all();
        }
    }

    /// Items submitted in order since the last drain
    pub fn len(&self) -> usize {
        self.lock().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every submitted item has completed.
    ///
    /// If an error is recorded, queued items are dropped, in-flight items are
    /// allowed to finish, and the error is returned.
    pub fn wait_idle(&self) -> Result<()> {
        let mut state = self.lock();
        loop {
            if state.error.is_some() {
                state.discard_pending();
                while state.outstanding > 0 {
                    self.idle.wait(&mut state);
                }
                state.ordered.clear();
                state.completed.clear();
                if let Some(err) = state.error.take() {
                    return Err(err);
                }
            }
            if state.outstanding == 0 {
                return Ok(());
            }
            self.idle.wait(&mut state);
        }
    }

    /// Wait for all outstanding work, then hand back every ordered item in
    /// submission order regardless of completion order.
    pub fn drain_ordered(&self) -> Result<Vec<WorkItem>> {
        self.wait_idle()?;
        let mut state = self.lock();
        let state = &mut *state;
        let mut items = Vec::with_capacity(state.ordered.len());
        while let Some(seq) = state.ordered.pop_front() {
            match state.completed.remove(&seq) {
                Some(item) => items.push(item),
                None => {
                    return Err(MetadumpError::BadFormat(format!(
                        "work item {} missing after completion",
                        seq
                    )))
                }
            }
        }
        Ok(items)
    }

    /// Stop accepting work and wake every worker
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.done = true;
        if state.error.is_some() {
            state.discard_pending();
        }
        drop(state);
        self.work_ready.notify_all();
    }
}

/// Fixed set of threads running one job over dispatched items
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    job: Job,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers; with 0 every item runs on the submitting thread
    pub fn new(threads: usize, queue: Arc<WorkQueue>, job: Job) -> Result<Self> {
        let mut pool = WorkerPool {
            queue,
            job,
            workers: Vec::with_capacity(threads),
        };

        for i in 0..threads {
            let queue = Arc::clone(&pool.queue);
            let job = Arc::clone(&pool.job);
            let handle = thread::Builder::new()
                .name(format!("btrdump-worker-{}", i))
                .spawn(move || worker_loop(&queue, &job))
                .map_err(|e| MetadumpError::io(format!("spawning worker {}", i), e))?;
            pool.workers.push(handle);
        }

        tracing::debug!("Started worker pool with {} threads", threads);
        Ok(pool)
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Hand an item to the job and keep the result for `drain_ordered`
    pub fn submit(&self, item: WorkItem) {
        self.dispatch(item, true);
    }

    /// Hand an item to the job and drop it once the job is done
    pub fn submit_detached(&self, item: WorkItem) {
        self.dispatch(item, false);
    }

    fn dispatch(&self, item: WorkItem, ordered: bool) {
        if self.workers.is_empty() {
            self.queue.run_inline(item, ordered, &self.job);
        } else {
            self.queue.push_dispatch(item, ordered);
        }
    }

    /// Queue an item in order without running the job on it
    pub fn submit_ready(&self, item: WorkItem) {
        self.queue.push_ready(item);
    }

    fn join(&mut self) {
        self.queue.shutdown();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join();
    }
}

fn worker_loop(queue: &WorkQueue, job: &Job) {
    while let Some((slot, mut item)) = queue.next_work() {
        let result = job(&mut item);
        queue.complete(slot, item, result);
    }
}
