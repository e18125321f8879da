//! Request worker threads in front of the coordinator.
//!
//! Northbound requests and TC callbacks are queued round-robin onto a fixed set of OS threads.
//! Callers block on a sequence-keyed reply board until their own answer is published.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use topo_common::error::{TopoError, TopoResult};
use topo_core::containers::{HotMap as HashMap, HotSet as HashSet};
use topo_facade::request::{Request, Response, TcCall, TcResponse};
use tracing::{debug, warn};

use crate::itc::InternalTransactionCoordinator;

/// Unit of work handed to a worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    Request(Request),
    Tc(TcCall),
}

/// Answer published by a worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkReply {
    Response(Response),
    Tc(TcResponse),
}

#[derive(Debug)]
struct QueuedWork {
    sequence: u64,
    item: WorkItem,
}

/// Published replies plus the sequences whose callers gave up waiting.
#[derive(Debug, Default)]
struct BoardState {
    replies: HashMap<u64, WorkReply>,
    abandoned: HashSet<u64>,
}

#[derive(Debug, Default)]
struct ReplyBoard {
    state: Mutex<BoardState>,
    published: Condvar,
}

type WorkExecutor = dyn Fn(WorkItem) -> WorkReply + Send + Sync;

/// Fixed pool of request worker threads.
pub struct RequestWorkerPool {
    senders: Vec<mpsc::Sender<QueuedWork>>,
    next_sequence: AtomicU64,
    board: Arc<ReplyBoard>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl fmt::Debug for RequestWorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestWorkerPool")
            .field("workers", &self.workers.len())
            .field("next_sequence", &self.next_sequence)
            .finish_non_exhaustive()
    }
}

impl RequestWorkerPool {
    /// Creates `threads` workers that route every item through `itc`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidConfig` when `threads` is zero and `TopoError::Io` when a thread
    /// cannot be spawned.
    pub fn for_coordinator(
        threads: u16,
        itc: Arc<InternalTransactionCoordinator>,
    ) -> TopoResult<Self> {
        Self::new_with_executor(threads, move |item| match item {
            WorkItem::Request(request) => WorkReply::Response(itc.dispatch(&request)),
            WorkItem::Tc(call) => WorkReply::Tc(itc.tc_call(call)),
        })
    }

    /// Creates `threads` workers running `executor`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidConfig` when `threads` is zero and `TopoError::Io` when a thread
    /// cannot be spawned.
    pub fn new_with_executor<F>(threads: u16, executor: F) -> TopoResult<Self>
    where
        F: Fn(WorkItem) -> WorkReply + Send + Sync + 'static,
    {
        if threads == 0 {
            return Err(TopoError::InvalidConfig("worker_threads must be non-zero"));
        }
        let executor: Arc<WorkExecutor> = Arc::new(executor);
        let board = Arc::new(ReplyBoard::default());
        let mut pool = Self {
            senders: Vec::with_capacity(usize::from(threads)),
            next_sequence: AtomicU64::new(0),
            board: Arc::clone(&board),
            workers: Vec::with_capacity(usize::from(threads)),
        };
        for index in 0..threads {
            let (sender, receiver) = mpsc::channel::<QueuedWork>();
            let board = Arc::clone(&board);
            let executor = Arc::clone(&executor);
            let handle = thread::Builder::new()
                .name(format!("topo-worker-{index}"))
                .spawn(move || worker_loop(index, receiver, &board, &*executor))
                .map_err(|error| TopoError::Io(error.to_string()))?;
            pool.senders.push(sender);
            pool.workers.push(handle);
        }
        Ok(pool)
    }

    /// Number of worker threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Queues one item and returns its sequence number.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the target worker queue is closed.
    pub fn submit(&self, item: WorkItem) -> TopoResult<u64> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let slot = usize::try_from(sequence % self.senders.len() as u64).unwrap_or_default();
        let Some(sender) = self.senders.get(slot) else {
            return Err(TopoError::InvalidState("worker pool is closed"));
        };
        sender
            .send(QueuedWork { sequence, item })
            .map_err(|_| TopoError::InvalidState("worker queue is closed"))?;
        Ok(sequence)
    }

    /// Waits for the reply of `sequence` and removes it from the board.
    ///
    /// On timeout an issued sequence is marked abandoned, and its worker discards the reply
    /// instead of publishing it.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` when the reply does not arrive within `timeout` or the
    /// board mutex is poisoned.
    pub fn wait_reply(&self, sequence: u64, timeout: Duration) -> TopoResult<WorkReply> {
        let state = self
            .board
            .state
            .lock()
            .map_err(|_| TopoError::InvalidState("reply board mutex is poisoned"))?;
        let (mut state, _) = self
            .board
            .published
            .wait_timeout_while(state, timeout, |state| !state.replies.contains_key(&sequence))
            .map_err(|_| TopoError::InvalidState("reply board mutex is poisoned"))?;
        if let Some(reply) = state.replies.remove(&sequence) {
            return Ok(reply);
        }
        if sequence != 0 && sequence <= self.next_sequence.load(Ordering::Acquire) {
            let _ = state.abandoned.insert(sequence);
        }
        warn!(sequence, "worker reply timed out");
        Err(TopoError::InvalidState("worker reply timed out"))
    }

    /// Queues one item and blocks until it is answered.
    ///
    /// # Errors
    ///
    /// Returns the errors of `submit` and `wait_reply`.
    pub fn execute(&self, item: WorkItem, timeout: Duration) -> TopoResult<WorkReply> {
        let sequence = self.submit(item)?;
        self.wait_reply(sequence, timeout)
    }
}

#[cfg(test)]
impl RequestWorkerPool {
    fn board_len(&self) -> usize {
        self.board
            .state
            .lock()
            .map(|state| state.replies.len() + state.abandoned.len())
            .unwrap_or_default()
    }
}

impl Drop for RequestWorkerPool {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("request worker panicked");
            }
        }
    }
}

fn worker_loop(
    index: u16,
    receiver: mpsc::Receiver<QueuedWork>,
    board: &ReplyBoard,
    executor: &WorkExecutor,
) {
    for queued in receiver {
        let reply = executor(queued.item);
        if let Ok(mut state) = board.state.lock() {
            if state.abandoned.remove(&queued.sequence) {
                debug!(worker = index, sequence = queued.sequence, "reply of abandoned request dropped");
            } else {
                let _ = state.replies.insert(queued.sequence, reply);
                board.published.notify_all();
            }
        }
    }
    debug!(worker = index, "request worker stopped");
}
