use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Errors from the upload transfer pipeline.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid transfer plan: {0}")]
    InvalidPlan(String),

    #[error("upload init failed: {0}")]
    Init(String),

    #[error("chunk {index} failed: {reason}")]
    Chunk { index: usize, reason: String },

    #[error("upload complete failed: {0}")]
    Complete(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// One contiguous byte range of the file: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl ChunkSpec {
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }
}

/// The split of a file into fixed-size chunks. The last chunk may be short.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    chunks: Vec<ChunkSpec>,
}

impl ChunkPlan {
    pub fn new(size: u64, chunk_size: u64) -> Result<Self, TransferError> {
        if size == 0 {
            return Err(TransferError::InvalidPlan("file is empty".into()));
        }
        if chunk_size == 0 {
            return Err(TransferError::InvalidPlan("chunk size is zero".into()));
        }

        let total = size.div_ceil(chunk_size) as usize;
        let chunks = (0..total)
            .map(|index| {
                let start = index as u64 * chunk_size;
                ChunkSpec {
                    index,
                    start,
                    end: (start + chunk_size).min(size),
                }
            })
            .collect();
        Ok(Self { chunks })
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> &[ChunkSpec] {
        &self.chunks
    }
}

/// Destination for chunk transmissions. Production uses the HTTP API;
/// tests use in-memory sinks.
pub trait ChunkSink: Send + Sync {
    fn send_chunk(
        &self,
        upload_id: &str,
        index: usize,
        total_chunks: usize,
        data: Bytes,
    ) -> impl Future<Output = Result<(), TransferError>> + Send;
}

/// Shared progress for one transfer. Completion percent is published on a
/// watch channel; the placeholder rendering follows it.
pub struct TransferProgress {
    completed: AtomicUsize,
    total: usize,
    percent_tx: watch::Sender<u8>,
}

impl TransferProgress {
    pub fn new(total: usize) -> (Arc<Self>, watch::Receiver<u8>) {
        let (percent_tx, percent_rx) = watch::channel(0);
        (
            Arc::new(Self {
                completed: AtomicUsize::new(0),
                total,
                percent_tx,
            }),
            percent_rx,
        )
    }

    /// Record one completed chunk and publish the new percentage
    /// (rounded half-up, so 1/3 -> 33 and 2/3 -> 67).
    fn chunk_done(&self) -> u8 {
        let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        let percent = ((200 * done + self.total) / (2 * self.total)) as u8;
        self.percent_tx.send_replace(percent);
        percent
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub fn percent(&self) -> u8 {
        *self.percent_tx.borrow()
    }
}

/// Transmit every chunk of `data` through `sink` with bounded concurrency.
///
/// Workers drain a shared queue of pending indices; popping an index is a
/// single lock acquisition, so no index is ever dispatched twice. The first
/// chunk failure empties the queue and wins: chunks already in flight run
/// to completion but their results are discarded, and that first error is
/// returned. There is no per-chunk retry and no completion-order guarantee;
/// the server reassembles by index.
///
/// On success the caller finalizes the upload; the scheduler never does.
pub async fn run_transfer<S: ChunkSink + 'static>(
    sink: Arc<S>,
    upload_id: &str,
    data: Bytes,
    plan: &ChunkPlan,
    concurrency: usize,
    progress: Arc<TransferProgress>,
) -> Result<(), TransferError> {
    let total = plan.total_chunks();
    if data.len() as u64 != plan.chunks.last().map(|c| c.end).unwrap_or(0) {
        return Err(TransferError::InvalidPlan(format!(
            "data length {} does not match plan",
            data.len()
        )));
    }

    let queue: Arc<Mutex<VecDeque<usize>>> = Arc::new(Mutex::new((0..total).collect()));
    let first_failure: Arc<Mutex<Option<TransferError>>> = Arc::new(Mutex::new(None));

    let workers = concurrency.clamp(1, total);
    debug!(
        "transfer {}: {} chunks, {} workers",
        upload_id, total, workers
    );

    let mut join_set = JoinSet::new();
    for worker in 0..workers {
        let sink = sink.clone();
        let upload_id = upload_id.to_string();
        let data = data.clone();
        let plan = plan.clone();
        let queue = queue.clone();
        let first_failure = first_failure.clone();
        let progress = progress.clone();

        join_set.spawn(async move {
            loop {
                // Pop-next-index is atomic under the queue lock. The lock
                // is never held across an await.
                let index = {
                    let mut queue = queue.lock().expect("chunk queue lock poisoned");
                    match queue.pop_front() {
                        Some(index) => index,
                        None => break,
                    }
                };

                let spec = plan.chunks()[index];
                let chunk = data.slice(spec.start as usize..spec.end as usize);

                match sink.send_chunk(&upload_id, index, total, chunk).await {
                    Ok(()) => {
                        progress.chunk_done();
                    }
                    Err(e) => {
                        warn!(
                            "transfer {}: chunk {} failed on worker {}: {}",
                            upload_id, index, worker, e
                        );
                        // First failure wins; stop handing out work.
                        queue.lock().expect("chunk queue lock poisoned").clear();
                        let mut slot =
                            first_failure.lock().expect("failure slot lock poisoned");
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        break;
                    }
                }
            }
        });
    }

    while let Some(result) = join_set.join_next().await {
        if let Err(e) = result {
            warn!("transfer {}: worker panicked: {}", upload_id, e);
        }
    }

    let failure = first_failure.lock().expect("failure slot lock poisoned").take();
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
