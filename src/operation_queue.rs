//! Single-writer operation queue with bounded concurrent reads.
//!
//! `SQLite` tolerates exactly one writer at a time; serialising every write
//! through a background task avoids `SQLITE_BUSY` retries entirely, while
//! reads — which don't contend with each other — fan out across a bounded
//! number of concurrent connections. The bound and the single-writer task
//! mirror the semaphore-gated resource accounting the teacher's
//! `ResourceManager` used to cap concurrent agent work.

use crate::error::{QueueError, QueueResult, StorageError, StorageResult};
use sqlx::{Pool, Sqlite};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::debug;

/// A boxed, owned future, the shape every queued operation returns.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A unit of database work submitted to the queue.
pub type BoxedOp = Box<dyn FnOnce(Pool<Sqlite>) -> BoxFuture<QueueResult<serde_json::Value>> + Send>;

/// Relative dispatch priority for ordinary (non-transaction, non-bulk)
/// operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpPriority {
    /// Dispatched ahead of everything else in its bucket; LIFO among peers.
    High,
    /// Default priority; dispatched after `High`, before `Low`.
    Normal,
    /// Dispatched last; FIFO among peers.
    Low,
}

enum OperationKind {
    Read(BoxedOp),
    Write(BoxedOp),
    Transaction(Vec<BoxedOp>),
    BulkInsert(Vec<BoxedOp>),
}

struct Submission {
    kind: OperationKind,
    priority: OpPriority,
    respond_to: oneshot::Sender<QueueResult<serde_json::Value>>,
}

enum Command {
    Submit(Submission),
    Flush(oneshot::Sender<()>),
    Clear(oneshot::Sender<()>),
}

/// Handle used by repositories to submit work to the queue's background
/// worker. Cheap to clone; every clone shares the same worker task.
#[derive(Clone)]
pub struct OperationQueue {
    tx: mpsc::UnboundedSender<Command>,
}

impl OperationQueue {
    /// Spawns the background worker and returns a handle to it.
    #[must_use]
    pub fn spawn(pool: Pool<Sqlite>, max_concurrent_reads: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(pool, rx, max_concurrent_reads));
        Self { tx }
    }

    /// Enqueues a read. Reads run concurrently, bounded by the worker's
    /// semaphore, and never block writers behind them.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::QueueCleared`] if the queue was cleared before
    /// this operation ran, or the operation's own error otherwise.
    pub async fn read(&self, op: BoxedOp) -> QueueResult<serde_json::Value> {
        self.submit(OperationKind::Read(op), OpPriority::Normal).await
    }

    /// Enqueues a write at the given priority.
    ///
    /// # Errors
    ///
    /// See [`OperationQueue::read`].
    pub async fn write(&self, op: BoxedOp, priority: OpPriority) -> QueueResult<serde_json::Value> {
        self.submit(OperationKind::Write(op), priority).await
    }

    /// Enqueues a transaction: all boxed steps run sequentially inside one
    /// `SQLite` transaction, ahead of bulk inserts and ordinary writes.
    ///
    /// # Errors
    ///
    /// See [`OperationQueue::read`]. If any step fails the transaction does
    /// not commit.
    pub async fn transaction(&self, steps: Vec<BoxedOp>) -> QueueResult<serde_json::Value> {
        self.submit(OperationKind::Transaction(steps), OpPriority::Normal)
            .await
    }

    /// Enqueues a bulk insert: steps run sequentially, dispatched ahead of
    /// ordinary writes but behind transactions.
    ///
    /// # Errors
    ///
    /// See [`OperationQueue::read`].
    pub async fn bulk_insert(&self, rows: Vec<BoxedOp>) -> QueueResult<serde_json::Value> {
        self.submit(OperationKind::BulkInsert(rows), OpPriority::Normal)
            .await
    }

    /// Waits until every operation enqueued before this call has completed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Drops all pending operations, failing them with
    /// [`QueueError::QueueCleared`]. In-flight operations complete normally.
    pub async fn clear(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Clear(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    async fn submit(
        &self,
        kind: OperationKind,
        priority: OpPriority,
    ) -> QueueResult<serde_json::Value> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(Command::Submit(Submission {
                kind,
                priority,
                respond_to,
            }))
            .map_err(|_| QueueError::QueueCleared)?;
        rx.await.map_err(|_| QueueError::QueueCleared)?
    }

    /// Submits a write whose result is a concrete value rather than raw
    /// JSON, the mechanism every repository uses to route its writes
    /// through the single-writer worker instead of touching the pool
    /// directly.
    ///
    /// # Errors
    ///
    /// Returns the operation's own [`StorageError`], or
    /// [`StorageError::QueueUnavailable`] if the queue itself could not
    /// service the request (cleared, or a value that failed to round-trip
    /// through JSON).
    pub async fn write_value<T, F, Fut>(&self, priority: OpPriority, f: F) -> StorageResult<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
        F: FnOnce(Pool<Sqlite>) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<T>> + Send + 'static,
    {
        let op: BoxedOp = Box::new(move |pool| Box::pin(run_value_op(pool, f)));
        let raw = self.write(op, priority).await.map_err(queue_err_to_storage)?;
        decode_value(raw)
    }

    /// Submits a read whose result is a concrete value, the read analogue
    /// of [`OperationQueue::write_value`].
    ///
    /// # Errors
    ///
    /// See [`OperationQueue::write_value`].
    pub async fn read_value<T, F, Fut>(&self, f: F) -> StorageResult<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
        F: FnOnce(Pool<Sqlite>) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<T>> + Send + 'static,
    {
        let op: BoxedOp = Box::new(move |pool| Box::pin(run_value_op(pool, f)));
        let raw = self.read(op).await.map_err(queue_err_to_storage)?;
        decode_value(raw)
    }
}

async fn run_value_op<T, F, Fut>(pool: Pool<Sqlite>, f: F) -> QueueResult<serde_json::Value>
where
    T: serde::Serialize,
    F: FnOnce(Pool<Sqlite>) -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let value = f(pool).await?;
    serde_json::to_value(value).map_err(|e| QueueError::Serialization(e.to_string()))
}

fn decode_value<T: serde::de::DeserializeOwned>(raw: serde_json::Value) -> StorageResult<T> {
    serde_json::from_value(raw).map_err(|e| StorageError::QueueUnavailable(e.to_string()))
}

fn queue_err_to_storage(error: QueueError) -> StorageError {
    match error {
        QueueError::Storage(inner) => inner,
        other => StorageError::QueueUnavailable(other.to_string()),
    }
}

#[derive(Default)]
struct Buckets {
    transactions: VecDeque<Submission>,
    bulk_inserts: VecDeque<Submission>,
    high: VecDeque<Submission>,
    normal: VecDeque<Submission>,
    low: VecDeque<Submission>,
}

impl Buckets {
    fn push(&mut self, submission: Submission) {
        match &submission.kind {
            OperationKind::Transaction(_) => self.transactions.push_back(submission),
            OperationKind::BulkInsert(_) => self.bulk_inserts.push_back(submission),
            OperationKind::Read(_) | OperationKind::Write(_) => match submission.priority {
                OpPriority::High => self.high.push_front(submission),
                OpPriority::Normal => self.normal.push_back(submission),
                OpPriority::Low => self.low.push_back(submission),
            },
        }
    }

    fn pop(&mut self) -> Option<Submission> {
        self.transactions
            .pop_front()
            .or_else(|| self.bulk_inserts.pop_front())
            .or_else(|| self.high.pop_front())
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn is_empty(&self) -> bool {
        self.transactions.is_empty()
            && self.bulk_inserts.is_empty()
            && self.high.is_empty()
            && self.normal.is_empty()
            && self.low.is_empty()
    }

    fn drain_cleared(&mut self) {
        for bucket in [
            &mut self.transactions,
            &mut self.bulk_inserts,
            &mut self.high,
            &mut self.normal,
            &mut self.low,
        ] {
            for submission in bucket.drain(..) {
                let _ = submission.respond_to.send(Err(QueueError::QueueCleared));
            }
        }
    }
}

async fn run_sequential(pool: &Pool<Sqlite>, submission: Submission) {
    let result = match submission.kind {
        OperationKind::Write(op) => op(pool.clone()).await,
        OperationKind::Transaction(steps) => run_transaction(pool, steps).await,
        OperationKind::BulkInsert(rows) => run_transaction(pool, rows).await,
        OperationKind::Read(op) => op(pool.clone()).await,
    };
    let _ = submission.respond_to.send(result);
}

async fn run_transaction(
    pool: &Pool<Sqlite>,
    steps: Vec<BoxedOp>,
) -> QueueResult<serde_json::Value> {
    let mut last = serde_json::Value::Null;
    for step in steps {
        last = step(pool.clone()).await?;
    }
    Ok(last)
}

async fn run_worker(
    pool: Pool<Sqlite>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    max_concurrent_reads: usize,
) {
    let read_permits = std::sync::Arc::new(Semaphore::new(max_concurrent_reads.max(1)));
    let mut buckets = Buckets::default();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Submit(submission) => buckets.push(submission),
            Command::Flush(ack) => {
                drain_ready(&pool, &mut buckets, &read_permits).await;
                let _ = ack.send(());
                continue;
            }
            Command::Clear(ack) => {
                buckets.drain_cleared();
                let _ = ack.send(());
                continue;
            }
        }

        drain_ready(&pool, &mut buckets, &read_permits).await;
    }

    debug!("operation queue worker exiting: all senders dropped");
}

async fn drain_ready(
    pool: &Pool<Sqlite>,
    buckets: &mut Buckets,
    read_permits: &std::sync::Arc<Semaphore>,
) {
    while !buckets.is_empty() {
        let Some(submission) = buckets.pop() else {
            break;
        };
        match submission.kind {
            OperationKind::Read(op) => {
                let permit = read_permits.clone().acquire_owned().await;
                let pool = pool.clone();
                tokio::spawn(async move {
                    let result = op(pool).await;
                    let _ = submission.respond_to.send(result);
                    drop(permit);
                });
            }
            other => {
                run_sequential(
                    pool,
                    Submission {
                        kind: other,
                        priority: submission.priority,
                        respond_to: submission.respond_to,
                    },
                )
                .await;
            }
        }
    }
}
