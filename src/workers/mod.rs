/// Worker broadcast primitive
///
/// The proxy runs a fixed set of workers; each owns one shard of every
/// server's connection pool. Maintenance that must run "once on every
/// worker" (idle-connection sweeps, pool purges) is scattered here as a
/// unit of work per worker queue and optionally gathered: callers that need
/// fresh results afterwards await the per-worker acknowledgements, callers
/// that do not simply drop the handle. No central lock is involved — each
/// worker's job touches only that worker's bucket.
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Identifies one worker; doubles as the pool bucket index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

type Job = Box<dyn FnOnce(WorkerId) + Send + 'static>;

/// Gather handle for a broadcast; await `wait` for completion on all workers
pub struct Broadcast {
    acks: Vec<oneshot::Receiver<()>>,
}

impl Broadcast {
    /// Wait until every worker has executed its copy of the task
    pub async fn wait(self) {
        join_all(self.acks).await;
    }
}

/// Fixed pool of task-queue workers
pub struct Workers {
    senders: Vec<mpsc::UnboundedSender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Spawn `count` workers (at least one) on the current runtime
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for index in 0..count {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            let id = WorkerId::new(index);

            let handle = tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job(id);
                }
                debug!(worker = id.index(), "Worker queue closed");
            });

            senders.push(tx);
            handles.push(handle);
        }

        Self { senders, handles }
    }

    pub fn count(&self) -> usize {
        self.senders.len()
    }

    /// All worker ids, in bucket-index order
    pub fn ids(&self) -> impl Iterator<Item = WorkerId> {
        (0..self.senders.len()).map(WorkerId::new)
    }

    /// Scatter one task to every worker queue
    pub fn broadcast<F>(&self, task: F) -> Broadcast
    where
        F: Fn(WorkerId) + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let mut acks = Vec::with_capacity(self.senders.len());

        for (index, sender) in self.senders.iter().enumerate() {
            let task = Arc::clone(&task);
            let (ack_tx, ack_rx) = oneshot::channel();

            let job: Job = Box::new(move |id| {
                task(id);
                let _ = ack_tx.send(());
            });

            if sender.send(job).is_err() {
                warn!(worker = index, "Worker queue gone, skipping broadcast task");
            }
            acks.push(ack_rx);
        }

        Broadcast { acks }
    }

    /// Close the queues and wait for the workers to drain them
    pub async fn shutdown(mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}
