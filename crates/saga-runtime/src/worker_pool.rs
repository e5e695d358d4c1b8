use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::panic_message;

type Job = BoxFuture<'static, ()>;

/// Where a submitted job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued,
    /// The queue was full or closed; the job got its own task instead.
    Spawned,
}

/// Fixed set of background workers draining a bounded job queue.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Spawns `size` workers sharing a queue of `queue_capacity` jobs.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime or with a zero capacity.
    #[must_use]
    pub fn new(size: usize, queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>(queue_capacity);
        let receiver = Arc::new(AsyncMutex::new(receiver));

        let workers = (0..size)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        run_guarded(job, Some(worker)).await;
                    }
                    debug!(worker, "worker stopped");
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            size,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Enqueues `job` without ever blocking the caller.
    pub fn submit<F>(&self, job: F) -> Submission
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::pin(job);
        let sender = self.sender.lock().clone();
        let job = match sender {
            Some(sender) => match sender.try_send(job) {
                Ok(()) => return Submission::Queued,
                Err(TrySendError::Full(job)) => {
                    debug!("worker queue full, spawning job directly");
                    job
                }
                Err(TrySendError::Closed(job)) => {
                    warn!("worker pool is shut down, spawning job directly");
                    job
                }
            },
            None => {
                warn!("worker pool is shut down, spawning job directly");
                job
            }
        };
        tokio::spawn(run_guarded(job, None));
        Submission::Spawned
    }

    /// Closes the queue and waits for queued jobs to finish.
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
    }
}

async fn run_guarded(job: Job, worker: Option<usize>) {
    if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
        error!(
            worker = ?worker,
            panic = %panic_message(panic.as_ref()),
            "background job panicked"
        );
    }
}
