//! Bounded pool for best-effort background jobs.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use flume::TrySendError;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::WorkerConfig;
use crate::error::Result;

struct Job {
    label: &'static str,
    work: BoxFuture<'static, Result<()>>,
}

#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Runs side effects that callers do not wait for.
///
/// Jobs go through a bounded queue drained by a fixed number of workers. A
/// full queue drops the new job with a warning. Failures are logged with the
/// job label and never reach the submitter.
pub struct WorkerPool {
    handles: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<Pending>,
    receiver: flume::Receiver<Job>,
    sender: flume::Sender<Job>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("pending", &self.pending.count.load(Ordering::Acquire))
            .field("queued", &self.sender.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Spawns the workers. Must be called within a tokio runtime.
    #[must_use]
    pub fn new(config: &WorkerConfig) -> Self {
        let (sender, receiver) = flume::bounded::<Job>(config.queue_capacity.max(1));
        let pending = Arc::new(Pending::default());
        let shutdown = CancellationToken::new();

        let handles = (0..config.workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let pending = pending.clone();
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            biased;
                            () = shutdown.cancelled() => break,
                            job = receiver.recv_async() => {
                                let Ok(job) = job else { break };
                                if let Err(e) = job.work.await {
                                    warn!("background job {} failed: {}", job.label, e);
                                }
                                pending.finish();
                            }
                        }
                    }
                    debug!("worker {} stopped", worker);
                })
            })
            .collect();

        Self {
            handles: Mutex::new(handles),
            pending,
            receiver,
            sender,
            shutdown,
        }
    }

    /// Queues a job. Returns `false` if it was dropped.
    pub fn submit<F>(&self, label: &'static str, work: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            warn!("worker pool stopped, dropping {}", label);
            return false;
        }

        self.pending.count.fetch_add(1, Ordering::AcqRel);

        match self.sender.try_send(Job {
            label,
            work: work.boxed(),
        }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("worker queue full, dropping {}", label);
                self.pending.finish();
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("worker pool stopped, dropping {}", label);
                self.pending.finish();
                false
            }
        }
    }

    /// Waits until every queued job has run.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.pending.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.pending.count.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stops the workers. Running jobs finish, queued jobs that did not
    /// start are discarded.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("worker panicked: {}", e);
            }
        }

        for job in self.receiver.drain() {
            debug!("discarding {}", job.label);
            self.pending.finish();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
