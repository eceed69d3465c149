//! Fixed-size worker pool pulling from the shared queue.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::worker::{DispatchContext, DispatchWorker};

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn `size` workers. The queue's admission control already bounds
    /// concurrency; the pool size matches it so no worker sits idle while
    /// slots are free.
    pub fn spawn(ctx: Arc<DispatchContext>, size: usize) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handles = (0..size)
            .map(|index| {
                let ctx = ctx.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    debug!(worker = index, "dispatch worker started");
                    let worker = DispatchWorker::new(ctx.clone());
                    // dequeue waits at most one poll interval, which bounds
                    // shutdown latency.
                    while !*rx.borrow() {
                        if let Some(job) = ctx.queue.dequeue().await {
                            worker.process(job).await;
                        }
                    }
                    debug!(worker = index, "dispatch worker stopped");
                })
            })
            .collect();
        Self { handles, shutdown }
    }

    /// Stop pulling new jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
