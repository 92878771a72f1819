//! A labelled queue that runs jobs one at a time on a dedicated thread.

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// The queue's worker has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("the serial queue is closed")]
pub struct QueueClosed;

/// Serial executor backed by one OS thread.
///
/// Jobs run in submission order. A panicking job is logged and does not
/// stop the worker.
pub struct SerialQueue {
    label: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl SerialQueue {
    /// Spawns the worker thread.
    ///
    /// # Errors
    /// Returns error if the thread cannot be spawned.
    pub fn new(label: impl Into<String>) -> std::io::Result<Self> {
        let label = label.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let worker_label = label.clone();
        thread::Builder::new().name(label.clone()).spawn(move || {
            while let Some(job) = receiver.blocking_recv() {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                    error!(
                        queue = %worker_label,
                        panic = panic_message(panic.as_ref()),
                        "Job panicked on serial queue"
                    );
                }
            }
            debug!(queue = %worker_label, "Serial queue worker stopped");
        })?;
        Ok(Self {
            label,
            sender: Mutex::new(Some(sender)),
        })
    }

    /// Queue label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Enqueues a job. Returns false if the queue is closed.
    pub fn dispatch<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .lock()
            .as_ref()
            .is_some_and(|sender| sender.send(Box::new(job)).is_ok())
    }

    /// Enqueues a job now and returns a future of its result.
    pub fn run<F, R>(&self, job: F) -> impl Future<Output = Result<R, QueueClosed>> + Send + 'static
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.dispatch(move || {
            let _ = tx.send(job());
        });
        async move { rx.await.map_err(|_| QueueClosed) }
    }

    /// Blocks the calling thread until every job queued so far has run.
    #[cfg(test)]
    pub(crate) fn drain(&self) -> Result<(), QueueClosed> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(move || {
            let _ = tx.send(());
        });
        rx.blocking_recv().map_err(|_| QueueClosed)
    }

    /// Stops accepting jobs. Already queued jobs still run.
    pub fn close(&self) {
        self.sender.lock().take();
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let queue = SerialQueue::new("test.order").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut futures = Vec::new();
        for i in 0..20 {
            let log = log.clone();
            futures.push(queue.run(move || log.lock().push(i)));
        }
        for future in futures {
            future.await.unwrap();
        }
        assert_eq!(*log.lock(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_panic_does_not_kill_worker() {
        let queue = SerialQueue::new("test.panic").unwrap();
        let failed = queue.run(|| -> u32 { panic!("boom") });
        assert_eq!(failed.await, Err(QueueClosed));
        assert_eq!(queue.run(|| 7).await, Ok(7));
    }

    #[test]
    fn test_drain_waits_for_queued_jobs() {
        let queue = SerialQueue::new("test.drain").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            queue.dispatch(move || log.lock().push(i));
        }
        queue.drain().unwrap();
        assert_eq!(log.lock().len(), 5);
    }

    #[tokio::test]
    async fn test_close_rejects_new_jobs() {
        let queue = SerialQueue::new("test.close").unwrap();
        let pending = queue.run(|| 3);
        queue.close();
        assert_eq!(pending.await, Ok(3));
        assert!(!queue.dispatch(|| {}));
        assert_eq!(queue.run(|| 4).await, Err(QueueClosed));
    }
}
