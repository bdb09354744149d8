//! Single-worker FIFO executors.
//!
//! Device I/O blocks, and calls on one token must never interleave, so
//! each token (plus enumeration as a whole) gets a dedicated worker
//! thread draining an unbounded queue. Handlers stay async: they submit
//! a closure and await its result over a oneshot channel.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

type Job = Box<dyn FnOnce() + Send>;

/// The executor's worker disappeared before delivering a result.
#[derive(Debug, Error)]
#[error("executor worker terminated")]
pub struct ExecutorGone;

/// A FIFO work queue backed by one named worker thread.
///
/// Tasks run strictly in submission order. Dropping the executor lets
/// the worker finish the queued tasks and exit.
pub struct Executor {
    tx: mpsc::UnboundedSender<Job>,
}

impl Executor {
    /// Spawn the worker thread.
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let thread_name = format!("tokend-{name}");
        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job();
                }
                trace!("worker {thread_name} stopped");
            })
            .expect("failed to spawn executor worker");
        Self { tx }
    }

    /// Run `task` on the worker and await its result.
    pub async fn run<T, F>(&self, task: F) -> Result<T, ExecutorGone>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Box::new(move || {
                // receiver may be gone if the request was abandoned
                let _ = done_tx.send(task());
            }))
            .map_err(|_| ExecutorGone)?;
        done_rx.await.map_err(|_| ExecutorGone)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let executor = Executor::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        // tokio::join! polls in declaration order on its first pass, so
        // the jobs are enqueued 0..4 before any result is awaited
        let task = |i: usize| {
            let order = order.clone();
            executor.run(move || {
                std::thread::sleep(Duration::from_millis(2));
                order.lock().unwrap().push(i);
            })
        };
        let (a, b, c, d, e) = tokio::join!(task(0), task(1), task(2), task(3), task(4));
        for r in [a, b, c, d, e] {
            r.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tasks_on_one_executor_never_overlap() {
        let executor = Arc::new(Executor::new("serial"));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let executor = executor.clone();
            let active = active.clone();
            let max_active = max_active.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .run(move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(2));
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn results_come_back_to_the_caller() {
        let executor = Executor::new("results");
        let value = executor.run(|| 21 * 2).await.unwrap();
        assert_eq!(value, 42);

        let text = executor
            .run(|| "computed on the worker".to_owned())
            .await
            .unwrap();
        assert_eq!(text, "computed on the worker");
    }

    #[tokio::test]
    async fn distinct_executors_run_in_parallel() {
        let a = Executor::new("a");
        let b = Executor::new("b");

        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        // task on `a` blocks until the task on `b` has run
        let blocked = a.run(move || gate_rx.recv().unwrap());
        let unblocker = b.run(move || gate_tx.send(()).unwrap());

        let (r1, r2) = tokio::join!(blocked, unblocker);
        r1.unwrap();
        r2.unwrap();
    }
}
