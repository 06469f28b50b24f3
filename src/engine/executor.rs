//! Single-threaded FIFO executor backing one worker.
//!
//! Jobs submitted to an [`Executor`] run one at a time, in submission order,
//! on a dedicated thread. Each submission returns a [`TaskHandle`] the caller
//! joins to get the job's result.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tracing::error;

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a job's result.
///
/// Joining does not depend on an async runtime, so it is safe to call from a
/// thread that is driving one.
#[must_use = "a task handle must be joined to observe the task's result"]
#[derive(Debug)]
pub struct TaskHandle<T> {
    receiver: std_mpsc::Receiver<Result<T>>,
    rank: usize,
}

impl<T> TaskHandle<T> {
    /// Block until the job finishes.
    ///
    /// Returns [`Error::WorkerDisconnected`] if the executor went away before
    /// running it.
    pub fn join(self) -> Result<T> {
        self.receiver
            .recv()
            .map_err(|_| Error::WorkerDisconnected(self.rank))?
    }

    /// Rank of the worker running the job.
    pub fn rank(&self) -> usize {
        self.rank
    }
}

/// One thread, one queue.
#[derive(Debug)]
pub struct Executor {
    sender: Option<mpsc::UnboundedSender<Job>>,
    thread: Option<JoinHandle<()>>,
    rank: usize,
}

impl Executor {
    /// Spawn the executor thread for worker `rank`.
    pub fn new(rank: usize) -> Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let thread = thread::Builder::new()
            .name(format!("paged-llm-worker-{rank}"))
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    job();
                }
            })?;

        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
            rank,
        })
    }

    /// Queue `f` behind every job submitted before it.
    ///
    /// A panic inside `f` is caught and reported through the handle as
    /// [`Error::TaskPanicked`].
    pub fn submit<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = std_mpsc::sync_channel(1);
        let rank = self.rank;
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
                let msg = panic_message(payload.as_ref());
                error!(rank, "worker task panicked: {msg}");
                Err(Error::TaskPanicked(msg))
            });
            // The caller may have dropped the handle.
            let _ = tx.send(result);
        });

        if let Some(sender) = &self.sender {
            // On failure the job, and with it `tx`, is dropped: join() reports
            // the disconnect.
            let _ = sender.send(job);
        }
        TaskHandle { receiver: rx, rank }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Closing the queue lets the thread finish pending jobs and exit.
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_jobs_run_in_order() {
        let executor = Executor::new(0).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let log = Arc::clone(&log);
                executor.submit(move || {
                    log.lock().unwrap().push(i);
                    Ok(i * 2)
                })
            })
            .collect();

        let results: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, (0..10).map(|i| i * 2).collect::<Vec<_>>());
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_error_is_returned() {
        let executor = Executor::new(3).unwrap();
        let handle = executor.submit(|| -> Result<()> { Err(Error::Config("bad".into())) });
        assert_eq!(handle.rank(), 3);
        assert!(matches!(handle.join(), Err(Error::Config(_))));
    }

    #[test]
    fn test_panic_is_caught_and_executor_survives() {
        let executor = Executor::new(0).unwrap();
        let handle = executor.submit(|| -> Result<()> { panic!("boom") });
        match handle.join() {
            Err(Error::TaskPanicked(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(executor.submit(|| Ok(1)).join().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_join_from_async_context() {
        let executor = Executor::new(0).unwrap();
        assert_eq!(executor.submit(|| Ok(5)).join().unwrap(), 5);
    }

    #[test]
    fn test_join_after_executor_dropped() {
        let executor = Executor::new(2).unwrap();
        let handle = executor.submit(|| Ok(1));
        drop(executor);
        // Pending jobs still run before the thread exits.
        assert_eq!(handle.join().unwrap(), 1);
    }
}
