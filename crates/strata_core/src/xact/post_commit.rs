//! Work deferred until a transaction has finished.

use crate::error::CoreResult;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;

/// What a [`Serviceable`] wants after running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// The work is finished.
    Done,
    /// Run the work again later.
    Requeue,
}

/// A unit of post-commit work.
pub trait Serviceable: Send + fmt::Debug {
    /// Performs the work.
    ///
    /// # Errors
    ///
    /// Returns an error if the work failed; failed work is not retried.
    fn perform_work(&mut self) -> CoreResult<ServiceOutcome>;

    /// Whether the committing thread should run this work itself instead of
    /// handing it to the post-commit queue.
    fn service_immediately(&self) -> bool {
        false
    }
}

/// Engine-wide queue of post-commit work.
///
/// Work is only run when [`PostCommitQueue::run_pending`] is called; there
/// is no background thread.
#[derive(Debug, Default)]
pub struct PostCommitQueue {
    queue: Mutex<VecDeque<Box<dyn Serviceable>>>,
}

impl PostCommitQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends work to the queue.
    pub fn submit(&self, work: Box<dyn Serviceable>) {
        tracing::trace!(?work, "post-commit work queued");
        self.queue.lock().push_back(work);
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Runs every item queued at the time of the call once.
    ///
    /// Requeued items go to the back of the queue and are not run again in
    /// this pass. Failed items are logged and dropped. Returns the number of
    /// items that completed.
    pub fn run_pending(&self) -> usize {
        let batch: Vec<_> = self.queue.lock().drain(..).collect();
        let mut done = 0;
        for mut work in batch {
            match work.perform_work() {
                Ok(ServiceOutcome::Done) => done += 1,
                Ok(ServiceOutcome::Requeue) => self.queue.lock().push_back(work),
                Err(err) => tracing::warn!(?work, error = %err, "post-commit work failed"),
            }
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct Counter {
        runs: Arc<AtomicUsize>,
        requeues: usize,
    }

    impl Serviceable for Counter {
        fn perform_work(&mut self) -> CoreResult<ServiceOutcome> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.requeues > 0 {
                self.requeues -= 1;
                return Ok(ServiceOutcome::Requeue);
            }
            Ok(ServiceOutcome::Done)
        }
    }

    #[derive(Debug)]
    struct Failing;

    impl Serviceable for Failing {
        fn perform_work(&mut self) -> CoreResult<ServiceOutcome> {
            Err(CoreError::invalid_argument("boom"))
        }
    }

    #[test]
    fn requeued_work_runs_on_the_next_pass() {
        let runs = Arc::new(AtomicUsize::new(0));
        let queue = PostCommitQueue::new();
        queue.submit(Box::new(Counter {
            runs: runs.clone(),
            requeues: 1,
        }));
        assert_eq!(queue.run_pending(), 0);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.run_pending(), 1);
        assert!(queue.is_empty());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_work_is_dropped() {
        let queue = PostCommitQueue::new();
        queue.submit(Box::new(Failing));
        assert_eq!(queue.run_pending(), 0);
        assert!(queue.is_empty());
    }
}
