//! Async item processing with admission control.
//!
//! The key concepts here are borrowed from ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html). In order to
//! prevent overload, we limit the number of work items that may be "in flight"
//! at any one time, and once that limit is reached, [`WorkQueue::submit`] will
//! wait until one of the in-flight items is completed.
//!
//! Cancellation is cooperative. Once the queue's [`CancellationToken`] fires,
//! no new items are admitted, and admitted items that have not started yet are
//! skipped. Items that are already running are allowed to finish.
//!
//! Note that this is a strictly "in process" queue meant for closely-related
//! subtasks of a larger task. It does not attempt to handle priorities or
//! starvation.

use std::sync::Arc;

use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::prelude::*;

/// Was a work item accepted?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The item holds a slot and will run unless cancelled before it starts.
    Admitted,
    /// The queue was cancelled. The item was dropped unrun.
    Cancelled,
}

/// What happened to the admitted items.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items that actually ran.
    pub ran: usize,
    /// Items that were admitted, but saw the cancellation before starting.
    pub skipped: usize,
}

/// A bounded pool of concurrent tasks.
pub struct WorkQueue {
    /// One permit per concurrently running item.
    permits: Arc<Semaphore>,

    /// Admitted items. Each returns `true` if it ran.
    tasks: JoinSet<bool>,

    /// Stops admission when cancelled.
    cancel: CancellationToken,

    /// Results of items we've already reaped.
    stats: QueueStats,
}

impl WorkQueue {
    /// Create a new work queue running at most `concurrency_limit` items at
    /// once. A limit of 0 is treated as 1.
    pub fn new(concurrency_limit: usize, cancel: CancellationToken) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency_limit.max(1))),
            tasks: JoinSet::new(),
            cancel,
            stats: QueueStats::default(),
        }
    }

    /// Submit a work item, waiting until a slot is free or the queue is
    /// cancelled, whichever happens first.
    pub async fn submit<F>(&mut self, work: F) -> Result<Admission>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Ok(Admission::Cancelled);
        }

        let permit = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => return Ok(Admission::Cancelled),

            permit = self.permits.clone().acquire_owned() => {
                permit.context("work queue semaphore was closed")?
            }
        };

        self.reap_finished();

        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let _permit = permit;
            if cancel.is_cancelled() {
                return false;
            }
            work.await;
            true
        });
        Ok(Admission::Admitted)
    }

    /// Stop admitting new items.
    #[cfg(test)]
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Has this queue been cancelled?
    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for every admitted item to finish.
    pub async fn drain(mut self) -> QueueStats {
        while let Some(result) = self.tasks.join_next().await {
            self.record(result);
        }
        self.stats
    }

    /// Collect results from items that have already finished, so that the
    /// [`JoinSet`] doesn't grow without bound.
    fn reap_finished(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            self.record(result);
        }
    }

    fn record(&mut self, result: Result<bool, JoinError>) {
        match result {
            Ok(true) => self.stats.ran += 1,
            Ok(false) => self.stats.skipped += 1,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => warn!("Work item was aborted: {}", err),
        }
    }
}
