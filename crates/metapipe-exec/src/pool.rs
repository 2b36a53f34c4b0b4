//! Bounded worker pool that releases results in canonical order.
//!
//! Items are numbered by their position in canonical order before they are
//! scheduled. A semaphore bounds the number of in-flight tasks in a
//! [`JoinSet`]; completed results pass through a [`ReorderBuffer`] so the
//! caller only ever observes them in index order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use metapipe_core::domain::{MetapipeError, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Per-item result that can fail the run under fail-fast.
pub trait ItemOutcome {
    fn failed(&self) -> bool;
}

impl<T, E> ItemOutcome for std::result::Result<T, E> {
    fn failed(&self) -> bool {
        self.is_err()
    }
}

/// Work applied to every item of a run.
#[async_trait]
pub trait ItemProcessor: Send + Sync + 'static {
    type Item: Send + 'static;
    type Output: ItemOutcome + Send + 'static;

    /// Process the item at canonical position `index`.
    async fn process(&self, index: usize, item: Self::Item) -> Self::Output;
}

/// Holds out-of-order results until every earlier index has arrived.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: usize,
    pending: BTreeMap<usize, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the result for `index` and return the newly contiguous prefix.
    pub fn push(&mut self, index: usize, value: T) -> Vec<(usize, T)> {
        self.pending.insert(index, value);
        let mut ready = Vec::new();
        while let Some(value) = self.pending.remove(&self.next) {
            ready.push((self.next, value));
            self.next += 1;
        }
        ready
    }

    /// Results still waiting for an earlier index.
    pub fn held(&self) -> usize {
        self.pending.len()
    }
}

/// The first failed item of a fail-fast run.
#[derive(Debug)]
pub struct Aborted<O> {
    pub index: usize,
    pub output: O,
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    fail_fast: bool,
    cancel: Arc<AtomicBool>,
}

impl WorkerPool {
    /// `cancel` is raised when a fail-fast run aborts; processors that share
    /// it observe the abort.
    pub fn new(workers: usize, fail_fast: bool, cancel: Arc<AtomicBool>) -> Self {
        Self {
            workers: workers.max(1),
            fail_fast,
            cancel,
        }
    }

    /// Process `items` and hand each output to `emit` in index order.
    ///
    /// Under fail-fast the first failed output stops scheduling, aborts every
    /// in-flight task and is returned instead of being emitted; nothing after
    /// it reaches `emit`.
    pub async fn run<P, F>(
        &self,
        processor: Arc<P>,
        items: Vec<P::Item>,
        mut emit: F,
    ) -> Result<Option<Aborted<P::Output>>>
    where
        P: ItemProcessor,
        F: FnMut(usize, P::Output) -> Result<()>,
    {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut join_set: JoinSet<Option<(usize, P::Output)>> = JoinSet::new();
        let mut pending = items.into_iter().enumerate().peekable();
        let mut reorder = ReorderBuffer::new();
        let mut aborted: Option<Aborted<P::Output>> = None;

        loop {
            let scheduling = aborted.is_none() && pending.peek().is_some();
            if !scheduling && join_set.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                Some(joined) = join_set.join_next(), if !join_set.is_empty() => {
                    match joined {
                        Ok(Some((index, output))) => {
                            if aborted.is_some() {
                                continue;
                            }
                            if self.fail_fast && output.failed() {
                                debug!(index, "item failed, aborting run");
                                self.cancel.store(true, Ordering::SeqCst);
                                join_set.abort_all();
                                aborted = Some(Aborted { index, output });
                                continue;
                            }
                            for (index, output) in reorder.push(index, output) {
                                if let Err(e) = emit(index, output) {
                                    self.cancel.store(true, Ordering::SeqCst);
                                    join_set.abort_all();
                                    return Err(e);
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => {
                            warn!(error = %e, "worker task panicked");
                            self.cancel.store(true, Ordering::SeqCst);
                            join_set.abort_all();
                            return Err(MetapipeError::Worker(e.to_string()));
                        }
                    }
                }

                permit = Arc::clone(&semaphore).acquire_owned(), if scheduling => {
                    let permit = permit.map_err(|e| MetapipeError::Worker(e.to_string()))?;
                    if let Some((index, item)) = pending.next() {
                        let processor = Arc::clone(&processor);
                        let cancel = Arc::clone(&self.cancel);
                        join_set.spawn(async move {
                            let _permit = permit;
                            if cancel.load(Ordering::SeqCst) {
                                return None;
                            }
                            Some((index, processor.process(index, item).await))
                        });
                    }
                }

                else => break,
            }
        }

        if aborted.is_none() && reorder.held() > 0 {
            return Err(MetapipeError::Worker(format!(
                "{} results never became contiguous",
                reorder.held()
            )));
        }
        Ok(aborted)
    }
}
