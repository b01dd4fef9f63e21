//! Fixed-size worker pool with a bounded join.

use crate::error::Error;
use core::future::Future;
use core::time::Duration;
use hashbrown::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// How long a stage waits for its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinLimits {
    /// Bound on the join before cancellation is signalled.
    pub deadline: Duration,
    /// Time given to cancelled workers before they are aborted.
    pub grace: Duration,
}

impl Default for JoinLimits {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(60),
            grace: Duration::from_secs(1),
        }
    }
}

/// Outcome of one worker.
#[derive(Debug, Clone)]
pub struct WorkerReport<T> {
    pub index: usize,
    pub key: String,
    pub outcome: Result<T, Error>,
}

/// Outcomes of every worker in a stage, ordered by index.
#[derive(Debug, Clone)]
pub struct StageReport<T> {
    pub workers: Vec<WorkerReport<T>>,
    /// Whether the join deadline was reached.
    pub timed_out: bool,
}

impl<T> StageReport<T> {
    pub fn succeeded(&self) -> usize {
        self.workers.iter().filter(|w| w.outcome.is_ok()).count()
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&WorkerReport<T>> {
        self.workers.iter().find(|w| w.key == key)
    }

    /// Counts outcomes by kind: `ok` or the error's [`Error::kind`].
    pub fn tally(&self) -> HashMap<&'static str, usize> {
        let mut tally = HashMap::new();
        for worker in &self.workers {
            let kind = match &worker.outcome {
                Ok(_) => "ok",
                Err(err) => err.kind(),
            };
            *tally.entry(kind).or_insert(0) += 1;
        }
        tally
    }

    /// One-line summary for the end-of-stage log.
    pub fn summary(&self) -> String {
        let mut kinds: Vec<_> = self.tally().into_iter().collect();
        kinds.sort_unstable();
        let kinds = kinds
            .iter()
            .map(|(kind, n)| format!("{kind}={n}"))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "{} workers [{}]{}",
            self.workers.len(),
            kinds,
            if self.timed_out { " (deadline hit)" } else { "" }
        )
    }
}

pub struct WorkerPool<T> {
    slots: Arc<Semaphore>,
    tasks: JoinSet<WorkerReport<T>>,
    // Submitted workers that have not reported yet: index -> key.
    pending: HashMap<usize, String>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(size: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(size)),
            tasks: JoinSet::new(),
            pending: HashMap::with_capacity(size),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawns a worker. `work` receives a token that fires when the stage
    /// deadline passes; it should stop and return [`Error::Interrupted`].
    pub fn submit<F, Fut>(&mut self, index: usize, key: String, work: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        let token = self.cancel.child_token();
        let work = work(token.clone());
        self.pending.insert(index, key.clone());

        // The semaphore stands in for the pool's fixed slots: a task only
        // starts its work once it holds a permit. A task still waiting for a
        // slot when the deadline passes gives up through the token, or
        // through the closed semaphore.
        let task = async move {
            let outcome = tokio::select! {
                permit = slots.acquire_owned() => match permit {
                    Ok(_permit) => work.await,
                    Err(_) => Err(Error::Interrupted { key: key.clone() }),
                },
                () = token.cancelled() => Err(Error::Interrupted { key: key.clone() }),
            };
            if let Err(err) = &outcome {
                tracing::error!(
                    index,
                    key = %key,
                    "Error with connection {}: {err}",
                    index + 1
                );
            }
            WorkerReport {
                index,
                key,
                outcome,
            }
        };
        self.tasks.spawn(task.instrument(tracing::Span::current()));
    }

    /// Waits for every submitted worker, bounded by `limits`.
    pub async fn join(mut self, limits: JoinLimits) -> StageReport<T> {
        let mut workers = Vec::with_capacity(self.pending.len());

        let timed_out = timeout(
            limits.deadline,
            drain(&mut self.tasks, &mut self.pending, &mut workers),
        )
        .await
        .is_err();

        // Past the deadline, cancel first so cooperative workers close their
        // connections and report `Interrupted`. Whatever has not yielded
        // after the grace period is aborted; its connection is released
        // when the task is dropped.
        if timed_out {
            tracing::warn!(
                "Join deadline of {:?} reached with {} workers outstanding, cancelling",
                limits.deadline,
                self.pending.len()
            );
            self.cancel.cancel();
            self.slots.close();

            let drained = timeout(
                limits.grace,
                drain(&mut self.tasks, &mut self.pending, &mut workers),
            )
            .await;
            if drained.is_err() {
                tracing::warn!("Aborting {} unresponsive workers", self.pending.len());
                self.tasks.abort_all();
                drain(&mut self.tasks, &mut self.pending, &mut workers).await;
            }
        }

        // Aborted and panicked tasks never reported for themselves.
        for (index, key) in self.pending.drain() {
            let err = Error::Abandoned { key: key.clone() };
            tracing::error!(index, key = %key, "{err}");
            workers.push(WorkerReport {
                index,
                key,
                outcome: Err(err),
            });
        }

        workers.sort_unstable_by_key(|w| w.index);

        StageReport { workers, timed_out }
    }
}

async fn drain<T: 'static>(
    tasks: &mut JoinSet<WorkerReport<T>>,
    pending: &mut HashMap<usize, String>,
    workers: &mut Vec<WorkerReport<T>>,
) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => {
                pending.remove(&report.index);
                workers.push(report);
            }
            // Stays in `pending` and is reported as abandoned.
            Err(err) if err.is_panic() => tracing::error!("Worker panicked: {err}"),
            Err(_) => tracing::trace!("Worker aborted"),
        }
    }
}
