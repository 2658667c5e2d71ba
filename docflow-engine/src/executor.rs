use std::future::Future;
use std::sync::Arc;

use docflow_common::retry::RetryPolicy;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::StageError;
use crate::progress::StageProgress;

/// Per-item result of a bounded fan-out. Failures are carried alongside
/// successes so a stage can tolerate partial failure without losing track
/// of which items were dropped.
#[derive(Debug)]
pub enum ItemOutcome<R> {
    Ok(R),
    Failed(StageError),
}

impl<R> ItemOutcome<R> {
    pub fn is_ok(&self) -> bool {
        matches!(self, ItemOutcome::Ok(_))
    }

    pub fn ok(self) -> Option<R> {
        match self {
            ItemOutcome::Ok(r) => Some(r),
            ItemOutcome::Failed(_) => None,
        }
    }
}

/// Run `work` over `items` with at most `limit` in flight, preserving input
/// order in the returned outcomes. Each item is retried per `policy` on
/// transient errors; permanent errors fail the item immediately. No item
/// failure short-circuits the others.
///
/// Cancellation aborts pending and in-flight items and surfaces as
/// `StageError::Cancelled` for the whole call.
pub async fn run_bounded<T, R, F, Fut>(
    items: Vec<T>,
    limit: usize,
    cancel: &CancellationToken,
    policy: RetryPolicy,
    progress: Option<&StageProgress<'_>>,
    work: F,
) -> Result<Vec<ItemOutcome<R>>, StageError>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(usize, T) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<R, StageError>> + Send + 'static,
{
    let total = items.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks: JoinSet<(usize, ItemOutcome<R>)> = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        let work = work.clone();

        tasks.spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (index, ItemOutcome::Failed(StageError::Cancelled)),
            };
            let outcome = run_with_retry(index, item, &cancel, policy, work).await;
            drop(permit);
            (index, outcome)
        });
    }

    let mut outcomes: Vec<Option<ItemOutcome<R>>> = (0..total).map(|_| None).collect();
    let mut completed = 0usize;

    while let Some(joined) = tasks.join_next().await {
        let (index, outcome) = match joined {
            Ok(entry) => entry,
            Err(err) => {
                warn!("fan-out task failed to join: {}", err);
                continue;
            }
        };

        let was_cancelled = matches!(outcome, ItemOutcome::Failed(StageError::Cancelled));
        outcomes[index] = Some(outcome);
        completed += 1;

        if !was_cancelled {
            if let Some(progress) = progress {
                progress
                    .report(completed as f64 / total as f64 * 100.0)
                    .await;
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(StageError::Cancelled);
    }

    Ok(outcomes
        .into_iter()
        .map(|o| o.unwrap_or(ItemOutcome::Failed(StageError::Permanent("item lost".to_owned()))))
        .collect())
}

/// Retry loop for a single work item. The backoff sleep races cancellation
/// so a cancelled job never sits out a full backoff interval.
async fn run_with_retry<T, R, F, Fut>(
    index: usize,
    item: T,
    cancel: &CancellationToken,
    policy: RetryPolicy,
    work: F,
) -> ItemOutcome<R>
where
    T: Clone,
    F: Fn(usize, T) -> Fut,
    Fut: Future<Output = Result<R, StageError>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return ItemOutcome::Failed(StageError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ItemOutcome::Failed(StageError::Cancelled),
            result = work(index, item.clone()) => result,
        };

        match result {
            Ok(output) => return ItemOutcome::Ok(output),
            Err(err) if err.is_cancelled() => return ItemOutcome::Failed(err),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "item {} attempt {}/{} failed, retrying in {:?}: {}",
                    index,
                    attempt + 1,
                    policy.max_attempts(),
                    delay,
                    err
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return ItemOutcome::Failed(StageError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(err) => return ItemOutcome::Failed(err),
        }
    }
}
