use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::queue::JobQueue;
use crate::service::JudgeService;
use crate::store::SubmissionStore;
use crate::verdict::TransitionError;

/// Pending submissions fetched per scan
const SCAN_BATCH: u32 = 64;

/// Judges submissions taken from `queue` until `shutdown` fires
///
/// `shutdown` only stops the worker from taking new jobs. Cancelling `abort`
/// also interrupts the submission being judged, which then resolves to
/// `ERROR`.
pub async fn worker(
    id: u8,
    service: JudgeService,
    queue: Arc<JobQueue>,
    shutdown: CancellationToken,
    abort: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            ticket = queue.pop() => {
                let submission_id = ticket.id();
                log::info!("Worker {id} got submission {submission_id} from queue");

                let cancel = abort.child_token();
                match service.evaluate_submission(submission_id, &cancel).await {
                    Ok(submission) if !submission.status.is_terminal() => {
                        log::info!("Worker {id} left submission {submission_id} pending");
                    }
                    Ok(submission) => {
                        log::debug!(
                            "Worker {id} finished submission {submission_id} as {}",
                            submission.status
                        );
                    }
                    Err(e) if e.downcast_ref::<TransitionError>().is_some() => {
                        log::warn!("Submission {submission_id} skipped on worker {id}: {e:#}");
                    }
                    Err(e) => {
                        log::error!("Judging submission {submission_id} failed on worker {id}: {e:#}");
                    }
                }
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

/// Periodically queues every submission still `PENDING` in the store
///
/// Submissions whose verdict could not be written stay `PENDING` and are
/// picked up again by a later scan.
pub async fn scan_pending(
    store: Arc<dyn SubmissionStore>,
    queue: Arc<JobQueue>,
    period: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match store.pending_submissions(SCAN_BATCH).await {
                    Ok(ids) => {
                        let queued = ids.into_iter().filter(|&id| queue.push(id)).count();
                        if queued > 0 {
                            log::info!("Queued {queued} pending submissions");
                        }
                    }
                    Err(e) => log::error!("Failed to scan pending submissions: {e:#}"),
                }
            }
        }
    }

    log::debug!("Pending scan stopped");
    Ok(())
}
