use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::frontend::Frontend;
use crate::judge;
use crate::queue::JudgeQueue;

/// How long a pop may block before the worker re-checks for shutdown.
const POP_TIMEOUT: Duration = Duration::from_secs(1);

/// One judge worker. Bound to sandbox box id = `id`; keeps pulling until
/// shutdown is requested and the queue has drained.
pub async fn judge_worker(
    id: u32,
    settings: Arc<Settings>,
    queue: Arc<JudgeQueue>,
    frontend: Frontend,
    token: CancellationToken,
) {
    log::info!("worker {id} initialized");

    loop {
        let job = match tokio::time::timeout(POP_TIMEOUT, queue.pop()).await {
            Ok(job) => job,
            Err(_) => {
                if token.is_cancelled() && queue.is_empty() {
                    break;
                }
                continue;
            }
        };

        let submission_id = job.request.submission.id;
        log::info!("worker {id} got submission {submission_id} from queue");

        // The pipeline is all subprocesses and file I/O; run it off the
        // async runtime. The JoinHandle contains panics so a judging bug
        // cannot take the worker down.
        let blocking_settings = settings.clone();
        let handle =
            tokio::task::spawn_blocking(move || judge::judge(&job, id, &blocking_settings));

        match handle.await {
            Ok(Ok(outcome)) => {
                if settings.debug {
                    log::info!("worker {id}: submission {submission_id} outcome: {outcome:?}");
                    continue;
                }
                let report = outcome.into_report();
                if let Err(e) = frontend.report(submission_id, &report).await {
                    log::error!(
                        "worker {id}: failed to report submission {submission_id}: {e:#}"
                    );
                }
            }
            Ok(Err(e)) => {
                log::error!("worker {id}: error judging submission {submission_id}: {e:#}");
            }
            Err(e) => {
                log::error!("worker {id}: judging submission {submission_id} panicked: {e}");
            }
        }
    }

    log::info!("worker {id} has shut down gracefully");
}
