use std::time::Instant;

use anyhow::Result;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::db::{Assignment, Queue, QueueCommand};
use crate::job::{CachedFile, Job, JobStatus, WorkerId};

pub async fn handle_dispatch(tx: &Sender<QueueCommand>, worker: WorkerId, cached: Vec<CachedFile>) -> Result<Option<Job>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(QueueCommand::Fetch {
        worker,
        cached,
        reply: reply_tx,
    })
    .await?;

    Ok(reply_rx.await?)
}

/// Assigns the oldest queued job to `worker`.
///
/// Payloads of cache-marked infiles the worker already holds with the same
/// content are left out of the copy that is sent; the queue keeps the full job
/// for requeueing.
pub fn do_dispatch(queue: &mut Queue, worker: WorkerId, cached: &[CachedFile]) -> Option<Job> {
    let mut job = queue.pending.pop_front()?;
    if let Err(e) = job.advance(JobStatus::Fetched) {
        warn!(job = %job.id, error = %e, "dropping unrunnable job");
        return None;
    }

    let mut sent = job.clone();
    for file in sent.infiles.iter_mut() {
        if file.cache && cached.iter().any(|c| c.holds(file)) {
            file.data = None;
        }
    }

    info!(job = %job.id, worker = %worker, "job assigned");
    queue.active.insert(
        job.id,
        Assignment {
            job,
            worker,
            last_seen: Instant::now(),
            kill: None,
        },
    );
    Some(sent)
}
