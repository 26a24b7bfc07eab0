use anyhow::{anyhow, Result};
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::db::{record_job, Queue, QueueCommand};
use crate::job::{Job, JobStatus, WorkerId};

pub async fn handle_complete(tx: &Sender<QueueCommand>, worker: WorkerId, job: Job) -> Result<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(QueueCommand::Push {
        worker,
        job,
        reply: reply_tx,
    })
    .await?;
    reply_rx.await?
}

/// Accepts a finished job from the worker currently holding its assignment.
pub fn do_complete(queue: &mut Queue, worker: WorkerId, mut job: Job) -> Result<()> {
    match queue.active.get(&job.id) {
        Some(assignment) if assignment.worker == worker => {}
        _ => {
            warn!(job = %job.id, worker = %worker, "rejecting push for stale assignment");
            return Err(anyhow!("job {} is not assigned to worker {}", job.id, worker));
        }
    }
    if !matches!(job.status, JobStatus::Completed | JobStatus::Failed | JobStatus::Killed) {
        return Err(anyhow!("job {} pushed in state {}", job.id, job.status));
    }

    queue.active.remove(&job.id);
    let output = queue.outputs.remove(&job.id).unwrap_or_default();
    job.infiles.clear();
    job.worker_id = Some(worker);
    job.advance(JobStatus::Reported)?;

    info!(job = %job.id, worker = %worker, status = %job.status, error = ?job.error, "job reported");
    if let Err(e) = record_job(&mut queue.conn, &job, &output) {
        warn!(job = %job.id, error = %e, "failed to record job");
    }
    queue.notify(&job);
    Ok(())
}
