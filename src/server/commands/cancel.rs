use anyhow::{bail, Result};
use chrono::Utc;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::info;

use crate::db::{record_job, Queue, QueueCommand};
use crate::job::{JobId, JobStatus};

pub async fn handle_cancel(tx: &Sender<QueueCommand>, job: JobId) -> Result<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(QueueCommand::Cancel { job, reply: reply_tx }).await?;
    reply_rx.await?
}

/// Queued jobs are dropped; running jobs get a kill on their next ping.
pub fn do_cancel(queue: &mut Queue, id: JobId) -> Result<()> {
    if let Some(assignment) = queue.active.get_mut(&id) {
        info!(job = %id, worker = %assignment.worker, "cancelling running job");
        if assignment.kill.is_none() {
            assignment.kill = Some("cancelled by operator".to_string());
        }
        return Ok(());
    }

    let Some(pos) = queue.pending.iter().position(|j| j.id == id) else {
        bail!("job {} is neither queued nor running", id);
    };
    let Some(mut job) = queue.pending.remove(pos) else {
        bail!("job {} vanished from the queue", id);
    };
    info!(job = %id, "cancelling queued job");
    job.status = JobStatus::Killed;
    job.error = Some("cancelled before it ran".to_string());
    job.finished = Some(Utc::now());
    job.infiles.clear();
    record_job(&mut queue.conn, &job, &[])?;
    queue.notify(&job);
    Ok(())
}
