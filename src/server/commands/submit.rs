use anyhow::{bail, Result};
use chrono::Utc;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::info;

use crate::db::{Queue, QueueCommand};
use crate::job::{Job, JobId, JobStatus};

pub async fn handle_submit(tx: &Sender<QueueCommand>, job: Job) -> Result<JobId> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(QueueCommand::Submit { job, reply: reply_tx }).await?;
    reply_rx.await?
}

/// Submits and waits for the reported job.
pub async fn handle_run(tx: &Sender<QueueCommand>, job: Job) -> Result<Job> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(QueueCommand::Run { job, reply: reply_tx }).await?;
    reply_rx.await?
}

pub fn do_submit(queue: &mut Queue, mut job: Job) -> Result<JobId> {
    if job.command.is_empty() {
        bail!("job {} has no command", job.id);
    }
    if job.status != JobStatus::Queued {
        bail!("job {} was submitted in state {}", job.id, job.status);
    }
    let known = queue.active.contains_key(&job.id) || queue.pending.iter().any(|j| j.id == job.id);
    if known {
        bail!("job {} is already queued", job.id);
    }

    job.worker_id = None;
    job.submitted = Utc::now();
    let id = job.id;
    info!(job = %id, command = ?job.command, note = %job.note, "job submitted");
    queue.pending.push_back(job);
    Ok(id)
}

pub fn do_run(queue: &mut Queue, job: Job, reply: oneshot::Sender<Result<Job>>) {
    match do_submit(queue, job) {
        Ok(id) => queue.waiters.entry(id).or_default().push(reply),
        Err(e) => {
            let _ = reply.send(Err(e));
        }
    }
}
