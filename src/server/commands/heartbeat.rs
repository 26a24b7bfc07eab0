use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::db::{record_job, Queue, QueueCommand};
use crate::job::{JobId, JobStatus, WorkerId};
use crate::proto::{read_frame, write_frame, Beat};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeatState {
    Alive,
    Kill(String),
    /// The job is not (or no longer) assigned to this worker.
    Unknown,
}

async fn beat(tx: &Sender<QueueCommand>, worker: WorkerId, job: JobId) -> Result<BeatState> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(QueueCommand::Beat {
        worker,
        job,
        reply: reply_tx,
    })
    .await?;
    Ok(reply_rx.await?)
}

/// Serves one heartbeat stream until the worker closes it or is told to stop.
pub async fn handle_heartbeat<S, R>(
    mut send: S,
    mut recv: R,
    tx: &Sender<QueueCommand>,
    worker: WorkerId,
    job: JobId,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut state = beat(tx, worker, job).await?;
    if state == BeatState::Alive {
        write_frame(&mut send, &Beat::Alive).await?;
        while let Some(frame) = read_frame::<_, Beat>(&mut recv).await? {
            if frame != Beat::Ping {
                continue;
            }
            state = beat(tx, worker, job).await?;
            if state != BeatState::Alive {
                break;
            }
        }
    }

    let reason = match state {
        BeatState::Alive => {
            debug!(job = %job, worker = %worker, "heartbeat closed by worker");
            return Ok(());
        }
        BeatState::Kill(reason) => reason,
        BeatState::Unknown => format!("job {} is not assigned to worker {}", job, worker),
    };
    debug!(job = %job, worker = %worker, %reason, "sending kill");
    write_frame(&mut send, &Beat::Kill { reason }).await
}

pub fn do_beat(queue: &mut Queue, worker: WorkerId, job: JobId) -> BeatState {
    let Some(assignment) = queue.active.get_mut(&job) else {
        return BeatState::Unknown;
    };
    if assignment.worker != worker {
        return BeatState::Unknown;
    }
    assignment.last_seen = Instant::now();
    if assignment.job.status == JobStatus::Fetched {
        let _ = assignment.job.advance(JobStatus::Running);
    }
    match &assignment.kill {
        Some(reason) => BeatState::Kill(reason.clone()),
        None => BeatState::Alive,
    }
}

/// Requeues every assignment whose worker missed the grace deadline.
pub fn do_reap(queue: &mut Queue) {
    let grace = queue.grace;
    let expired: Vec<JobId> = queue
        .active
        .iter()
        .filter(|(_, a)| a.last_seen.elapsed() > grace)
        .map(|(id, _)| *id)
        .collect();

    for id in expired {
        let Some(assignment) = queue.active.remove(&id) else { continue };
        let output = queue.outputs.remove(&id).unwrap_or_default();
        let mut job = assignment.job;
        if let Some(reason) = assignment.kill {
            // cancelled and then lost: nothing left to run
            warn!(job = %id, worker = %assignment.worker, "cancelled job lost its worker");
            job.status = JobStatus::Killed;
            job.error = Some(reason);
            job.finished = Some(Utc::now());
            job.infiles.clear();
            if let Err(e) = record_job(&mut queue.conn, &job, &output) {
                warn!(job = %id, error = %e, "failed to record job");
            }
            queue.notify(&job);
            continue;
        }
        warn!(job = %id, worker = %assignment.worker, grace = ?grace, "heartbeat missed, requeueing job");
        job.requeue();
        queue.pending.push_front(job);
    }
}
