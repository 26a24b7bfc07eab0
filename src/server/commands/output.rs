use anyhow::{anyhow, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::debug;

use crate::db::{load_job, load_outfile, load_output, Queue, QueueCommand};
use crate::job::JobId;
use crate::proto::{write_frame, Response};

const CHUNK: usize = 16 * 1024;

/// Forwards a worker's output stream into the queue as it arrives.
pub async fn handle_push_outfile<S, R>(mut send: S, mut recv: R, tx: &Sender<QueueCommand>, job: JobId) -> Result<()>
where
    S: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(QueueCommand::OpenOutput { job, reply: reply_tx }).await?;
    if !reply_rx.await? {
        let reason = format!("job {} has no active assignment", job);
        return write_frame(&mut send, &Response::Rejected { reason }).await;
    }

    let mut total = 0usize;
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = recv.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += n;
        tx.send(QueueCommand::AppendOutput {
            job,
            chunk: buf[..n].to_vec(),
        })
        .await?;
    }

    debug!(job = %job, bytes = total, "output stream finished");
    write_frame(&mut send, &Response::Accepted).await
}

pub async fn handle_retrieve_output(tx: &Sender<QueueCommand>, job: JobId) -> Result<Vec<u8>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(QueueCommand::RetrieveOutput { job, reply: reply_tx }).await?;
    reply_rx.await?
}

pub async fn handle_retrieve_outfile(tx: &Sender<QueueCommand>, job: JobId, name: String) -> Result<Vec<u8>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(QueueCommand::RetrieveOutfile {
        job,
        name,
        reply: reply_tx,
    })
    .await?;
    reply_rx.await?
}

pub fn do_open_output(queue: &mut Queue, job: JobId) -> bool {
    if !queue.active.contains_key(&job) {
        return false;
    }
    queue.outputs.entry(job).or_default();
    true
}

pub fn do_append_output(queue: &mut Queue, job: JobId, chunk: &[u8]) {
    // chunks racing a requeue are dropped with the assignment
    if let Some(output) = queue.outputs.get_mut(&job) {
        output.extend_from_slice(chunk);
    }
}

/// Output of a running job so far, or the full output of a reported one.
pub fn do_retrieve_output(queue: &mut Queue, job: JobId) -> Result<Vec<u8>> {
    if let Some(output) = queue.outputs.get(&job) {
        return Ok(output.clone());
    }
    if queue.active.contains_key(&job) || queue.pending.iter().any(|j| j.id == job) {
        return Ok(Vec::new());
    }
    load_output(&queue.conn, job)?.ok_or_else(|| anyhow!("unknown job {}", job))
}

pub fn do_retrieve_outfile(queue: &mut Queue, job: JobId, name: &str) -> Result<Vec<u8>> {
    if let Some(data) = load_outfile(&queue.conn, job, name)? {
        return Ok(data);
    }
    match load_job(&queue.conn, job)? {
        Some(record) => Err(anyhow!("job {} ({}) has no outfile {}", job, record.status, name)),
        None => Err(anyhow!("job {} has not been reported", job)),
    }
}
