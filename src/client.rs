use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::heartbeat::HeartbeatSession;
use crate::job::{CachedFile, Job, JobId, WorkerId};
use crate::proto::{expect_frame, write_frame, Request, Response};
use crate::transport::Transport;

/// Replies from the queue that callers need to tell apart.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("queue rejected the request: {0}")]
    Rejected(String),
    #[error("unexpected reply from queue: {0}")]
    UnexpectedReply(String),
}

fn unexpected(reply: Response) -> anyhow::Error {
    match reply {
        Response::Rejected { reason } => ClientError::Rejected(reason).into(),
        other => ClientError::UnexpectedReply(format!("{:?}", other)).into(),
    }
}

/// Request/response operations against the queue.
pub struct Client<T> {
    transport: T,
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    async fn request(&self, req: &Request) -> Result<Response> {
        let (mut send, mut recv) = self.transport.open().await?;
        write_frame(&mut send, req).await?;
        send.shutdown().await?;
        expect_frame(&mut recv).await
    }

    /// Asks for one job. `Ok(None)` means the queue is empty.
    pub async fn fetch(&self, worker: WorkerId, cached: Vec<CachedFile>) -> Result<Option<Job>> {
        match self.request(&Request::Fetch { worker, cached }).await? {
            Response::Job(job) => Ok(Some(job)),
            Response::NoJob => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    pub async fn heartbeat(&self, worker: WorkerId, job: JobId) -> Result<HeartbeatSession<T::Send, T::Recv>> {
        let (send, recv) = self.transport.open().await?;
        HeartbeatSession::open(send, recv, worker, job)
            .await
            .context("opening heartbeat")
    }

    /// Streams `output` to the queue as it is produced. Returns the number of
    /// bytes forwarded.
    pub async fn push_outfile<R>(&self, job: JobId, mut output: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let (mut send, mut recv) = self.transport.open().await?;
        write_frame(&mut send, &Request::PushOutfile { job }).await?;
        let copied = tokio::io::copy(&mut output, &mut send).await;
        let copied = match copied {
            Ok(n) => n,
            Err(e) => {
                // a rejection closes the stream early, prefer its reason
                if let Ok(reply) = expect_frame::<_, Response>(&mut recv).await {
                    return Err(unexpected(reply));
                }
                return Err(e).context("streaming job output");
            }
        };
        send.shutdown().await?;
        match expect_frame(&mut recv).await? {
            Response::Accepted => Ok(copied),
            other => Err(unexpected(other)),
        }
    }

    /// Reports a finished job. A stale assignment comes back as
    /// [`ClientError::Rejected`].
    pub async fn push(&self, worker: WorkerId, job: Job) -> Result<()> {
        match self.request(&Request::Push { worker, job }).await? {
            Response::Accepted => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn submit(&self, job: Job) -> Result<JobId> {
        match self.request(&Request::Submit { job }).await? {
            Response::Submitted(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    /// Submits a job and waits until a worker has reported it.
    pub async fn run(&self, job: Job) -> Result<Job> {
        match self.request(&Request::Run { job }).await? {
            Response::Job(job) => Ok(job),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cancel(&self, job: JobId) -> Result<()> {
        match self.request(&Request::Cancel { job }).await? {
            Response::Accepted => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Combined output the queue has received for a job so far.
    pub async fn retrieve_output(&self, job: JobId) -> Result<Vec<u8>> {
        let (mut send, mut recv) = self.transport.open().await?;
        write_frame(&mut send, &Request::RetrieveOutput { job }).await?;
        send.shutdown().await?;
        match expect_frame(&mut recv).await? {
            Response::Accepted => {
                let mut data = Vec::new();
                recv.read_to_end(&mut data).await?;
                Ok(data)
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn retrieve_outfile_data(&self, job: JobId, name: &str) -> Result<Vec<u8>> {
        let req = Request::RetrieveOutfileData {
            job,
            name: name.to_string(),
        };
        match self.request(&req).await? {
            Response::Data(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }
}
