use anyhow::{bail, Result};
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::job::{CachedFile, Job, JobId, WorkerId};

/// Upper bound on a single frame, large enough for big infile payloads.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// First frame written on every stream opened against the queue.
#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
	Fetch { worker: WorkerId, cached: Vec<CachedFile> },
	Heartbeat { worker: WorkerId, job: JobId },
	PushOutfile { job: JobId },
	Push { worker: WorkerId, job: Job },
	Submit { job: Job },
	Run { job: Job },
	Cancel { job: JobId },
	RetrieveOutput { job: JobId },
	RetrieveOutfileData { job: JobId, name: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
	Job(Job),
	NoJob,
	Submitted(JobId),
	Accepted,
	Rejected { reason: String },
	Data(Vec<u8>),
}

/// Frames exchanged on a heartbeat stream after the opening request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Beat {
	Alive,
	Ping,
	Kill { reason: String },
}

pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> Result<()>
where
	W: AsyncWrite + Unpin,
	T: serde::Serialize,
{
	let vec = postcard::to_allocvec(msg)?;
	if vec.len() > MAX_FRAME_LEN as usize {
		bail!("frame of {} bytes exceeds limit", vec.len());
	}
	w.write_u32_le(vec.len() as u32).await?;
	w.write_all(&vec).await?;
	w.flush().await?;
	Ok(())
}

/// Reads one frame, returning `None` on a clean end of stream.
pub async fn read_frame<R, T>(r: &mut R) -> Result<Option<T>>
where
	R: AsyncRead + Unpin,
	T: DeserializeOwned,
{
	let len = match r.read_u32_le().await {
		Ok(len) => len,
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(e.into()),
	};
	if len > MAX_FRAME_LEN {
		bail!("frame length {} exceeds limit", len);
	}
	let mut buf = vec![0u8; len as usize];
	r.read_exact(&mut buf).await?;
	Ok(Some(postcard::from_bytes(&buf)?))
}

/// Like [`read_frame`] but treats end of stream as an error.
pub async fn expect_frame<R, T>(r: &mut R) -> Result<T>
where
	R: AsyncRead + Unpin,
	T: DeserializeOwned,
{
	match read_frame(r).await? {
		Some(msg) => Ok(msg),
		None => bail!("stream closed before a reply was received"),
	}
}
