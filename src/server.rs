pub mod commands;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, Sender};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::config::Config;
use crate::db::{self, loop_db, Queue, QueueCommand};
use crate::proto::{expect_frame, write_frame, Request, Response};
use crate::server::commands::{
	handle_cancel, handle_complete, handle_dispatch, handle_heartbeat, handle_push_outfile, handle_retrieve_outfile,
	handle_retrieve_output, handle_run, handle_submit,
};
use crate::transport::{transport_config, LocalTransport};
use crate::worker::{Worker, WorkerConfig};

pub const DEFAULT_PORT: u16 = 9753;

#[derive(Debug, Clone)]
pub struct ServeOptions {
	pub listen: SocketAddr,
	pub grace: Duration,
	/// Where reported jobs are recorded; `None` keeps them in memory.
	pub db: Option<PathBuf>,
	/// Workers run inside the server process, next to the remote ones.
	pub local_workers: usize,
	pub worker: WorkerConfig,
}

pub fn run(config: &Config, opts: ServeOptions) -> Result<()> {
	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?;

	runtime.block_on(async move {
		let conn = db::init(opts.db.as_deref())?;
		let (tx, rx) = mpsc::channel(256);

		let db_fut = tokio::spawn(loop_db(rx, Queue::new(conn, opts.grace)));
		let quinn_fut = tokio::spawn(loop_quinn(server_config(config)?, opts.listen, tx.clone()));

		let mut workers = JoinSet::new();
		for _ in 0..opts.local_workers {
			let worker = Worker::new(Client::new(LocalTransport::new(tx.clone())), opts.worker.clone())?;
			workers.spawn(worker.run());
		}

		info!(listen = %opts.listen, local_workers = opts.local_workers, "queue server running");

		let e = tokio::select! {
			e = quinn_fut => {
				e??;
				anyhow!("QUIC loop exited unexpectedly")
			}
			e = db_fut => {
				e??;
				anyhow!("queue loop exited unexpectedly")
			}
			_ = tokio::signal::ctrl_c() => {
				info!("interrupted, shutting down");
				return Ok(());
			}
		};

		Err(e)
	})
}

fn server_config(config: &Config) -> Result<quinn::ServerConfig> {
	let mut server_config = quinn::ServerConfig::with_single_cert(vec![config.cert.clone()], config.key.clone())?;
	server_config.transport_config(Arc::new(transport_config()?));
	Ok(server_config)
}

async fn loop_quinn(server_config: quinn::ServerConfig, listen: SocketAddr, tx: Sender<QueueCommand>) -> Result<()> {
	let endpoint = quinn::Endpoint::server(server_config, listen)?;

	while let Some(conn) = endpoint.accept().await {
		let _tx = tx.clone();
		tokio::spawn(async move {
			match conn.await {
				Ok(connection) => {
					let remote = connection.remote_address();
					debug!(%remote, "connection accepted");
					loop {
						match connection.accept_bi().await {
							Ok((send, recv)) => {
								let _tx = _tx.clone();
								tokio::spawn(async move {
									if let Err(e) = handle_bi(send, recv, _tx).await {
										warn!(%remote, error = %e, "request failed");
									}
								});
							}
							Err(e) => {
								debug!(%remote, error = %e, "connection closed");
								return;
							}
						}
					}
				}
				Err(e) => warn!(error = %e, "incoming connection failed"),
			}
		});
	}

	Ok(())
}

/// Serves one request stream; the first frame says what the peer wants.
pub async fn handle_bi<S, R>(mut send: S, mut recv: R, tx: Sender<QueueCommand>) -> Result<()>
where
	S: AsyncWrite + Unpin + Send,
	R: AsyncRead + Unpin + Send,
{
	let msg: Request = expect_frame(&mut recv).await?;

	let result = match msg {
		Request::Fetch { worker, cached } => {
			let reply = match handle_dispatch(&tx, worker, cached).await? {
				Some(job) => Response::Job(job),
				None => Response::NoJob,
			};
			write_frame(&mut send, &reply).await
		}
		Request::Heartbeat { worker, job } => handle_heartbeat(&mut send, &mut recv, &tx, worker, job).await,
		Request::PushOutfile { job } => handle_push_outfile(&mut send, &mut recv, &tx, job).await,
		Request::Push { worker, job } => {
			let reply = handle_complete(&tx, worker, job).await.map(|()| Response::Accepted);
			reply_with(&mut send, reply).await
		}
		Request::Submit { job } => reply_with(&mut send, handle_submit(&tx, job).await.map(Response::Submitted)).await,
		Request::Run { job } => reply_with(&mut send, handle_run(&tx, job).await.map(Response::Job)).await,
		Request::Cancel { job } => {
			reply_with(&mut send, handle_cancel(&tx, job).await.map(|()| Response::Accepted)).await
		}
		Request::RetrieveOutput { job } => match handle_retrieve_output(&tx, job).await {
			Ok(data) => {
				write_frame(&mut send, &Response::Accepted).await?;
				send.write_all(&data).await.map_err(Into::into)
			}
			Err(e) => reply_with(&mut send, Err(e)).await,
		},
		Request::RetrieveOutfileData { job, name } => {
			let reply = handle_retrieve_outfile(&tx, job, name).await.map(Response::Data);
			reply_with(&mut send, reply).await
		}
	};

	send.shutdown().await?;
	result
}

async fn reply_with<S>(send: &mut S, reply: Result<Response>) -> Result<()>
where
	S: AsyncWrite + Unpin,
{
	let reply = reply.unwrap_or_else(|e| Response::Rejected {
		reason: format!("{:#}", e),
	});
	write_frame(send, &reply).await
}
