use std::time::Duration;

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::executor::{KillReason, KillSwitch};
use crate::job::{JobId, WorkerId};
use crate::proto::{expect_frame, read_frame, write_frame, Beat, Request};

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Worker side of the liveness channel for one job execution.
pub struct HeartbeatSession<S, R> {
    send: S,
    recv: R,
    job: JobId,
}

impl<S, R> HeartbeatSession<S, R>
where
    S: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    /// Announces `(worker, job)` on a fresh stream and waits for the queue to
    /// accept the assignment.
    pub async fn open(mut send: S, mut recv: R, worker: WorkerId, job: JobId) -> Result<Self> {
        write_frame(&mut send, &Request::Heartbeat { worker, job }).await?;
        match expect_frame::<_, Beat>(&mut recv).await? {
            Beat::Alive => Ok(Self { send, recv, job }),
            Beat::Kill { reason } => bail!("queue refused heartbeat for job {}: {}", job, reason),
            Beat::Ping => bail!("unexpected ping from queue"),
        }
    }

    /// Pings every `interval` until `done` fires.
    ///
    /// A kill instruction or a lost stream raises `kill`. Closing the stream
    /// on `done` is what stops the pings.
    pub async fn run(self, interval: Duration, kill: &KillSwitch, done: oneshot::Receiver<()>) {
        let Self { mut send, mut recv, job } = self;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let listen = listen(&mut recv);
        tokio::pin!(listen);
        tokio::pin!(done);

        loop {
            tokio::select! {
                _ = &mut done => break,
                reason = &mut listen => {
                    warn!(job = %job, %reason, "heartbeat ended by queue");
                    kill.kill(reason);
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = write_frame(&mut send, &Beat::Ping).await {
                        warn!(job = %job, error = %e, "heartbeat ping failed");
                        kill.kill(KillReason::HeartbeatLost(e.to_string()));
                        break;
                    }
                }
            }
        }

        if let Err(e) = send.shutdown().await {
            debug!(job = %job, error = %e, "closing heartbeat stream");
        }
    }
}

/// Waits for whatever ends the session from the queue's side.
async fn listen<R: AsyncRead + Unpin>(recv: &mut R) -> KillReason {
    loop {
        match read_frame::<_, Beat>(recv).await {
            Ok(Some(Beat::Kill { reason })) => return KillReason::Cancelled(reason),
            Ok(Some(_)) => continue,
            Ok(None) => return KillReason::HeartbeatLost("queue closed the heartbeat stream".into()),
            Err(e) => return KillReason::HeartbeatLost(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio::io::{duplex, split};

    use super::*;

    #[tokio::test]
    async fn kill_instruction_raises_switch() {
        let (client, server) = duplex(1024);
        let (recv, send) = split(client);
        let (mut srv_recv, mut srv_send) = split(server);

        let queue = tokio::spawn(async move {
            let req: Request = expect_frame(&mut srv_recv).await.unwrap();
            assert!(matches!(req, Request::Heartbeat { .. }));
            write_frame(&mut srv_send, &Beat::Alive).await.unwrap();
            let ping: Beat = expect_frame(&mut srv_recv).await.unwrap();
            assert_eq!(ping, Beat::Ping);
            write_frame(&mut srv_send, &Beat::Kill { reason: "reassigned".into() }).await.unwrap();
            (srv_recv, srv_send)
        });

        let session = HeartbeatSession::open(send, recv, WorkerId::new(), JobId::new()).await.unwrap();
        let kill = KillSwitch::new();
        let (_done_tx, done_rx) = oneshot::channel();
        let start = Instant::now();
        session.run(Duration::from_millis(20), &kill, done_rx).await;

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(kill.reason(), Some(KillReason::Cancelled("reassigned".into())));
        queue.await.unwrap();
    }

    #[tokio::test]
    async fn done_closes_stream_without_kill() {
        let (client, server) = duplex(1024);
        let (recv, send) = split(client);
        let (mut srv_recv, mut srv_send) = split(server);

        let queue = tokio::spawn(async move {
            let _: Request = expect_frame(&mut srv_recv).await.unwrap();
            write_frame(&mut srv_send, &Beat::Alive).await.unwrap();
            let mut pings = 0;
            while let Some(beat) = read_frame::<_, Beat>(&mut srv_recv).await.unwrap() {
                assert_eq!(beat, Beat::Ping);
                pings += 1;
            }
            (pings, srv_send)
        });

        let session = HeartbeatSession::open(send, recv, WorkerId::new(), JobId::new()).await.unwrap();
        let kill = KillSwitch::new();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            let _ = done_tx.send(());
        });
        session.run(Duration::from_millis(20), &kill, done_rx).await;

        let (pings, _send) = queue.await.unwrap();
        assert!(pings >= 2, "only {} pings", pings);
        assert!(!kill.is_killed());
    }

    #[tokio::test]
    async fn dropped_queue_counts_as_lost() {
        let (client, server) = duplex(1024);
        let (recv, send) = split(client);
        let (mut srv_recv, mut srv_send) = split(server);

        let open = HeartbeatSession::open(send, recv, WorkerId::new(), JobId::new());
        let serve = async {
            let _: Request = expect_frame(&mut srv_recv).await.unwrap();
            write_frame(&mut srv_send, &Beat::Alive).await.unwrap();
        };
        let (session, ()) = tokio::join!(open, serve);
        drop(srv_send);
        drop(srv_recv);

        let kill = KillSwitch::new();
        let (_done_tx, done_rx) = oneshot::channel();
        session.unwrap().run(Duration::from_millis(20), &kill, done_rx).await;
        assert!(matches!(kill.reason(), Some(KillReason::HeartbeatLost(_))));
    }

    #[tokio::test]
    async fn refused_open_is_an_error() {
        let (client, server) = duplex(1024);
        let (recv, send) = split(client);
        let (mut srv_recv, mut srv_send) = split(server);
        tokio::spawn(async move {
            let _: Request = expect_frame(&mut srv_recv).await.unwrap();
            write_frame(&mut srv_send, &Beat::Kill { reason: "not assigned".into() }).await.unwrap();
        });
        let err = HeartbeatSession::open(send, recv, WorkerId::new(), JobId::new())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("not assigned"));
    }
}
