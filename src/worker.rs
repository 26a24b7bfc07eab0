//! The worker loop: fetch a job, execute it under a heartbeat, report it.
//!
//! One cycle runs three activities at once (execution, heartbeat, output
//! upload) and joins all of them before the job is pushed back, so the queue
//! sees the complete output and a closed heartbeat before the report.

use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::cache::FileCache;
use crate::client::Client;
use crate::executor::{Executor, KillSwitch};
use crate::heartbeat::{HeartbeatSession, DEFAULT_PING_INTERVAL};
use crate::job::{Job, JobId, WorkerId};
use crate::transport::Transport;

pub const DEFAULT_WAIT: Duration = Duration::from_secs(10);
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Overrides every job's own timeout when non-zero.
    pub job_timeout: Duration,
    /// Pause after an empty or failed poll.
    pub wait: Duration,
    /// Shut down after this long without a completed job; zero runs forever.
    pub max_idle: Duration,
    pub whitelist: Vec<String>,
    /// Discard job output instead of streaming it to the queue.
    pub nolog: bool,
    pub ping_interval: Duration,
    /// Parent directory of the per-job working directories.
    pub workdir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::ZERO,
            wait: DEFAULT_WAIT,
            max_idle: Duration::ZERO,
            whitelist: Vec::new(),
            nolog: false,
            ping_interval: DEFAULT_PING_INTERVAL,
            workdir: std::env::temp_dir().join("jobswarm"),
        }
    }
}

#[derive(Debug)]
pub enum Cycle {
    NoJob,
    Ran(Job),
}

#[derive(Debug, Error)]
pub enum CycleError {
    /// Nothing ran; try again after the poll wait.
    #[error("polling queue: {error:#}")]
    Poll { error: anyhow::Error },
    /// The job ran but the queue did not take the report.
    #[error("reporting job {job}: {error:#}")]
    Report { job: JobId, error: anyhow::Error },
}

pub struct Worker<T> {
    pub id: WorkerId,
    config: WorkerConfig,
    client: Client<T>,
    cache: FileCache,
    executor: Executor,
    last_job: Instant,
}

impl<T: Transport> Worker<T> {
    pub fn new(client: Client<T>, config: WorkerConfig) -> Result<Self> {
        // helpers shipped next to the worker binary or launched from the same
        // directory resolve by name
        let mut search_path = vec![std::env::current_dir()?];
        if let Some(dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(PathBuf::from)) {
            if !search_path.contains(&dir) {
                search_path.push(dir);
            }
        }

        Ok(Self {
            id: WorkerId::new(),
            executor: Executor::new(config.workdir.clone(), search_path),
            config,
            client,
            cache: FileCache::new(),
            last_job: Instant::now(),
        })
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Polls forever, or until the idle ceiling is reached.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Like [`Worker::run`], also stopping between cycles once `shutdown`
    /// resolves.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(worker = %self.id, config = ?self.config, "worker started");
        tokio::pin!(shutdown);

        loop {
            let wait = match self.cycle().await {
                Ok(Cycle::NoJob) => true,
                Ok(Cycle::Ran(job)) => {
                    info!(worker = %self.id, job = %job.id, status = %job.status, "job done");
                    false
                }
                Err(e @ CycleError::Poll { .. }) => {
                    warn!(worker = %self.id, error = %e, "poll failed");
                    true
                }
                Err(e @ CycleError::Report { .. }) => {
                    error!(worker = %self.id, error = %e, "report failed");
                    false
                }
            };

            if self.idle_expired() {
                info!(worker = %self.id, max_idle = ?self.config.max_idle, "no jobs completed, shutting down");
                return Ok(());
            }

            let pause = if wait { self.config.wait } else { Duration::ZERO };
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(worker = %self.id, "shutdown requested");
                    return Ok(());
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    fn idle_expired(&self) -> bool {
        !self.config.max_idle.is_zero() && self.last_job.elapsed() > self.config.max_idle
    }

    /// One poll, execute, report cycle.
    pub async fn cycle(&mut self) -> Result<Cycle, CycleError> {
        let fetched = self
            .client
            .fetch(self.id, self.cache.manifest())
            .await
            .map_err(|error| CycleError::Poll { error })?;
        let Some(mut job) = fetched else {
            return Ok(Cycle::NoJob);
        };
        info!(worker = %self.id, job = %job.id, note = %job.note, "fetched job");

        self.prepare(&mut job);

        // without a heartbeat the job is left for the queue to hand out again
        let session = self
            .client
            .heartbeat(self.id, job.id)
            .await
            .map_err(|error| CycleError::Poll { error })?;

        self.execute(&mut job, session).await;

        job.infiles.clear();
        job.worker_id = Some(self.id);
        let reported = self.client.push(self.id, job.clone()).await;
        self.last_job = Instant::now();
        reported.map_err(|error| CycleError::Report { job: job.id, error })?;

        Ok(Cycle::Ran(job))
    }

    fn prepare(&mut self, job: &mut Job) {
        if !self.config.job_timeout.is_zero() {
            job.timeout = self.config.job_timeout;
        }
        job.whitelist(self.config.whitelist.iter().cloned());
        self.cache.merge_into(job);
    }

    /// Runs the job, its heartbeat and the output upload side by side.
    async fn execute(&self, job: &mut Job, session: HeartbeatSession<T::Send, T::Recv>) {
        let id = job.id;
        let kill = KillSwitch::new();
        let (done_tx, done_rx) = oneshot::channel();
        let (pipe_w, pipe_r) = tokio::io::duplex(PIPE_CAPACITY);

        let run = async {
            let result = if self.config.nolog {
                drop(pipe_w);
                self.executor.execute(job, &kill, tokio::io::sink()).await
            } else {
                self.executor.execute(job, &kill, pipe_w).await
            };
            let _ = done_tx.send(());
            result
        };
        let heartbeat = session.run(self.config.ping_interval, &kill, done_rx);
        let upload = self.client.push_outfile(id, pipe_r);

        let (ran, (), uploaded) = tokio::join!(run, heartbeat, upload);
        if let Err(e) = ran {
            error!(job = %id, error = %e, "job could not be executed");
        }
        if let Err(e) = uploaded {
            warn!(job = %id, error = %e, "output upload failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::db::{self, loop_db, Queue};
    use crate::job::JobStatus;
    use crate::transport::LocalTransport;

    fn local_queue(grace: Duration) -> LocalTransport {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(loop_db(rx, Queue::new(db::init(None).unwrap(), grace)));
        LocalTransport::new(tx)
    }

    fn config(workdir: &tempfile::TempDir) -> WorkerConfig {
        WorkerConfig {
            wait: Duration::from_millis(100),
            ping_interval: Duration::from_millis(20),
            workdir: workdir.path().to_path_buf(),
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn echo_job_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let transport = local_queue(Duration::from_secs(30));
        let submitter = Client::new(transport.clone());
        let mut worker = Worker::new(Client::new(transport), config(&dir)).unwrap();

        let mut job = Job::new(["sh", "-c", "echo hello | tee result.txt"]);
        job.add_infile("unused.dat", b"payload".to_vec(), false);
        job.add_outfile("result.txt");
        job.timeout = Duration::from_secs(5);
        let id = job.id;

        let (finished, cycle) = tokio::join!(submitter.run(job), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            worker.cycle().await
        });

        let finished = finished.unwrap();
        assert!(matches!(cycle.unwrap(), Cycle::Ran(_)));
        assert_eq!(finished.status, JobStatus::Reported);
        assert!(finished.error.is_none(), "{:?}", finished.error);
        assert_eq!(finished.exit_code, Some(0));
        assert!(finished.output.contains("hello"));
        assert!(finished.infiles.is_empty());
        assert_eq!(finished.worker_id, Some(worker.id));

        let streamed = submitter.retrieve_output(id).await.unwrap();
        assert_eq!(streamed, b"hello\n");
        let data = submitter.retrieve_outfile_data(id, "result.txt").await.unwrap();
        assert_eq!(data, b"hello\n");
    }

    #[tokio::test]
    async fn timeout_is_reported_killed() {
        let dir = tempfile::tempdir().unwrap();
        let transport = local_queue(Duration::from_secs(30));
        let submitter = Client::new(transport.clone());
        let mut worker = Worker::new(Client::new(transport), config(&dir)).unwrap();

        let mut job = Job::new(["sleep", "10"]);
        job.timeout = Duration::from_millis(1);
        submitter.submit(job).await.unwrap();

        let start = Instant::now();
        let Cycle::Ran(job) = worker.cycle().await.unwrap() else {
            panic!("expected a job");
        };
        assert!(start.elapsed() < Duration::from_millis(1000));
        assert_eq!(job.status, JobStatus::Killed);
        assert!(job.error.unwrap().contains("timed out"));
        assert!(job.infiles.is_empty());
    }

    #[tokio::test]
    async fn worker_timeout_override_applies() {
        let dir = tempfile::tempdir().unwrap();
        let transport = local_queue(Duration::from_secs(30));
        let submitter = Client::new(transport.clone());
        let mut cfg = config(&dir);
        cfg.job_timeout = Duration::from_millis(50);
        let mut worker = Worker::new(Client::new(transport), cfg).unwrap();

        let mut job = Job::new(["sleep", "10"]);
        job.timeout = Duration::from_secs(60);
        submitter.submit(job).await.unwrap();

        let Cycle::Ran(job) = worker.cycle().await.unwrap() else {
            panic!("expected a job");
        };
        assert_eq!(job.status, JobStatus::Killed);
        assert_eq!(job.timeout, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn operator_cancel_kills_through_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let transport = local_queue(Duration::from_secs(30));
        let submitter = Client::new(transport.clone());
        let mut worker = Worker::new(Client::new(transport), config(&dir)).unwrap();

        let mut job = Job::new(["sh", "-c", "echo started; sleep 30"]);
        job.timeout = Duration::from_secs(60);
        let id = submitter.submit(job).await.unwrap();

        let start = Instant::now();
        let (cycle, ()) = tokio::join!(worker.cycle(), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            submitter.cancel(id).await.unwrap();
        });
        let Cycle::Ran(job) = cycle.unwrap() else {
            panic!("expected a job");
        };

        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(job.status, JobStatus::Killed);
        assert!(job.error.unwrap().contains("cancelled by operator"));
        // partial output made it to the queue before the report
        assert_eq!(submitter.retrieve_output(id).await.unwrap(), b"started\n");
    }

    #[tokio::test]
    async fn cached_payloads_fill_later_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let transport = local_queue(Duration::from_secs(30));
        let submitter = Client::new(transport.clone());
        let mut worker = Worker::new(Client::new(transport), config(&dir)).unwrap();

        let mut first = Job::new(["cat", "tmpl.xml"]);
        first.add_infile("tmpl.xml", b"<template/>".to_vec(), true);
        submitter.submit(first).await.unwrap();
        assert!(matches!(worker.cycle().await.unwrap(), Cycle::Ran(_)));
        assert_eq!(worker.cache().get("tmpl.xml"), Some(&b"<template/>"[..]));

        let mut second = Job::new(["cat", "tmpl.xml", "other.xml"]);
        second.add_cached_ref("tmpl.xml");
        second.add_infile("other.xml", b"<other/>".to_vec(), true);
        submitter.submit(second).await.unwrap();
        let Cycle::Ran(job) = worker.cycle().await.unwrap() else {
            panic!("expected a job");
        };

        assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
        assert_eq!(job.output, "<template/><other/>");
        assert_eq!(worker.cache().get("tmpl.xml"), Some(&b"<template/>"[..]));
        assert_eq!(worker.cache().len(), 2);
    }

    /// Records when each request stream was opened.
    #[derive(Clone)]
    struct Recorded {
        inner: LocalTransport,
        opened: Arc<Mutex<Vec<Instant>>>,
    }

    impl Recorded {
        fn new(inner: LocalTransport) -> Self {
            Self {
                inner,
                opened: Arc::default(),
            }
        }

        fn gaps(&self) -> Vec<Duration> {
            let opened = self.opened.lock().unwrap();
            opened.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    #[async_trait]
    impl Transport for Recorded {
        type Send = <LocalTransport as Transport>::Send;
        type Recv = <LocalTransport as Transport>::Recv;

        async fn open(&self) -> Result<(Self::Send, Self::Recv)> {
            self.opened.lock().unwrap().push(Instant::now());
            self.inner.open().await
        }
    }

    fn assert_spaced(gaps: &[Duration], wait: Duration) {
        assert!(gaps.len() >= 2, "only {} polls", gaps.len() + 1);
        assert!(gaps.len() < 10, "{} polls, queue is being busy polled", gaps.len() + 1);
        for gap in gaps {
            assert!(*gap >= wait, "polls {:?} apart, expected at least {:?}", gap, wait);
        }
    }

    #[tokio::test]
    async fn resubmitted_payload_replaces_the_cached_one() {
        let dir = tempfile::tempdir().unwrap();
        let transport = local_queue(Duration::from_secs(30));
        let submitter = Client::new(transport.clone());
        let mut worker = Worker::new(Client::new(transport), config(&dir)).unwrap();

        let mut first = Job::new(["cat", "tmpl.xml"]);
        first.add_infile("tmpl.xml", b"OLD".to_vec(), true);
        submitter.submit(first).await.unwrap();
        assert!(matches!(worker.cycle().await.unwrap(), Cycle::Ran(_)));

        let mut second = Job::new(["cat", "tmpl.xml"]);
        second.add_infile("tmpl.xml", b"NEW".to_vec(), true);
        submitter.submit(second).await.unwrap();
        let Cycle::Ran(job) = worker.cycle().await.unwrap() else {
            panic!("expected a job");
        };

        assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
        assert_eq!(job.output, "NEW");
        assert_eq!(worker.cache().get("tmpl.xml"), Some(&b"NEW"[..]));
    }

    #[tokio::test]
    async fn empty_queue_is_not_busy_polled() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Recorded::new(local_queue(Duration::from_secs(30)));
        let mut cfg = config(&dir);
        cfg.wait = Duration::from_millis(100);
        cfg.max_idle = Duration::from_millis(350);
        let worker = Worker::new(Client::new(transport.clone()), cfg).unwrap();

        worker.run().await.unwrap();

        // polls at 0, 100, 200, 300 and 400ms; the idle check after the last
        // one ends the loop
        assert_spaced(&transport.gaps(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn unreachable_queue_waits_and_idles_out() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let transport = Recorded::new(LocalTransport::new(tx));
        let mut cfg = config(&dir);
        cfg.max_idle = Duration::from_millis(250);
        let worker = Worker::new(Client::new(transport.clone()), cfg).unwrap();

        let start = Instant::now();
        worker.run().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert_spaced(&transport.gaps(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn shutdown_stops_between_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let transport = local_queue(Duration::from_secs(30));
        let mut cfg = config(&dir);
        cfg.wait = Duration::from_secs(30);
        let worker = Worker::new(Client::new(transport), cfg).unwrap();

        let start = Instant::now();
        worker
            .run_until(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn lost_assignment_is_not_executed() {
        let dir = tempfile::tempdir().unwrap();
        let transport = local_queue(Duration::from_millis(30));
        let submitter = Client::new(transport.clone());
        let mut worker = Worker::new(Client::new(transport.clone()), config(&dir)).unwrap();

        let marker = dir.path().join("ran");
        let script = format!("touch {}", marker.display());
        submitter.submit(Job::new(["sh", "-c", script.as_str()])).await.unwrap();

        // another worker grabs the job and disappears without a heartbeat
        let ghost = Client::new(transport);
        let ghost_job = ghost.fetch(WorkerId::new(), Vec::new()).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // the requeued job now runs here, exactly once
        let Cycle::Ran(job) = worker.cycle().await.unwrap() else {
            panic!("expected the requeued job");
        };
        assert_eq!(job.id, ghost_job.id);
        assert_eq!(job.status, JobStatus::Completed);
        assert!(marker.exists());
    }
}
