use std::ffi::OsString;
use std::fmt;
use std::os::unix::process::CommandExt;
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::job::{Job, JobStatus, OutFile};

/// Tail of the combined output kept on the job itself.
pub const MAX_CAPTURED_OUTPUT: usize = 1024 * 1024;
/// How long output is still drained once the process is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(200);
/// How long to wait for the kernel to reap a killed process.
const REAP_GRACE: Duration = Duration::from_secs(2);
/// How long a stalled output sink may hold the job once the process is gone.
const SINK_GRACE: Duration = Duration::from_secs(2);
const CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillReason {
    Timeout(Duration),
    Cancelled(String),
    HeartbeatLost(String),
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillReason::Timeout(d) => write!(f, "job timed out after {:?}", d),
            KillReason::Cancelled(reason) => write!(f, "job killed by queue: {}", reason),
            KillReason::HeartbeatLost(reason) => write!(f, "heartbeat lost: {}", reason),
        }
    }
}

/// The one cancellation primitive shared by the timeout and heartbeat paths.
///
/// Raising it is idempotent: the first reason wins and later calls are no-ops.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    tx: Arc<watch::Sender<Option<KillReason>>>,
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl KillSwitch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true if this call was the one that raised the switch.
    pub fn kill(&self, reason: KillReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn reason(&self) -> Option<KillReason> {
        self.tx.borrow().clone()
    }

    pub fn is_killed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Resolves once the switch has been raised.
    pub async fn killed(&self) -> KillReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Runs job commands in private working directories.
#[derive(Debug, Clone)]
pub struct Executor {
    root: PathBuf,
    search_path: Vec<PathBuf>,
}

enum Ended {
    Exited(std::io::Result<ExitStatus>),
    Killed(KillReason),
}

impl Executor {
    /// `root` holds the per-job directories; `search_path` entries are
    /// appended to `PATH` for every command.
    pub fn new(root: impl Into<PathBuf>, search_path: Vec<PathBuf>) -> Self {
        Self {
            root: root.into(),
            search_path,
        }
    }

    /// Executes a fetched job, recording the outcome on it.
    ///
    /// Command failures are outcomes, not errors: the only `Err` is a job that
    /// was not in a runnable state.
    pub async fn execute<W>(&self, job: &mut Job, kill: &KillSwitch, sink: W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        job.advance(JobStatus::Running)?;
        job.started = Some(Utc::now());
        info!(job = %job.id, command = ?job.command, timeout = ?job.timeout, "executing job");

        let mut pump = OutputPump::new(sink);
        let workdir = match self.prepare(job) {
            Ok(dir) => dir,
            Err(e) => {
                pump.finish().await;
                return job.finish(JobStatus::Failed, Some(format!("{:#}", e)));
            }
        };

        let mut child = match self.spawn(job, workdir.path()) {
            Ok(child) => child,
            Err(e) => {
                pump.finish().await;
                return job.finish(JobStatus::Failed, Some(format!("{:#}", e)));
            }
        };
        let pgid = child.id().map(|id| Pid::from_raw(id as i32));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let timeout = job.timeout;
        let (exited_tx, exited_rx) = oneshot::channel();
        let (stall_tx, stall_rx) = oneshot::channel();

        let control = async {
            let ended = tokio::select! {
                status = child.wait() => Ended::Exited(status),
                reason = kill.killed() => Ended::Killed(reason),
                _ = sleep_or_forever(timeout) => {
                    let reason = KillReason::Timeout(timeout);
                    kill.kill(reason.clone());
                    Ended::Killed(kill.reason().unwrap_or(reason))
                }
            };
            if let Ended::Killed(reason) = &ended {
                info!(pgid = ?pgid, %reason, "terminating job process group");
                terminate(&mut child, pgid).await;
            }
            let _ = exited_tx.send(());
            let _ = stall_tx.send(());
            ended
        };

        let output = forward_output(stdout, stderr, &mut pump, pgid, exited_rx, stall_rx);
        let (ended, ()) = tokio::join!(control, output);
        job.output = pump.finish().await;

        match ended {
            Ended::Killed(reason) => job.finish(JobStatus::Killed, Some(reason.to_string())),
            Ended::Exited(Err(e)) => job.finish(JobStatus::Failed, Some(format!("waiting on command: {}", e))),
            Ended::Exited(Ok(status)) => {
                job.exit_code = status.code();
                let harvest = harvest(workdir.path(), &job.outfiles).await;
                let (next, error) = match (status.success(), harvest) {
                    (true, Ok(files)) => {
                        job.results = files;
                        (JobStatus::Completed, None)
                    }
                    (true, Err(e)) => (JobStatus::Failed, Some(format!("{:#}", e))),
                    (false, harvest) => {
                        job.results = harvest.unwrap_or_default();
                        (JobStatus::Failed, Some(format!("command exited with {}", status)))
                    }
                };
                debug!(job = %job.id, status = %next, exit_code = ?job.exit_code, "job exited");
                job.finish(next, error)
            }
        }
    }

    /// Creates the job directory and materializes the infiles into it.
    fn prepare(&self, job: &Job) -> Result<tempfile::TempDir> {
        if job.command.is_empty() {
            bail!("job has no command");
        }
        check_whitelist(&job.command[0], &job.whitelist)?;

        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating job root {}", self.root.display()))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{}-", job.id))
            .tempdir_in(&self.root)
            .context("creating job directory")?;

        for file in &job.infiles {
            let data = file
                .data
                .as_ref()
                .ok_or_else(|| anyhow!("infile {} has no data and is not cached on this worker", file.name))?;
            let path = confined(dir.path(), &file.name)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, data).with_context(|| format!("writing infile {}", file.name))?;
        }
        for name in &job.outfiles {
            confined(dir.path(), name)?;
        }

        Ok(dir)
    }

    fn spawn(&self, job: &Job, dir: &Path) -> Result<Child> {
        let mut paths: Vec<PathBuf> = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();
        paths.extend(self.search_path.iter().cloned());
        paths.push(dir.to_path_buf());
        let path: OsString = std::env::join_paths(paths).context("building search path")?;

        let mut cmd = std::process::Command::new(&job.command[0]);
        cmd.args(&job.command[1..])
            .current_dir(dir)
            .env("PATH", path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);
        cmd.spawn()
            .with_context(|| format!("failed to start {}", job.command[0]))
    }
}

/// Output sink that falls back to discarding once the peer stops listening.
struct OutputPump<W> {
    sink: W,
    sink_ok: bool,
    captured: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> OutputPump<W> {
    fn new(sink: W) -> Self {
        Self {
            sink,
            sink_ok: true,
            captured: Vec::new(),
        }
    }

    fn capture(&mut self, chunk: &[u8]) {
        self.captured.extend_from_slice(chunk);
        if self.captured.len() > MAX_CAPTURED_OUTPUT {
            let excess = self.captured.len() - MAX_CAPTURED_OUTPUT;
            self.captured.drain(..excess);
        }
    }

    async fn send(&mut self, chunk: &[u8]) {
        if self.sink_ok {
            if let Err(e) = self.sink.write_all(chunk).await {
                warn!(error = %e, "output sink failed, discarding further output");
                self.sink_ok = false;
            }
        }
    }

    fn abandon(&mut self) {
        warn!("output sink stalled after the process ended, discarding further output");
        self.sink_ok = false;
    }

    async fn finish(&mut self) -> String {
        if self.sink_ok {
            match tokio::time::timeout(SINK_GRACE, self.sink.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "closing output sink"),
                Err(_) => warn!("output sink did not close in time"),
            }
            self.sink_ok = false;
        }
        String::from_utf8_lossy(&std::mem::take(&mut self.captured)).into_owned()
    }
}

enum Read {
    Stdout(std::io::Result<usize>),
    Stderr(std::io::Result<usize>),
}

/// Copies combined output into the pump until both pipes close.
///
/// Once the process is gone, reads stop after `DRAIN_GRACE` and a sink that
/// stops accepting bytes is dropped after `SINK_GRACE`. Pipes still open at
/// that point belong to leftovers in the process group, which are killed.
async fn forward_output<W>(
    mut stdout: Option<ChildStdout>,
    mut stderr: Option<ChildStderr>,
    pump: &mut OutputPump<W>,
    pgid: Option<Pid>,
    exited: oneshot::Receiver<()>,
    stalled: oneshot::Receiver<()>,
) where
    W: AsyncWrite + Unpin,
{
    let mut out_buf = vec![0u8; CHUNK];
    let mut err_buf = vec![0u8; CHUNK];
    let deadline = async {
        let _ = exited.await;
        tokio::time::sleep(DRAIN_GRACE).await;
    };
    let sink_deadline = async {
        let _ = stalled.await;
        tokio::time::sleep(SINK_GRACE).await;
    };
    tokio::pin!(deadline, sink_deadline);

    while stdout.is_some() || stderr.is_some() {
        let read = tokio::select! {
            n = read_some(&mut stdout, &mut out_buf) => Read::Stdout(n),
            n = read_some(&mut stderr, &mut err_buf) => Read::Stderr(n),
            _ = &mut deadline => {
                warn!(pgid = ?pgid, "output still open after the process ended, killing its group");
                signal_group(pgid);
                break;
            }
        };
        let chunk = match read {
            Read::Stdout(Ok(n)) if n > 0 => &out_buf[..n],
            Read::Stderr(Ok(n)) if n > 0 => &err_buf[..n],
            Read::Stdout(_) => {
                stdout = None;
                continue;
            }
            Read::Stderr(_) => {
                stderr = None;
                continue;
            }
        };

        pump.capture(chunk);
        if pump.sink_ok {
            tokio::select! {
                _ = pump.send(chunk) => {}
                _ = &mut sink_deadline => pump.abandon(),
            }
        }
    }
}

async fn read_some<R: AsyncRead + Unpin>(r: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize> {
    match r {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn sleep_or_forever(timeout: Duration) {
    if timeout.is_zero() {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(timeout).await;
}

fn signal_group(pgid: Option<Pid>) {
    let Some(pgid) = pgid else { return };
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = %pgid, error = %e, "failed to signal process group"),
    }
}

async fn terminate(child: &mut Child, pgid: Option<Pid>) {
    signal_group(pgid);
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill after group signal");
    }
    if tokio::time::timeout(REAP_GRACE, child.wait()).await.is_err() {
        warn!(pgid = ?pgid, "killed process was not reaped in time");
    }
}

/// Resolves `name` inside `dir`, refusing anything that would escape it.
fn confined(dir: &Path, name: &str) -> Result<PathBuf> {
    let rel = Path::new(name);
    if name.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
        bail!("file name {:?} must stay inside the job directory", name);
    }
    Ok(dir.join(rel))
}

/// With a non-empty whitelist, only whitelisted programs (or programs under
/// whitelisted directories) may run.
///
/// This is an allow-list on the executable alone. Arguments are not checked,
/// so a whitelisted shell runs anything and nothing confines the job's file
/// access beyond its working directory.
fn check_whitelist(program: &str, whitelist: &[String]) -> Result<()> {
    if whitelist.is_empty() {
        return Ok(());
    }
    let path = Path::new(program);
    let allowed = whitelist.iter().any(|entry| {
        program == entry || (path.is_absolute() && path.starts_with(entry))
    });
    if !allowed {
        bail!("command {:?} is not in the whitelist", program);
    }
    Ok(())
}

async fn harvest(dir: &Path, names: &[String]) -> Result<Vec<OutFile>> {
    let mut files = Vec::with_capacity(names.len());
    for name in names {
        let path = confined(dir, name)?;
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("missing outfile {}", name))?;
        files.push(OutFile {
            name: name.clone(),
            data,
        });
    }
    Ok(files)
}
