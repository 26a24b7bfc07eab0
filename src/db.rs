use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc::Receiver;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::job::{CachedFile, Job, JobId, WorkerId};
use crate::server::commands::{
    do_append_output, do_beat, do_cancel, do_complete, do_dispatch, do_open_output, do_reap, do_retrieve_outfile,
    do_retrieve_output, do_run, do_submit, BeatState,
};

/// How long an assignment survives without a ping before it is requeued.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

pub enum QueueCommand {
    Submit {
        job: Job,
        reply: oneshot::Sender<Result<JobId>>,
    },
    Run {
        job: Job,
        reply: oneshot::Sender<Result<Job>>,
    },
    Fetch {
        worker: WorkerId,
        cached: Vec<CachedFile>,
        reply: oneshot::Sender<Option<Job>>,
    },
    Beat {
        worker: WorkerId,
        job: JobId,
        reply: oneshot::Sender<BeatState>,
    },
    OpenOutput {
        job: JobId,
        reply: oneshot::Sender<bool>,
    },
    AppendOutput {
        job: JobId,
        chunk: Vec<u8>,
    },
    Push {
        worker: WorkerId,
        job: Job,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        job: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
    RetrieveOutput {
        job: JobId,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    RetrieveOutfile {
        job: JobId,
        name: String,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
}

/// A job handed to a worker and not yet reported.
pub struct Assignment {
    pub job: Job,
    pub worker: WorkerId,
    pub last_seen: Instant,
    pub kill: Option<String>,
}

/// Queue state, owned by the [`loop_db`] task alone.
pub struct Queue {
    pub grace: Duration,
    pub pending: VecDeque<Job>,
    pub active: HashMap<JobId, Assignment>,
    pub outputs: HashMap<JobId, Vec<u8>>,
    pub waiters: HashMap<JobId, Vec<oneshot::Sender<Result<Job>>>>,
    pub conn: Connection,
}

impl Queue {
    pub fn new(conn: Connection, grace: Duration) -> Self {
        Self {
            grace,
            pending: VecDeque::new(),
            active: HashMap::new(),
            outputs: HashMap::new(),
            waiters: HashMap::new(),
            conn,
        }
    }

    /// Wakes everyone waiting on a job with its final state.
    pub fn notify(&mut self, job: &Job) {
        for waiter in self.waiters.remove(&job.id).unwrap_or_default() {
            let _ = waiter.send(Ok(job.clone()));
        }
    }
}

fn reply<T>(tx: oneshot::Sender<T>, value: T) {
    if tx.send(value).is_err() {
        debug!("requester went away before the reply");
    }
}

pub async fn loop_db(mut rx: Receiver<QueueCommand>, mut queue: Queue) -> Result<()> {
    let mut reaper = tokio::time::interval((queue.grace / 4).max(MIN_REAP_INTERVAL));
    info!(grace = ?queue.grace, "queue ready");

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else {
                    info!("queue channel closed, stopping");
                    return Ok(());
                };
                apply(&mut queue, cmd);
            }
            _ = reaper.tick() => do_reap(&mut queue),
        }
    }
}

fn apply(queue: &mut Queue, cmd: QueueCommand) {
    match cmd {
        QueueCommand::Submit { job, reply: tx } => reply(tx, do_submit(queue, job)),
        QueueCommand::Run { job, reply: tx } => do_run(queue, job, tx),
        QueueCommand::Fetch { worker, cached, reply: tx } => reply(tx, do_dispatch(queue, worker, &cached)),
        QueueCommand::Beat { worker, job, reply: tx } => reply(tx, do_beat(queue, worker, job)),
        QueueCommand::OpenOutput { job, reply: tx } => reply(tx, do_open_output(queue, job)),
        QueueCommand::AppendOutput { job, chunk } => do_append_output(queue, job, &chunk),
        QueueCommand::Push { worker, job, reply: tx } => reply(tx, do_complete(queue, worker, job)),
        QueueCommand::Cancel { job, reply: tx } => reply(tx, do_cancel(queue, job)),
        QueueCommand::RetrieveOutput { job, reply: tx } => reply(tx, do_retrieve_output(queue, job)),
        QueueCommand::RetrieveOutfile { job, name, reply: tx } => {
            reply(tx, do_retrieve_outfile(queue, job, &name))
        }
    }
}

/// Opens the record of reported jobs; `None` keeps it in memory.
pub fn init(path: Option<&Path>) -> Result<Connection> {
    let conn = match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(path)?
        }
        None => Connection::open_in_memory()?,
    };
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(include_str!("./init.sql"))?;

    Ok(conn)
}

/// Stores a reported job with its streamed output and harvested outfiles.
pub fn record_job(conn: &mut Connection, job: &Job, output: &[u8]) -> Result<()> {
    let tx = conn.transaction()?;
    {
        let mut save_job = tx.prepare_cached(
            "INSERT OR REPLACE INTO jobs (id, status, worker, note, record, output, submitted_at, finished_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?);",
        )?;
        let mut record = job.clone();
        record.results.clear();
        save_job.execute(params![
            job.id.0,
            job.status.to_string(),
            job.worker_id.map(|w| w.0),
            job.note,
            serde_json::to_string(&record)?,
            output,
            job.submitted,
            job.finished,
        ])?;

        let mut save_outfile =
            tx.prepare_cached("INSERT OR REPLACE INTO outfiles (job_id, name, data) VALUES (?, ?, ?);")?;
        for file in &job.results {
            save_outfile.execute(params![job.id.0, file.name, file.data])?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn load_job(conn: &Connection, id: JobId) -> Result<Option<Job>> {
    let mut stmt = conn.prepare_cached("SELECT record FROM jobs WHERE id = ?;")?;
    let record: Option<String> = stmt.query_row([id.0], |r| r.get(0)).optional()?;
    Ok(record.map(|r| serde_json::from_str(&r)).transpose()?)
}

pub fn load_output(conn: &Connection, id: JobId) -> Result<Option<Vec<u8>>> {
    let mut stmt = conn.prepare_cached("SELECT output FROM jobs WHERE id = ?;")?;
    Ok(stmt.query_row([id.0], |r| r.get(0)).optional()?)
}

pub fn load_outfile(conn: &Connection, id: JobId, name: &str) -> Result<Option<Vec<u8>>> {
    let mut stmt = conn.prepare_cached("SELECT data FROM outfiles WHERE job_id = ? AND name = ?;")?;
    Ok(stmt.query_row(params![id.0, name], |r| r.get(0)).optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, OutFile};

    #[test]
    fn reported_jobs_round_trip_through_sqlite() {
        let mut conn = init(None).unwrap();
        let mut job = Job::new(["cycdriver", "-obj"]);
        job.note = "particle 3".into();
        job.status = JobStatus::Reported;
        job.worker_id = Some(WorkerId::new());
        job.results.push(OutFile {
            name: "obj.out".into(),
            data: b"42.5".to_vec(),
        });

        record_job(&mut conn, &job, b"log line\n").unwrap();

        let loaded = load_job(&conn, job.id).unwrap().unwrap();
        assert_eq!(loaded.note, "particle 3");
        assert!(loaded.results.is_empty());
        assert_eq!(load_output(&conn, job.id).unwrap().unwrap(), b"log line\n");
        assert_eq!(load_outfile(&conn, job.id, "obj.out").unwrap().unwrap(), b"42.5");
        assert!(load_outfile(&conn, job.id, "other").unwrap().is_none());
        assert!(load_job(&conn, JobId::new()).unwrap().is_none());
    }
}
