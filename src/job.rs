use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Default timeout for jobs submitted without one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one worker process for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An input file shipped with a job.
///
/// `data` is `None` when the submitter expects the worker to already hold the
/// payload in its file cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFile {
    pub name: String,
    pub data: Option<Vec<u8>>,
    pub cache: bool,
}

/// A payload a worker already holds, identified by name and content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFile {
    pub name: String,
    pub digest: [u8; 32],
}

impl CachedFile {
    pub fn new(name: impl Into<String>, data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            name: name.into(),
            digest: hasher.finalize().into(),
        }
    }

    /// Whether `file` carries exactly this payload.
    pub fn holds(&self, file: &JobFile) -> bool {
        file.name == self.name
            && file
                .data
                .as_deref()
                .map_or(false, |data| CachedFile::new(self.name.as_str(), data).digest == self.digest)
    }
}

/// A harvested output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutFile {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Fetched,
    Running,
    Completed,
    Failed,
    Killed,
    Reported,
}

impl JobStatus {
    /// Forward moves of the job lifecycle. Requeueing is handled separately.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Fetched)
                | (Fetched, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Killed)
                | (Completed, Reported)
                | (Failed, Reported)
                | (Killed, Reported)
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Killed | JobStatus::Reported
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Fetched => "fetched",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Killed => "killed",
            JobStatus::Reported => "reported",
        };
        f.write_str(s)
    }
}

/// One unit of remotely executable work together with its result state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: Vec<String>,
    pub infiles: Vec<JobFile>,
    pub outfiles: Vec<String>,
    pub timeout: Duration,
    pub whitelist: Vec<String>,
    pub note: String,
    pub worker_id: Option<WorkerId>,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
    pub results: Vec<OutFile>,
    pub submitted: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: JobId::new(),
            command: command.into_iter().map(Into::into).collect(),
            infiles: Vec::new(),
            outfiles: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            whitelist: Vec::new(),
            note: String::new(),
            worker_id: None,
            status: JobStatus::Queued,
            exit_code: None,
            output: String::new(),
            error: None,
            results: Vec::new(),
            submitted: Utc::now(),
            started: None,
            finished: None,
        }
    }

    /// Adds an infile, replacing any earlier infile with the same name.
    pub fn add_infile(&mut self, name: impl Into<String>, data: Vec<u8>, cache: bool) {
        let file = JobFile {
            name: name.into(),
            data: Some(data),
            cache,
        };
        match self.infiles.iter_mut().find(|f| f.name == file.name) {
            Some(existing) => *existing = file,
            None => self.infiles.push(file),
        }
    }

    /// Adds a reference to a payload the worker is expected to have cached.
    pub fn add_cached_ref(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.infiles.iter().any(|f| f.name == name) {
            self.infiles.push(JobFile {
                name,
                data: None,
                cache: true,
            });
        }
    }

    pub fn add_outfile(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.outfiles.contains(&name) {
            self.outfiles.push(name);
        }
    }

    /// Appends path names to the whitelist, skipping duplicates.
    pub fn whitelist<I, S>(&mut self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for path in paths {
            let path = path.into();
            if !self.whitelist.contains(&path) {
                self.whitelist.push(path);
            }
        }
    }

    /// Fills gaps in the job's infiles from a cached payload.
    ///
    /// Explicitly supplied data always wins. Returns whether the cached
    /// payload was used.
    pub fn fill_infile(&mut self, name: &str, data: &[u8]) -> bool {
        match self.infiles.iter_mut().find(|f| f.name == name) {
            Some(file) if file.data.is_some() => false,
            Some(file) => {
                file.data = Some(data.to_vec());
                true
            }
            None => {
                self.infiles.push(JobFile {
                    name: name.to_string(),
                    data: Some(data.to_vec()),
                    cache: true,
                });
                true
            }
        }
    }

    pub fn outfile(&self, name: &str) -> Option<&OutFile> {
        self.results.iter().find(|f| f.name == name)
    }

    pub fn advance(&mut self, next: JobStatus) -> anyhow::Result<()> {
        if !self.status.can_advance_to(next) {
            anyhow::bail!("job {}: illegal transition {} -> {}", self.id, self.status, next);
        }
        self.status = next;
        Ok(())
    }

    /// Records the single terminal outcome of an execution.
    pub fn finish(&mut self, status: JobStatus, error: Option<String>) -> anyhow::Result<()> {
        self.advance(status)?;
        self.error = error;
        self.finished = Some(Utc::now());
        Ok(())
    }

    /// Puts an assigned job back in the queue after its worker was lost.
    pub fn requeue(&mut self) {
        self.status = JobStatus::Queued;
        self.worker_id = None;
        self.started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_does_not_skip_states() {
        let mut job = Job::new(["true"]);
        assert!(job.advance(JobStatus::Running).is_err());
        job.advance(JobStatus::Fetched).unwrap();
        job.advance(JobStatus::Running).unwrap();
        assert!(job.advance(JobStatus::Reported).is_err());
        job.finish(JobStatus::Killed, Some("timed out".into())).unwrap();
        assert!(job.finished.is_some());
        job.advance(JobStatus::Reported).unwrap();
        assert!(job.status.is_finished());
    }

    #[test]
    fn fill_infile_never_overrides_explicit_data() {
        let mut job = Job::new(["cat", "tmpl"]);
        job.add_infile("tmpl", b"explicit".to_vec(), true);
        assert!(!job.fill_infile("tmpl", b"cached"));
        assert_eq!(job.infiles[0].data.as_deref(), Some(&b"explicit"[..]));

        job.add_cached_ref("shared");
        assert!(job.fill_infile("shared", b"cached"));
        assert!(job.fill_infile("extra", b"more"));
        assert_eq!(job.infiles.len(), 3);
    }

    #[test]
    fn add_infile_replaces_same_name() {
        let mut job = Job::new(["true"]);
        job.add_infile("a", b"1".to_vec(), false);
        job.add_infile("a", b"2".to_vec(), true);
        assert_eq!(job.infiles.len(), 1);
        assert!(job.infiles[0].cache);
        assert_eq!(job.infiles[0].data.as_deref(), Some(&b"2"[..]));
    }

    #[test]
    fn requeue_resets_assignment() {
        let mut job = Job::new(["true"]);
        job.advance(JobStatus::Fetched).unwrap();
        job.worker_id = Some(WorkerId::new());
        job.requeue();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.worker_id.is_none());
    }
}
