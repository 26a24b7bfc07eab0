pub mod parse;
pub mod validation;

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Args;
use tracing::info;
use uuid::Uuid;

use crate::cli::parse::{parse_duration, parse_infile, InfileSpec};
use crate::cli::validation::{attach_infiles, output_path, validate_file_name};
use crate::client::Client;
use crate::config::Config;
use crate::job::{Job, JobId, JobStatus, DEFAULT_TIMEOUT};
use crate::transport::QuicTransport;
use crate::worker::{Worker, WorkerConfig, DEFAULT_WAIT};

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Timeout applied to every job instead of its own, 0 keeps the job's
    #[arg(long, value_parser = parse_duration, default_value = "0")]
    pub job_timeout: Duration,
    /// Pause after an empty or failed poll
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub wait: Duration,
    /// Exit after this long without completing a job, 0 runs forever
    #[arg(long, value_parser = parse_duration, default_value = "0")]
    pub max_idle: Duration,
    /// Extra commands or directories jobs may execute from
    #[arg(long)]
    pub whitelist: Vec<String>,
    /// Do not stream job output to the queue
    #[arg(long)]
    pub nolog: bool,
    /// Heartbeat ping interval
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub ping: Duration,
    /// Directory the per-job working directories are created in
    #[arg(long)]
    pub workdir: Option<PathBuf>,
}

impl From<WorkerArgs> for WorkerConfig {
    fn from(args: WorkerArgs) -> Self {
        let defaults = WorkerConfig::default();
        WorkerConfig {
            job_timeout: args.job_timeout,
            wait: if args.wait.is_zero() { DEFAULT_WAIT } else { args.wait },
            max_idle: args.max_idle,
            whitelist: args.whitelist,
            nolog: args.nolog,
            ping_interval: if args.ping.is_zero() { defaults.ping_interval } else { args.ping },
            workdir: args.workdir.unwrap_or(defaults.workdir),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Input file shipped with the job, as NAME=PATH or PATH
    #[arg(short, long = "infile", value_parser = parse_infile)]
    pub infiles: Vec<InfileSpec>,
    /// Like --infile, but workers keep the payload for later jobs
    #[arg(short, long = "cache", value_parser = parse_infile)]
    pub cached: Vec<InfileSpec>,
    /// Name of a payload workers are expected to have cached already
    #[arg(long = "cached-ref")]
    pub cached_refs: Vec<String>,
    /// File to collect from the working directory after the run
    #[arg(short, long = "outfile")]
    pub outfiles: Vec<String>,
    /// Kill the job after this long, 0 for no limit
    #[arg(short, long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
    /// Commands or directories the job may execute from
    #[arg(long)]
    pub whitelist: Vec<String>,
    /// Free-form label stored with the job
    #[arg(long, default_value = "")]
    pub note: String,
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

pub fn build_job(args: JobArgs) -> Result<Job> {
    let mut job = Job::new(args.command);
    job.timeout = args.timeout.unwrap_or(DEFAULT_TIMEOUT);
    job.note = args.note;
    job.whitelist(args.whitelist);

    attach_infiles(&mut job, &args.infiles, false)?;
    attach_infiles(&mut job, &args.cached, true)?;
    for name in args.cached_refs {
        validate_file_name(&name)?;
        job.add_cached_ref(name);
    }
    for name in args.outfiles {
        validate_file_name(&name)?;
        job.add_outfile(name);
    }

    Ok(job)
}

fn block_on<F: std::future::Future>(fut: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    Ok(runtime.block_on(fut))
}

fn connect(config: &Config) -> Result<Client<QuicTransport>> {
    Ok(Client::new(QuicTransport::new(config)?))
}

pub fn work(config: &Config, args: WorkerArgs) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async {
        let worker = Worker::new(connect(config)?, args.into())?;
        worker
            .run_until(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
    })
}

pub fn submit(config: &Config, args: JobArgs) -> Result<()> {
    let job = build_job(args)?;
    let id = block_on(async { connect(config)?.submit(job).await })??;
    println!("{}", id);
    Ok(())
}

/// Submits a job, waits for it and collects its outfiles into `out_dir`.
pub fn run(config: &Config, args: JobArgs, out_dir: PathBuf) -> Result<()> {
    let job = build_job(args)?;
    // check before the job runs rather than after
    for name in &job.outfiles {
        output_path(&out_dir, name)?;
    }

    let job = block_on(async { connect(config)?.run(job).await })??;
    info!(job = %job.id, status = %job.status, exit_code = ?job.exit_code, "job finished");

    for file in &job.results {
        std::fs::write(output_path(&out_dir, &file.name)?, &file.data)?;
    }
    std::io::stdout().write_all(job.output.as_bytes())?;

    match (job.status, job.error) {
        (JobStatus::Killed, error) | (JobStatus::Failed, error) => {
            Err(anyhow!("job {} {}: {}", job.id, job.status, error.unwrap_or_default()))
        }
        (_, Some(error)) => Err(anyhow!("job {}: {}", job.id, error)),
        _ => Ok(()),
    }
}

pub fn cancel(config: &Config, id: Uuid) -> Result<()> {
    block_on(async { connect(config)?.cancel(JobId(id)).await })??;
    info!(job = %id, "cancel requested");
    Ok(())
}

pub fn output(config: &Config, id: Uuid) -> Result<()> {
    let data = block_on(async { connect(config)?.retrieve_output(JobId(id)).await })??;
    std::io::stdout().write_all(&data)?;
    Ok(())
}

/// Fetches one harvested outfile; writes to stdout without `--out`.
pub fn outfile(config: &Config, id: Uuid, name: String, out: Option<PathBuf>) -> Result<()> {
    validate_file_name(&name)?;
    let data = block_on(async { connect(config)?.retrieve_outfile_data(JobId(id), &name).await })??;
    match out {
        Some(path) => std::fs::write(path, data)?,
        None => std::io::stdout().write_all(&data)?,
    }
    Ok(())
}
