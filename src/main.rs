mod cache;
mod cli;
mod client;
mod config;
mod db;
mod executor;
mod heartbeat;
mod job;
mod proto;
mod server;
mod transport;
mod utils;
mod worker;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::cli::parse::parse_duration;
use crate::cli::{JobArgs, WorkerArgs};
use crate::config::{generate_config, read_config, serialize_config, write_serialized_config};
use crate::server::{ServeOptions, DEFAULT_PORT};
use crate::utils::{config_path, data_dir};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Cluster config file, defaults to the per-user data directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new cluster identity
    Init {
        /// Address workers and clients reach the queue at
        #[arg(long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
        server: String,
    },
    /// Print the token other nodes join with
    Token {},
    /// Join a cluster from a token
    Join {
        token: String,
        /// Override the queue address carried by the token
        #[arg(long)]
        server: Option<String>,
    },
    /// Run the queue server
    Serve {
        #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
        listen: SocketAddr,
        /// Requeue a job when its worker misses heartbeats for this long
        #[arg(long, value_parser = parse_duration, default_value = "30s")]
        grace: Duration,
        /// Job record database, defaults to the data directory
        #[arg(long)]
        db: Option<PathBuf>,
        /// Keep reported jobs in memory only
        #[arg(long, conflicts_with = "db")]
        memory: bool,
        /// Workers to run inside the server process
        #[arg(long, default_value_t = 0)]
        local_workers: usize,
        #[command(flatten)]
        worker: WorkerArgs,
    },
    /// Run a worker against the queue
    Work {
        #[command(flatten)]
        worker: WorkerArgs,
    },
    /// Submit a job and wait for its result
    Run {
        /// Directory harvested outfiles are written to
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        #[command(flatten)]
        job: JobArgs,
    },
    /// Submit a job and print its id
    Submit {
        #[command(flatten)]
        job: JobArgs,
    },
    /// Kill a queued or running job
    Cancel { id: Uuid },
    /// Print the combined output of a job
    Output { id: Uuid },
    /// Fetch a harvested outfile of a reported job
    Outfile {
        id: Uuid,
        name: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let path = config_path(cli.config.as_deref())?;

    match cli.command {
        Commands::Init { server } => {
            generate_config(&path, server)?;
        }
        Commands::Token {} => println!("{}", serialize_config(&read_config(&path)?)?),
        Commands::Join { token, server } => {
            write_serialized_config(&path, &token, server)?;
        }
        Commands::Serve {
            listen,
            grace,
            db,
            memory,
            local_workers,
            worker,
        } => {
            let db = match (db, memory) {
                (_, true) => None,
                (Some(db), false) => Some(db),
                (None, false) => Some(data_dir()?.join("jobs.db")),
            };
            let opts = ServeOptions {
                listen,
                grace,
                db,
                local_workers,
                worker: worker.into(),
            };
            server::run(&read_config(&path)?, opts)?;
        }
        Commands::Work { worker } => cli::work(&read_config(&path)?, worker)?,
        Commands::Run { out_dir, job } => cli::run(&read_config(&path)?, job, out_dir)?,
        Commands::Submit { job } => cli::submit(&read_config(&path)?, job)?,
        Commands::Cancel { id } => cli::cancel(&read_config(&path)?, id)?,
        Commands::Output { id } => cli::output(&read_config(&path)?, id)?,
        Commands::Outfile { id, name, out } => cli::outfile(&read_config(&path)?, id, name, out)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn job_command_keeps_its_own_flags() {
        let cli = Cli::try_parse_from([
            "jobswarm", "submit", "-i", "scen.json=/tmp/s.json", "-o", "obj.out", "--timeout", "90s", "cycdriver",
            "-obj", "-v",
        ])
        .unwrap();
        let Commands::Submit { job } = cli.command else {
            panic!("expected submit");
        };
        assert_eq!(job.command, ["cycdriver", "-obj", "-v"]);
        assert_eq!(job.timeout, Some(Duration::from_secs(90)));
        assert_eq!(job.infiles[0].name, "scen.json");
        assert_eq!(job.outfiles, ["obj.out"]);
    }
}
