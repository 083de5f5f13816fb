use clap::{Parser, Subcommand};
use std::env;
use std::fmt;
use std::path::PathBuf;

use crate::jm::rpc::{self, Payload, PhaseName, Request, Response};

#[derive(Debug, Parser)]
#[command(name = "jmctl", version, about = "jobmon control client")]
pub struct Args {
    /// Control directory of the target jobmon daemon
    #[arg(short = 'C', long = "control-dir")]
    pub control_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Start a job
    Start { job: String },
    /// Stop a job (delivers its configured stop signal)
    Stop { job: String },
    /// Print a job's phase; exit 0 when running, 1 when stopped
    Status { job: String },
    /// List all jobs as "RUNNING <name>" / "STOPPED <name>" lines
    ListJobs,
    /// Block until the job's next phase transition, then print the new phase
    Wait { job: String },
    /// Stream events as they happen, in the list-jobs line format
    Listen {
        /// Number of events to print; 0 means forever
        #[arg(short = 'n', long = "count", default_value_t = 0)]
        count: u64,
    },
    /// Ask the daemon to shut down gracefully
    Terminate,
}

struct MissingControlDirHelp;

impl fmt::Display for MissingControlDirHelp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "no jobmon control directory specified")?;
        writeln!(f)?;
        writeln!(f, "jmctl does not read the daemon config file.")?;
        writeln!(f, "Provide the daemon's control directory via one of:")?;
        writeln!(f, "  - jmctl --control-dir /path/to/control <command>")?;
        writeln!(f, "  - jmctl -C /path/to/control <command>")?;
        writeln!(f, "  - export JOBMON_CONTROL_DIR=/path/to/control")?;
        writeln!(f)?;
        write!(f, "The directory is the `control_dir` from the daemon's config.")?;
        Ok(())
    }
}

fn resolve_control_dir(args: &Args) -> anyhow::Result<PathBuf> {
    if let Some(dir) = args.control_dir.clone() {
        return Ok(dir);
    }
    if let Ok(v) = env::var("JOBMON_CONTROL_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Ok(PathBuf::from(t));
        }
    }
    anyhow::bail!("{}", MissingControlDirHelp)
}

/// Runs jmctl and returns the process exit code.
///
/// `status` distinguishes three outcomes (0 running, 1 stopped, 2 error);
/// every other command exits 0 on success and 1 on failure.
pub fn run() -> i32 {
    let args = Args::parse();
    let error_code = match args.cmd {
        Cmd::Status { .. } => 2,
        _ => 1,
    };

    let control_dir = match resolve_control_dir(&args) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("jmctl: {e}");
            return error_code;
        }
    };

    match exec(&control_dir, args.cmd) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("jmctl: {e:#}");
            error_code
        }
    }
}

fn describe(resp: &Response) -> &'static str {
    resp.error.map_or("request failed", |code| code.describe())
}

fn event_line(job: &str, status: PhaseName) -> String {
    format!("{status} {job}")
}

fn exec(control_dir: &std::path::Path, cmd: Cmd) -> anyhow::Result<i32> {
    match cmd {
        Cmd::Start { job } => {
            let resp = rpc::client_call(control_dir, &Request::Start { job })?;
            if resp.ok {
                Ok(0)
            } else {
                eprintln!("jmctl: {}", describe(&resp));
                Ok(1)
            }
        }
        Cmd::Stop { job } => {
            let resp = rpc::client_call(control_dir, &Request::Stop { job })?;
            if resp.ok {
                Ok(0)
            } else {
                eprintln!("jmctl: {}", describe(&resp));
                Ok(1)
            }
        }
        Cmd::Status { job } => {
            let resp = rpc::client_call(control_dir, &Request::Status { job })?;
            match resp.payload {
                Some(Payload::Phase(phase)) if resp.ok => {
                    println!("{phase}");
                    Ok(match phase {
                        PhaseName::Running => 0,
                        PhaseName::Stopped => 1,
                    })
                }
                _ => {
                    eprintln!("jmctl: {}", describe(&resp));
                    Ok(2)
                }
            }
        }
        Cmd::ListJobs => {
            let resp = rpc::client_call(control_dir, &Request::ListJobs)?;
            match resp.payload {
                Some(Payload::Jobs(jobs)) if resp.ok => {
                    for job in jobs {
                        println!("{}", event_line(&job.name, job.status));
                    }
                    Ok(0)
                }
                _ => {
                    eprintln!("jmctl: {}", describe(&resp));
                    Ok(1)
                }
            }
        }
        Cmd::Wait { job } => {
            let resp = rpc::client_call(control_dir, &Request::Wait { job })?;
            match resp.payload {
                Some(Payload::Phase(phase)) if resp.ok => {
                    println!("{phase}");
                    Ok(0)
                }
                _ => {
                    eprintln!("jmctl: {}", describe(&resp));
                    Ok(1)
                }
            }
        }
        Cmd::Listen { count } => {
            rpc::client_listen(control_dir, count, |event| {
                println!("{}", event_line(&event.job, event.status));
            })?;
            Ok(0)
        }
        Cmd::Terminate => {
            let resp = rpc::client_call(control_dir, &Request::Terminate)?;
            if resp.ok {
                Ok(0)
            } else {
                eprintln!("jmctl: {}", describe(&resp));
                Ok(1)
            }
        }
    }
}
