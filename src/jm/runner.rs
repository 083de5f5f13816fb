//! Child-process plumbing: spawn a configured job's command and deliver its
//! stop signal. Pure helpers with no state of their own; the dispatcher in
//! [`crate::jm::supervisor`] owns all bookkeeping.

use std::fs::{File, OpenOptions};
use std::os::unix::process::CommandExt as _;
use std::process::{Command, Stdio};

use anyhow::Context as _;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setpgid, Pid};
use tracing::warn;

use crate::jm::config::JobConfig;

/// Spawns the job's command via `/bin/sh -c` and returns the child pid.
///
/// The three stdio files are opened in the parent (stdin read-only,
/// stdout/stderr append, created as needed) and handed to the child; the
/// parent keeps no descriptors. The child becomes its own process-group
/// leader so the stop signal reaches shell-spawned descendants too.
pub fn spawn(job: &JobConfig) -> anyhow::Result<i32> {
    let stdin = File::open(&job.stdin)
        .with_context(|| format!("job {}: failed to open stdin {}", job.name, job.stdin.display()))?;
    let stdout = open_append(job, &job.stdout)?;
    let stderr = open_append(job, &job.stderr)?;

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(&job.command)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .envs(&job.env);
    if let Some(dir) = &job.working_dir {
        cmd.current_dir(dir);
    }

    unsafe {
        cmd.pre_exec(|| {
            setpgid(Pid::from_raw(0), Pid::from_raw(0))
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        });
    }

    let child = cmd.spawn().map_err(|e| {
        // `Command::spawn` may fail due to exec setup OR `pre_exec`; the OS
        // error code is the most actionable signal, so always include it.
        anyhow::anyhow!(
            "spawn job={} command={:?} failed: kind={:?} os_error={:?} err={e}",
            job.name,
            job.command,
            e.kind(),
            e.raw_os_error()
        )
    })?;

    // The reaper collects the exit status via waitpid; dropping the handle
    // here must not wait on or kill the child.
    Ok(child.id() as i32)
}

fn open_append(job: &JobConfig, path: &std::path::Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("job {}: failed to open {}", job.name, path.display()))
}

/// Delivers `sig` to the child's process group. The child may already have
/// exited; that race with the reaper is tolerated.
pub fn signal(pid: i32, sig: Signal) {
    match killpg(Pid::from_raw(pid), sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, signal = %sig, error = %e, "failed to signal child process group"),
    }
}
