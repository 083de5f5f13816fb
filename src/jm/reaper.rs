//! Child reaping. SIGCHLD handlers must not touch the job table, so the
//! handler side is tokio's signal driver (the self-pipe trick packaged as a
//! stream) and all actual reaping happens here, in a normal task that
//! forwards each collected exit into the dispatcher queue.

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::error;

use crate::jm::supervisor::{ChildExit, SupervisorHandle};

pub fn spawn_reaper(handle: SupervisorHandle) -> anyhow::Result<JoinHandle<()>> {
    let mut chld = signal(SignalKind::child())
        .map_err(|e| anyhow::anyhow!("failed to install SIGCHLD handler: {e}"))?;
    Ok(tokio::spawn(async move {
        while chld.recv().await.is_some() {
            drain(&handle);
        }
        error!("SIGCHLD stream closed; child exits will no longer be observed");
    }))
}

/// Collects every terminated child. Signal delivery coalesces, so one wake
/// may stand for several exits; loop until nothing is waiting.
fn drain(handle: &SupervisorHandle) {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                handle.child_exited(pid.as_raw(), ChildExit::Code(code));
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                handle.child_exited(pid.as_raw(), ChildExit::Signal(sig));
            }
            // No more terminated children right now.
            Ok(WaitStatus::StillAlive) => break,
            // Stopped/continued children are not exits; keep draining.
            Ok(_) => continue,
            // ECHILD: nothing left to wait for.
            Err(_) => break,
        }
    }
}
