//! Daemon assembly: binds the control and event sockets, spawns the
//! dispatcher and the reaper, injects autostarts, and runs until a
//! `terminate` request or a termination signal has fully drained.

use std::fs;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;

use anyhow::Context as _;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{unix::OwnedWriteHalf, UnixListener, UnixStream};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::jm::config::SupervisorConfig;
use crate::jm::reaper;
use crate::jm::rpc::{self, ErrorCode, Payload, Request, Response};
use crate::jm::supervisor::{Supervisor, SupervisorHandle};

pub async fn run_daemon(cfg: SupervisorConfig) -> anyhow::Result<()> {
    std::env::set_current_dir(&cfg.working_dir).with_context(|| {
        format!("failed to enter working directory {}", cfg.working_dir.display())
    })?;

    fs::create_dir_all(&cfg.control_dir).with_context(|| {
        format!("failed to create control directory {}", cfg.control_dir.display())
    })?;
    let command_sock = rpc::command_socket(&cfg.control_dir);
    let event_sock = rpc::event_socket(&cfg.control_dir);
    prepare_socket(&command_sock)?;
    prepare_socket(&event_sock)?;

    // Binding is the only fatal failure mode after config load.
    let command_listener = UnixListener::bind(&command_sock).map_err(|e| {
        error!(socket = %command_sock.display(), error = %e, "cannot bind control socket");
        anyhow::anyhow!("failed to bind {}: {e}", command_sock.display())
    })?;
    let event_listener = UnixListener::bind(&event_sock).map_err(|e| {
        error!(socket = %event_sock.display(), error = %e, "cannot bind event socket");
        anyhow::anyhow!("failed to bind {}: {e}", event_sock.display())
    })?;

    let (handle, dispatcher) = Supervisor::spawn(&cfg.jobs);

    // The reaper must be listening before the first child can exit.
    let reaper = reaper::spawn_reaper(handle.clone())?;

    // Synthetic start requests for autostart jobs, injected before the
    // command frontend accepts its first connection.
    for (name, job) in &cfg.jobs {
        if !job.autostart {
            continue;
        }
        match handle.start(name).await {
            Ok(Ok(())) => {}
            // Spawn failures are already logged; the job stays stopped.
            Ok(Err(_)) => {}
            Err(e) => return Err(e.context("dispatcher died during autostart")),
        }
    }

    let command_task = spawn_command_frontend(command_listener, handle.clone());
    let event_task = spawn_event_frontend(event_listener, handle.clone());
    spawn_signal_listener(handle.clone())?;

    info!(
        control_dir = %cfg.control_dir.display(),
        jobs = cfg.jobs.len(),
        "jobmon daemon ready"
    );

    // The dispatcher task ends once graceful shutdown has drained.
    dispatcher.await.context("dispatcher task panicked")?;
    reaper.abort();
    command_task.abort();
    event_task.abort();

    let _ = fs::remove_file(&command_sock);
    let _ = fs::remove_file(&event_sock);
    info!("jobmon daemon stopped");
    Ok(())
}

/// Refuses to start over a live daemon; removes stale socket files.
fn prepare_socket(sock: &Path) -> anyhow::Result<()> {
    if sock.exists() {
        match StdUnixStream::connect(sock) {
            Ok(_) => anyhow::bail!(
                "jobmon daemon already running (socket {} is accepting connections)",
                sock.display()
            ),
            Err(_) => {
                fs::remove_file(sock).with_context(|| {
                    format!("failed to remove stale socket {}", sock.display())
                })?;
            }
        }
    }
    Ok(())
}

fn spawn_signal_listener(handle: SupervisorHandle) -> anyhow::Result<()> {
    let mut term = unix_signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {e}"))?;
    let mut int = unix_signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {e}"))?;
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => info!("SIGTERM received; initiating graceful shutdown"),
            _ = int.recv() => info!("SIGINT received; initiating graceful shutdown"),
        }
        handle.terminate();
    });
    Ok(())
}

fn spawn_command_frontend(listener: UnixListener, handle: SupervisorHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_command_conn(handle, stream).await {
                            warn!(error = %e, "control connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed on control socket");
                    sleep(Duration::from_millis(200)).await;
                }
            }
        }
    })
}

/// One connection may carry several newline-delimited requests; each gets
/// exactly one response line. Malformed input ends the connection after a
/// BAD_REQUEST response.
async fn handle_command_conn(handle: SupervisorHandle, stream: UnixStream) -> anyhow::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        let req: Request = match serde_json::from_str(line.trim_end()) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "rejecting malformed control request");
                write_response(&mut write, &Response::err(ErrorCode::BadRequest)).await?;
                return Ok(());
            }
        };

        let resp = match req {
            Request::Start { job } => match handle.start(&job).await? {
                Ok(()) => Response::ok(),
                Err(e) => Response::err(e.code()),
            },
            Request::Stop { job } => match handle.stop(&job).await? {
                Ok(()) => Response::ok(),
                Err(e) => Response::err(e.code()),
            },
            Request::Status { job } => match handle.status(&job).await? {
                Ok(phase) => Response::with_payload(Payload::Phase(phase)),
                Err(e) => Response::err(e.code()),
            },
            Request::ListJobs => {
                let jobs = handle.list_jobs().await?;
                Response::with_payload(Payload::Jobs(jobs))
            }
            Request::Wait { job } => match handle.wait(&job).await? {
                Ok(rx) => match rx.await {
                    Ok(event) => Response::with_payload(Payload::Phase(event.status)),
                    // Bus went away mid-wait: the daemon is shutting down.
                    Err(_) => return Ok(()),
                },
                Err(e) => Response::err(e.code()),
            },
            Request::Terminate => {
                // Answer first so the client observes success, then drain.
                write_response(&mut write, &Response::ok()).await?;
                handle.terminate();
                return Ok(());
            }
        };
        write_response(&mut write, &resp).await?;
    }
}

async fn write_response(write: &mut OwnedWriteHalf, resp: &Response) -> anyhow::Result<()> {
    let line = serde_json::to_string(resp)? + "\n";
    write.write_all(line.as_bytes()).await?;
    write.flush().await?;
    Ok(())
}

fn spawn_event_frontend(listener: UnixListener, handle: SupervisorHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        let _ = handle_event_conn(handle, stream).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed on event socket");
                    sleep(Duration::from_millis(200)).await;
                }
            }
        }
    })
}

/// Streams newline-delimited records until the client disconnects, the bus
/// disconnects the subscriber as too slow, or the daemon shuts down.
async fn handle_event_conn(handle: SupervisorHandle, stream: UnixStream) -> anyhow::Result<()> {
    let (id, mut events) = handle.subscribe(None).await?;
    let (mut read, mut write) = stream.into_split();
    // Subscribers send nothing; reads only detect disconnection.
    let mut scratch = [0u8; 64];

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    let line = serde_json::to_string(&event.record())? + "\n";
                    if write.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            n = read.read(&mut scratch) => match n {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            },
        }
    }

    handle.unsubscribe(id);
    Ok(())
}
