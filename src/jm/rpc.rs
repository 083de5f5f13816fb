use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

pub const COMMAND_SOCKET: &str = "command.sock";
pub const EVENT_SOCKET: &str = "event.sock";

pub fn command_socket(control_dir: &Path) -> PathBuf {
    control_dir.join(COMMAND_SOCKET)
}

pub fn event_socket(control_dir: &Path) -> PathBuf {
    control_dir.join(EVENT_SOCKET)
}

/// A control request, one JSON object per line on the command socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Request {
    Start { job: String },
    Stop { job: String },
    Status { job: String },
    ListJobs,
    Wait { job: String },
    Terminate,
}

/// Externally visible phase of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseName {
    Running,
    Stopped,
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseName::Running => f.write_str("RUNNING"),
            PhaseName::Stopped => f.write_str("STOPPED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub name: String,
    pub status: PhaseName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnknownJob,
    AlreadyRunning,
    AlreadyStopped,
    SpawnFailed,
    BadRequest,
}

impl ErrorCode {
    /// Human-readable form for CLI stderr output.
    pub fn describe(&self) -> &'static str {
        match self {
            ErrorCode::UnknownJob => "no such job",
            ErrorCode::AlreadyRunning => "job is already running",
            ErrorCode::AlreadyStopped => "job is already stopped",
            ErrorCode::SpawnFailed => "failed to spawn the job's command",
            ErrorCode::BadRequest => "malformed request",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Phase(PhaseName),
    Jobs(Vec<JobStatus>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            ok: true,
            payload: None,
            error: None,
        }
    }

    pub fn with_payload(payload: Payload) -> Self {
        Self {
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(code: ErrorCode) -> Self {
        Self {
            ok: false,
            payload: None,
            error: Some(code),
        }
    }
}

/// One state-change record, pushed as a JSON line to event subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub job: String,
    pub status: PhaseName,
}

// -------- blocking client side (jmctl) --------

pub fn client_call(control_dir: &Path, req: &Request) -> anyhow::Result<Response> {
    let sock = command_socket(control_dir);
    let mut stream = UnixStream::connect(&sock).map_err(|e| {
        anyhow::anyhow!("failed to connect to jobmon daemon socket {}: {e}", sock.display())
    })?;

    let line = serde_json::to_string(req)? + "\n";
    stream.write_all(line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut resp_line = String::new();
    reader.read_line(&mut resp_line)?;
    if resp_line.trim().is_empty() {
        anyhow::bail!("empty response from daemon");
    }
    let resp: Response = serde_json::from_str(resp_line.trim_end())?;
    Ok(resp)
}

/// Streams event records until the daemon closes the socket, the callback
/// has been invoked `limit` times (when nonzero), or the pipe breaks.
pub fn client_listen<F>(control_dir: &Path, limit: u64, mut on_event: F) -> anyhow::Result<()>
where
    F: FnMut(&EventRecord),
{
    let sock = event_socket(control_dir);
    let stream = UnixStream::connect(&sock).map_err(|e| {
        anyhow::anyhow!("failed to connect to jobmon event socket {}: {e}", sock.display())
    })?;

    let mut reader = BufReader::new(stream);
    let mut seen: u64 = 0;
    let mut buf = String::new();
    loop {
        if limit > 0 && seen >= limit {
            return Ok(());
        }
        buf.clear();
        let n = reader.read_line(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        if buf.trim().is_empty() {
            continue;
        }
        let event: EventRecord = serde_json::from_str(buf.trim_end())?;
        on_event(&event);
        seen += 1;
    }
}
