//! Socket-level coverage: a full daemon bound to a temporary control
//! directory, driven through the newline-delimited JSON protocol exactly as
//! external clients speak it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};

use jobmon::jm::config::load_config;
use jobmon::jm::daemon::run_daemon;
use jobmon::jm::rpc::{self, ErrorCode, EventRecord, Payload, PhaseName, Request, Response};

struct Client {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl Client {
    async fn connect(control_dir: &Path) -> Self {
        let stream = UnixStream::connect(rpc::command_socket(control_dir))
            .await
            .expect("connect to command socket");
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn read_response(&mut self) -> Response {
        let mut line = String::new();
        timeout(Duration::from_secs(10), self.reader.read_line(&mut line))
            .await
            .expect("timed out reading response")
            .expect("read response line");
        serde_json::from_str(line.trim_end()).expect("parse response")
    }

    async fn call(&mut self, req: &Request) -> Response {
        self.send_line(&serde_json::to_string(req).unwrap()).await;
        self.read_response().await
    }

    /// Returns None at end-of-stream (connection closed by the daemon).
    async fn try_read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(10), self.reader.read_line(&mut line))
            .await
            .expect("timed out reading line")
            .expect("read line");
        (n > 0).then(|| line.trim_end().to_string())
    }
}

async fn next_event(reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>) -> EventRecord {
    let mut line = String::new();
    let n = timeout(Duration::from_secs(10), reader.read_line(&mut line))
        .await
        .expect("timed out waiting for event")
        .expect("read event line");
    assert!(n > 0, "event stream closed early");
    serde_json::from_str(line.trim_end()).expect("parse event")
}

fn write_config(dir: &Path) -> PathBuf {
    let control_dir = dir.join("control");
    let config = format!(
        r#"
supervisor:
  working_dir: {dir}
  control_dir: {control}
jobs:
  auto:
    command: "sleep 60"
    autostart: true
  oneshot:
    command: "true"
  sleeper:
    command: "sleep 60"
"#,
        dir = dir.display(),
        control = control_dir.display(),
    );
    let path = dir.join("jobmon.yaml");
    std::fs::write(&path, config).unwrap();
    path
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let config_path = write_config(tmp.path());
    let cfg = load_config(&config_path).unwrap();
    let control_dir = cfg.control_dir.clone();

    let daemon = tokio::spawn(run_daemon(cfg));

    // Wait for the daemon to bind its sockets.
    let command_sock = rpc::command_socket(&control_dir);
    for _ in 0..100 {
        if command_sock.exists() {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(command_sock.exists(), "daemon did not come up");

    let mut client = Client::connect(&control_dir).await;

    // Autostarted job is already running; the others are stopped.
    let resp = client.call(&Request::ListJobs).await;
    assert!(resp.ok);
    let Some(Payload::Jobs(jobs)) = resp.payload else {
        panic!("list-jobs payload missing");
    };
    let rendered: Vec<(String, PhaseName)> =
        jobs.into_iter().map(|j| (j.name, j.status)).collect();
    assert_eq!(
        rendered,
        vec![
            ("auto".to_string(), PhaseName::Running),
            ("oneshot".to_string(), PhaseName::Stopped),
            ("sleeper".to_string(), PhaseName::Stopped),
        ]
    );

    // Unknown job over the wire.
    let resp = client
        .call(&Request::Status { job: "nope".into() })
        .await;
    assert_eq!(resp, Response::err(ErrorCode::UnknownJob));

    // Subscribe to events before starting anything else.
    let event_stream = UnixStream::connect(rpc::event_socket(&control_dir))
        .await
        .unwrap();
    let (event_read, _event_write) = event_stream.into_split();
    let mut events = BufReader::new(event_read);

    // Start/stop roundtrip observed through the event stream.
    let resp = client.call(&Request::Start { job: "oneshot".into() }).await;
    assert_eq!(resp, Response::ok());
    assert_eq!(
        next_event(&mut events).await,
        EventRecord { job: "oneshot".into(), status: PhaseName::Running }
    );
    assert_eq!(
        next_event(&mut events).await,
        EventRecord { job: "oneshot".into(), status: PhaseName::Stopped }
    );
    let resp = client.call(&Request::Status { job: "oneshot".into() }).await;
    assert_eq!(resp.payload, Some(Payload::Phase(PhaseName::Stopped)));

    // Redundant transitions are refused and publish nothing.
    let resp = client.call(&Request::Stop { job: "oneshot".into() }).await;
    assert_eq!(resp, Response::err(ErrorCode::AlreadyStopped));

    // A wait issued on a second connection resolves when the job stops.
    let resp = client.call(&Request::Start { job: "sleeper".into() }).await;
    assert_eq!(resp, Response::ok());
    assert_eq!(
        next_event(&mut events).await,
        EventRecord { job: "sleeper".into(), status: PhaseName::Running }
    );

    let mut waiter = Client::connect(&control_dir).await;
    waiter
        .send_line(r#"{"command":"wait","job":"sleeper"}"#)
        .await;
    // Give the wait a moment to register before triggering the transition.
    sleep(Duration::from_millis(100)).await;
    let resp = client.call(&Request::Stop { job: "sleeper".into() }).await;
    assert_eq!(resp, Response::ok());
    let resp = waiter.read_response().await;
    assert_eq!(resp.payload, Some(Payload::Phase(PhaseName::Stopped)));
    assert_eq!(
        next_event(&mut events).await,
        EventRecord { job: "sleeper".into(), status: PhaseName::Stopped }
    );

    // The blocking client helper speaks the same protocol.
    {
        let dir = control_dir.clone();
        let resp = tokio::task::spawn_blocking(move || {
            rpc::client_call(&dir, &Request::Status { job: "auto".into() })
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(resp.payload, Some(Payload::Phase(PhaseName::Running)));
    }

    // Malformed input gets BAD_REQUEST and the connection is closed.
    let mut bad = Client::connect(&control_dir).await;
    bad.send_line("{not json at all").await;
    let resp = bad.read_response().await;
    assert_eq!(resp, Response::err(ErrorCode::BadRequest));
    assert_eq!(bad.try_read_line().await, None);

    // Graceful shutdown: ok response, STOPPED for the autostarted job, the
    // event stream closes, the daemon exits cleanly, sockets are removed.
    let resp = client.call(&Request::Terminate).await;
    assert_eq!(resp, Response::ok());
    assert_eq!(
        next_event(&mut events).await,
        EventRecord { job: "auto".into(), status: PhaseName::Stopped }
    );
    let mut line = String::new();
    let n = timeout(Duration::from_secs(10), events.read_line(&mut line))
        .await
        .expect("event stream should close")
        .unwrap();
    assert_eq!(n, 0, "event stream should be at end-of-stream");

    timeout(Duration::from_secs(10), daemon)
        .await
        .expect("daemon did not exit")
        .unwrap()
        .unwrap();
    assert!(!command_sock.exists());
    assert!(!rpc::event_socket(&control_dir).exists());
}
