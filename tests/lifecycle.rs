//! In-process lifecycle coverage: a dispatcher plus reaper driving real
//! `/bin/sh` children. Everything runs inside one test body so exactly one
//! reaper owns SIGCHLD for this process.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use jobmon::jm::bus::Event;
use jobmon::jm::config::{parse_signal, JobConfig};
use jobmon::jm::reaper::spawn_reaper;
use jobmon::jm::rpc::PhaseName;
use jobmon::jm::supervisor::{RequestError, Supervisor};

fn job(name: &str, command: &str) -> JobConfig {
    JobConfig {
        name: name.to_string(),
        command: command.to_string(),
        stdin: PathBuf::from("/dev/null"),
        stdout: PathBuf::from("/dev/null"),
        stderr: PathBuf::from("/dev/null"),
        env: BTreeMap::new(),
        working_dir: None,
        stop_signal: parse_signal("TERM").unwrap(),
        autostart: false,
        restart: false,
    }
}

async fn next_event(events: &mut mpsc::Receiver<Event>) -> (String, PhaseName) {
    let event = timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed early");
    (event.job, event.status)
}

async fn expect_event(events: &mut mpsc::Receiver<Event>, job: &str, status: PhaseName) {
    assert_eq!(next_event(events).await, (job.to_string(), status));
}

async fn expect_quiet(events: &mut mpsc::Receiver<Event>, for_ms: u64) {
    assert!(
        timeout(Duration::from_millis(for_ms), events.recv())
            .await
            .is_err(),
        "expected no events"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn job_lifecycle_end_to_end() {
    let mut jobs = BTreeMap::new();
    jobs.insert("oneshot".to_string(), job("oneshot", "true"));
    {
        let mut sleeper = job("sleeper", "trap 'exit 42' USR1; sleep 60 & wait");
        sleeper.stop_signal = parse_signal("USR1").unwrap();
        jobs.insert("sleeper".to_string(), sleeper);
    }
    {
        let mut flapper = job("flapper", "false");
        flapper.restart = true;
        jobs.insert("flapper".to_string(), flapper);
    }
    jobs.insert("svc1".to_string(), job("svc1", "sleep 60"));
    jobs.insert("svc2".to_string(), job("svc2", "sleep 60"));

    let (handle, dispatcher) = Supervisor::spawn(&jobs);
    let _reaper = spawn_reaper(handle.clone()).unwrap();
    let (_, mut events) = handle.subscribe(None).await.unwrap();

    // A job whose command exits on its own publishes RUNNING then STOPPED
    // and reports STOPPED once the stream quiesces.
    handle.start("oneshot").await.unwrap().unwrap();
    expect_event(&mut events, "oneshot", PhaseName::Running).await;
    expect_event(&mut events, "oneshot", PhaseName::Stopped).await;
    assert_eq!(
        handle.status("oneshot").await.unwrap().unwrap(),
        PhaseName::Stopped
    );

    // Unknown names are rejected without touching any state.
    assert!(matches!(
        handle.start("nope").await.unwrap(),
        Err(RequestError::UnknownJob(_))
    ));

    // A long-running job reports RUNNING right after start; redundant
    // starts are refused without publishing anything.
    handle.start("sleeper").await.unwrap().unwrap();
    expect_event(&mut events, "sleeper", PhaseName::Running).await;
    assert_eq!(
        handle.status("sleeper").await.unwrap().unwrap(),
        PhaseName::Running
    );
    assert!(matches!(
        handle.start("sleeper").await.unwrap(),
        Err(RequestError::AlreadyRunning(_))
    ));

    // Stop delivers the configured signal (USR1 here, which the shell trap
    // turns into exit 42); a wait registered before the stop resolves with
    // the resulting transition.
    let waiter = handle.wait("sleeper").await.unwrap().unwrap();
    handle.stop("sleeper").await.unwrap().unwrap();
    let transition = timeout(Duration::from_secs(10), waiter)
        .await
        .expect("wait timed out")
        .expect("waiter dropped");
    assert_eq!(transition.status, PhaseName::Stopped);
    expect_event(&mut events, "sleeper", PhaseName::Stopped).await;
    assert_eq!(
        handle.status("sleeper").await.unwrap().unwrap(),
        PhaseName::Stopped
    );

    // A restart-enabled job that crashes immediately respawns once, then a
    // second crash inside the rapid window puts it into cooldown: visible
    // phase STOPPED and no further records until the cooldown elapses.
    handle.start("flapper").await.unwrap().unwrap();
    expect_event(&mut events, "flapper", PhaseName::Running).await;
    expect_event(&mut events, "flapper", PhaseName::Stopped).await;
    expect_event(&mut events, "flapper", PhaseName::Running).await;
    expect_event(&mut events, "flapper", PhaseName::Stopped).await;
    expect_quiet(&mut events, 500).await;
    assert_eq!(
        handle.status("flapper").await.unwrap().unwrap(),
        PhaseName::Stopped
    );

    // An explicit start cancels the pending respawn and spawns right away;
    // the ensuing crash is again inside the window, so it defers again.
    handle.start("flapper").await.unwrap().unwrap();
    expect_event(&mut events, "flapper", PhaseName::Running).await;
    expect_event(&mut events, "flapper", PhaseName::Stopped).await;
    expect_quiet(&mut events, 500).await;

    // Stopping a job in cooldown cancels the pending spawn silently: no
    // RUNNING was ever published for it, so nothing is published now.
    handle.stop("flapper").await.unwrap().unwrap();
    expect_quiet(&mut events, 300).await;
    assert!(matches!(
        handle.stop("flapper").await.unwrap(),
        Err(RequestError::AlreadyStopped(_))
    ));

    // Graceful shutdown: both running jobs get their stop signal, both are
    // reaped with STOPPED records, and the dispatcher task ends.
    handle.start("svc1").await.unwrap().unwrap();
    handle.start("svc2").await.unwrap().unwrap();
    expect_event(&mut events, "svc1", PhaseName::Running).await;
    expect_event(&mut events, "svc2", PhaseName::Running).await;

    handle.terminate();
    let mut stopped = vec![next_event(&mut events).await, next_event(&mut events).await];
    stopped.sort();
    assert_eq!(
        stopped,
        vec![
            ("svc1".to_string(), PhaseName::Stopped),
            ("svc2".to_string(), PhaseName::Stopped),
        ]
    );

    timeout(Duration::from_secs(10), dispatcher)
        .await
        .expect("dispatcher did not stop")
        .unwrap();

    // The bus died with the dispatcher; the subscriber sees end-of-stream.
    assert!(timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("stream should close")
        .is_none());
}
