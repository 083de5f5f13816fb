//! The dispatcher: a single task owning the job table, the event bus, and
//! the cooldown queue. Every external request and every reaped child exit
//! flows through one ordered command channel, so state transitions and
//! event publication advance atomically per request.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::jm::bus::{Event, EventBus, SubscriberId};
use crate::jm::config::JobConfig;
use crate::jm::rpc::{ErrorCode, JobStatus, PhaseName};
use crate::jm::runner;
use crate::jm::throttle::{RespawnDecision, RestartThrottle};

/// How long children get to exit after the shutdown signal round.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Extra time allowed after escalating to SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Running,
    CooldownPending,
}

impl Phase {
    /// CooldownPending has no live child and never published a RUNNING
    /// record for the pending spawn, so clients see it as stopped.
    fn visible(self) -> PhaseName {
        match self {
            Phase::Running => PhaseName::Running,
            Phase::Stopped | Phase::CooldownPending => PhaseName::Stopped,
        }
    }
}

/// Exit of a reaped child, as reported by the reaper.
#[derive(Debug, Clone, Copy)]
pub enum ChildExit {
    Code(i32),
    Signal(Signal),
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("no such job: {0}")]
    UnknownJob(String),
    #[error("job {0} is already running")]
    AlreadyRunning(String),
    #[error("job {0} is already stopped")]
    AlreadyStopped(String),
    #[error("failed to spawn job {name}")]
    SpawnFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl RequestError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RequestError::UnknownJob(_) => ErrorCode::UnknownJob,
            RequestError::AlreadyRunning(_) => ErrorCode::AlreadyRunning,
            RequestError::AlreadyStopped(_) => ErrorCode::AlreadyStopped,
            RequestError::SpawnFailed { .. } => ErrorCode::SpawnFailed,
        }
    }
}

pub enum Cmd {
    Start {
        job: String,
        resp: oneshot::Sender<Result<(), RequestError>>,
    },
    Stop {
        job: String,
        resp: oneshot::Sender<Result<(), RequestError>>,
    },
    Status {
        job: String,
        resp: oneshot::Sender<Result<PhaseName, RequestError>>,
    },
    ListJobs {
        resp: oneshot::Sender<Vec<JobStatus>>,
    },
    Wait {
        job: String,
        resp: oneshot::Sender<Result<oneshot::Receiver<Event>, RequestError>>,
    },
    Subscribe {
        filter: Option<String>,
        resp: oneshot::Sender<(SubscriberId, mpsc::Receiver<Event>)>,
    },
    Unsubscribe {
        id: SubscriberId,
    },
    ChildExited {
        pid: i32,
        exit: ChildExit,
    },
    Terminate,
}

/// Cloneable handle used by the socket frontends and the reaper.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Cmd>,
}

impl SupervisorHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Cmd) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .map_err(|_| anyhow::anyhow!("supervisor is gone"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("supervisor dropped the request"))
    }

    pub async fn start(&self, job: &str) -> anyhow::Result<Result<(), RequestError>> {
        let job = job.to_string();
        self.request(|resp| Cmd::Start { job, resp }).await
    }

    pub async fn stop(&self, job: &str) -> anyhow::Result<Result<(), RequestError>> {
        let job = job.to_string();
        self.request(|resp| Cmd::Stop { job, resp }).await
    }

    pub async fn status(&self, job: &str) -> anyhow::Result<Result<PhaseName, RequestError>> {
        let job = job.to_string();
        self.request(|resp| Cmd::Status { job, resp }).await
    }

    pub async fn list_jobs(&self) -> anyhow::Result<Vec<JobStatus>> {
        self.request(|resp| Cmd::ListJobs { resp }).await
    }

    /// Registers a waiter resolved by the job's next phase transition.
    pub async fn wait(
        &self,
        job: &str,
    ) -> anyhow::Result<Result<oneshot::Receiver<Event>, RequestError>> {
        let job = job.to_string();
        self.request(|resp| Cmd::Wait { job, resp }).await
    }

    pub async fn subscribe(
        &self,
        filter: Option<String>,
    ) -> anyhow::Result<(SubscriberId, mpsc::Receiver<Event>)> {
        self.request(|resp| Cmd::Subscribe { filter, resp }).await
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.tx.send(Cmd::Unsubscribe { id });
    }

    /// Initiates graceful shutdown. Fire-and-forget; completion is observed
    /// by joining the dispatcher task.
    pub fn terminate(&self) {
        let _ = self.tx.send(Cmd::Terminate);
    }

    pub(crate) fn child_exited(&self, pid: i32, exit: ChildExit) {
        let _ = self.tx.send(Cmd::ChildExited { pid, exit });
    }
}

struct Job {
    cfg: JobConfig,
    phase: Phase,
    pid: Option<i32>,
    /// Incremented on every spawn; stale reaps are discarded against it.
    generation: u64,
    throttle: RestartThrottle,
    cooldown_until: Option<Instant>,
    /// Set when a stop request signaled the live child, so the exit it
    /// causes is not fed to the restart throttle.
    stop_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct CooldownEntry {
    at: Instant,
    job: String,
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Active,
    Draining { deadline: Instant, escalated: bool },
}

pub struct Supervisor {
    jobs: BTreeMap<String, Job>,
    /// pid -> (job name, spawn generation) for every live child we own.
    live: HashMap<i32, (String, u64)>,
    bus: EventBus,
    cooldowns: BinaryHeap<Reverse<CooldownEntry>>,
    rx: mpsc::UnboundedReceiver<Cmd>,
    stage: Stage,
    abandoned: bool,
}

enum Followup {
    None,
    Respawn,
    Cooldown(Instant),
}

impl Supervisor {
    /// Builds the dispatcher for the configured jobs and spawns its task.
    /// The task ends after a `Terminate` command has fully drained.
    pub fn spawn(jobs: &BTreeMap<String, JobConfig>) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sup = Supervisor {
            jobs: jobs
                .iter()
                .map(|(name, cfg)| {
                    (
                        name.clone(),
                        Job {
                            throttle: RestartThrottle::new(cfg.restart),
                            cfg: cfg.clone(),
                            phase: Phase::Stopped,
                            pid: None,
                            generation: 0,
                            cooldown_until: None,
                            stop_requested: false,
                        },
                    )
                })
                .collect(),
            live: HashMap::new(),
            bus: EventBus::new(),
            cooldowns: BinaryHeap::new(),
            rx,
            stage: Stage::Active,
            abandoned: false,
        };
        let task = tokio::spawn(sup.run());
        (SupervisorHandle { tx }, task)
    }

    async fn run(mut self) {
        loop {
            let cmd = match self.next_wake() {
                Some(at) => {
                    tokio::select! {
                        c = self.rx.recv() => match c {
                            Some(c) => Some(c),
                            None => break,
                        },
                        _ = time::sleep_until(time::Instant::from_std(at)) => None,
                    }
                }
                None => match self.rx.recv().await {
                    Some(c) => Some(c),
                    None => break,
                },
            };

            match cmd {
                Some(cmd) => self.handle_cmd(cmd),
                None => self.handle_timers(Instant::now()),
            }

            if self.shutdown_complete() {
                break;
            }
        }
        info!("dispatcher stopped");
    }

    fn next_wake(&self) -> Option<Instant> {
        let cooldown = self.cooldowns.peek().map(|Reverse(e)| e.at);
        let drain = match self.stage {
            Stage::Draining { deadline, .. } => Some(deadline),
            Stage::Active => None,
        };
        cooldown.into_iter().chain(drain).min()
    }

    fn shutdown_complete(&self) -> bool {
        matches!(self.stage, Stage::Draining { .. }) && (self.live.is_empty() || self.abandoned)
    }

    fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Start { job, resp } => {
                let _ = resp.send(self.handle_start(&job));
            }
            Cmd::Stop { job, resp } => {
                let _ = resp.send(self.handle_stop(&job));
            }
            Cmd::Status { job, resp } => {
                let result = match self.jobs.get(&job) {
                    Some(j) => Ok(j.phase.visible()),
                    None => Err(RequestError::UnknownJob(job)),
                };
                let _ = resp.send(result);
            }
            Cmd::ListJobs { resp } => {
                let list = self
                    .jobs
                    .iter()
                    .map(|(name, job)| JobStatus {
                        name: name.clone(),
                        status: job.phase.visible(),
                    })
                    .collect();
                let _ = resp.send(list);
            }
            Cmd::Wait { job, resp } => {
                let result = if self.jobs.contains_key(&job) {
                    Ok(self.bus.wait_for(&job))
                } else {
                    Err(RequestError::UnknownJob(job))
                };
                let _ = resp.send(result);
            }
            Cmd::Subscribe { filter, resp } => {
                let _ = resp.send(self.bus.subscribe(filter));
            }
            Cmd::Unsubscribe { id } => self.bus.unsubscribe(id),
            Cmd::ChildExited { pid, exit } => self.handle_child_exited(pid, exit),
            Cmd::Terminate => self.begin_shutdown(),
        }
    }

    fn handle_start(&mut self, name: &str) -> Result<(), RequestError> {
        let phase = match self.jobs.get(name) {
            Some(j) => j.phase,
            None => return Err(RequestError::UnknownJob(name.to_string())),
        };
        match phase {
            Phase::Running => Err(RequestError::AlreadyRunning(name.to_string())),
            // An explicit start while in cooldown cancels the pending
            // respawn and spawns right away.
            Phase::Stopped | Phase::CooldownPending => self.spawn_job(name),
        }
    }

    fn handle_stop(&mut self, name: &str) -> Result<(), RequestError> {
        let job = match self.jobs.get_mut(name) {
            Some(j) => j,
            None => return Err(RequestError::UnknownJob(name.to_string())),
        };
        match job.phase {
            Phase::Stopped => Err(RequestError::AlreadyStopped(name.to_string())),
            Phase::CooldownPending => {
                // No RUNNING was ever published for the pending spawn, so
                // cancelling it publishes nothing either.
                job.phase = Phase::Stopped;
                job.cooldown_until = None;
                info!(job = name, "cancelled pending respawn");
                Ok(())
            }
            Phase::Running => {
                job.stop_requested = true;
                if let Some(pid) = job.pid {
                    runner::signal(pid, job.cfg.stop_signal);
                }
                // The job keeps reporting RUNNING until the reap arrives;
                // the STOPPED record is published on actual process death.
                Ok(())
            }
        }
    }

    fn spawn_job(&mut self, name: &str) -> Result<(), RequestError> {
        if matches!(self.stage, Stage::Draining { .. }) {
            return Err(RequestError::SpawnFailed {
                name: name.to_string(),
                source: anyhow::anyhow!("supervisor is shutting down"),
            });
        }
        let (pid, generation) = {
            let job = self.jobs.get_mut(name).expect("caller checked the name");
            job.cooldown_until = None;
            job.stop_requested = false;
            match runner::spawn(&job.cfg) {
                Ok(pid) => {
                    job.generation += 1;
                    job.phase = Phase::Running;
                    job.pid = Some(pid);
                    (pid, job.generation)
                }
                Err(e) => {
                    job.phase = Phase::Stopped;
                    warn!(job = name, error = %e, "failed to spawn job");
                    return Err(RequestError::SpawnFailed {
                        name: name.to_string(),
                        source: e,
                    });
                }
            }
        };
        self.live.insert(pid, (name.to_string(), generation));
        info!(job = name, pid, "job started");
        self.bus.publish(Event::now(name, PhaseName::Running));
        Ok(())
    }

    fn handle_child_exited(&mut self, pid: i32, exit: ChildExit) {
        let Some((name, generation)) = self.live.remove(&pid) else {
            debug!(pid, "discarding reap for unowned pid");
            return;
        };

        let followup = {
            let job = self
                .jobs
                .get_mut(&name)
                .expect("live table only names configured jobs");
            if job.generation != generation {
                debug!(job = %name, pid, "discarding reap for superseded child");
                return;
            }
            match exit {
                ChildExit::Code(code) => info!(job = %name, pid, code, "child exited"),
                ChildExit::Signal(sig) => {
                    info!(job = %name, pid, signal = %sig, "child killed by signal")
                }
            }
            job.pid = None;
            job.phase = Phase::Stopped;

            let explicit = std::mem::take(&mut job.stop_requested);
            if matches!(self.stage, Stage::Draining { .. }) || explicit {
                Followup::None
            } else {
                match job.throttle.on_exit(Instant::now()) {
                    RespawnDecision::GiveUp => {
                        if job.cfg.restart {
                            info!(job = %name, "restarts exhausted; job stays stopped");
                        }
                        Followup::None
                    }
                    RespawnDecision::Respawn => Followup::Respawn,
                    RespawnDecision::Defer(until) => Followup::Cooldown(until),
                }
            }
        };

        self.bus.publish(Event::now(&name, PhaseName::Stopped));

        match followup {
            Followup::None => {}
            Followup::Respawn => {
                // Spawn failure was already logged; the job stays Stopped
                // with no retry.
                let _ = self.spawn_job(&name);
            }
            Followup::Cooldown(until) => {
                let job = self.jobs.get_mut(&name).expect("checked above");
                job.phase = Phase::CooldownPending;
                job.cooldown_until = Some(until);
                let generation = job.generation;
                info!(job = %name, "crashing rapidly; respawn deferred");
                self.cooldowns.push(Reverse(CooldownEntry {
                    at: until,
                    job: name,
                    generation,
                }));
            }
        }
    }

    fn handle_timers(&mut self, now: Instant) {
        if let Stage::Draining { deadline, escalated } = &mut self.stage {
            if now >= *deadline {
                if !*escalated {
                    warn!(
                        remaining = self.live.len(),
                        "children outlived the grace period; escalating to SIGKILL"
                    );
                    for pid in self.live.keys() {
                        runner::signal(*pid, Signal::SIGKILL);
                    }
                    *escalated = true;
                    *deadline = now + KILL_GRACE;
                } else {
                    error!(
                        remaining = self.live.len(),
                        "children survived SIGKILL grace; abandoning them"
                    );
                    self.abandoned = true;
                }
            }
            return;
        }
        self.fire_cooldowns(now);
    }

    fn fire_cooldowns(&mut self, now: Instant) {
        loop {
            match self.cooldowns.peek() {
                Some(Reverse(entry)) if entry.at <= now => {}
                _ => break,
            }
            let Reverse(entry) = self.cooldowns.pop().expect("peeked entry");
            let due = self.jobs.get(&entry.job).is_some_and(|j| {
                j.phase == Phase::CooldownPending
                    && j.generation == entry.generation
                    && j.cooldown_until == Some(entry.at)
            });
            if !due {
                // Cancelled by an explicit start or stop in the meantime.
                continue;
            }
            let _ = self.spawn_job(&entry.job);
        }
    }

    fn begin_shutdown(&mut self) {
        if matches!(self.stage, Stage::Draining { .. }) {
            return;
        }
        let running: Vec<String> = self
            .jobs
            .values()
            .filter(|j| j.phase == Phase::Running)
            .map(|j| j.cfg.name.clone())
            .collect();
        info!(running = running.len(), "shutting down; signaling running jobs");

        self.cooldowns.clear();
        for job in self.jobs.values_mut() {
            match job.phase {
                Phase::CooldownPending => {
                    job.phase = Phase::Stopped;
                    job.cooldown_until = None;
                }
                Phase::Running => {
                    if let Some(pid) = job.pid {
                        runner::signal(pid, job.cfg.stop_signal);
                    }
                }
                Phase::Stopped => {}
            }
        }
        self.stage = Stage::Draining {
            deadline: Instant::now() + SHUTDOWN_GRACE,
            escalated: false,
        };
    }
}
