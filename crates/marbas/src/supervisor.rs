//! Backend process supervision.
//!
//! A single reaper task owns every child handle. Callers talk to it through a
//! command channel and observe liveness through a shared status map, so a slow
//! reap never blocks request handling and no caller holds a process handle of
//! its own.
//!
//! Each tracked process carries a [`RestartPolicy`]. `Always` processes (the
//! shared backend, the reverse proxy) are relaunched after a backoff when they
//! exit; `Never` processes (dedicated per-model backends) are reported through
//! an [`ExitEvent`] and left for the owner to clean up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use vassago_core::{Error, ProcessId, Result};

/// What to do when a tracked process exits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    /// Relaunch with the same spec after the restart backoff.
    Always,
    /// Report the exit and stop tracking the child.
    Never,
}

/// Everything needed to (re)launch a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Logical name used in logs and events.
    pub name: String,
    /// Executable.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// Creates a spec with no extra environment.
    #[must_use]
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            env: Vec::new(),
        }
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn launch(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Supervisor timing.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// How often children are polled when no SIGCHLD arrives.
    pub reap_interval: Duration,
    /// Delay before an `Always` process is relaunched.
    pub restart_backoff: Duration,
    /// How long a stopped process gets between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_millis(250),
            restart_backoff: Duration::from_secs(1),
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// Liveness as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "code")]
pub enum ProcessState {
    /// The child is running.
    Running,
    /// The child exited and is waiting out the restart backoff.
    Restarting,
    /// The child exited and will not be relaunched. Carries the exit code,
    /// if the process was not killed by a signal.
    Exited(Option<i32>),
}

/// Snapshot of a tracked process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    /// Logical name.
    pub name: String,
    /// OS pid of the current incarnation.
    pub pid: Option<u32>,
    /// Current state.
    pub state: ProcessState,
    /// Restart policy.
    pub policy: RestartPolicy,
    /// Number of relaunches so far.
    pub restarts: u32,
}

/// Published whenever a tracked process exits on its own.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    /// Supervisor handle of the process.
    pub id: ProcessId,
    /// Logical name.
    pub name: String,
    /// Exit code, if any.
    pub code: Option<i32>,
    /// Whether the process will be relaunched.
    pub restarting: bool,
}

enum SupervisorCommand {
    Spawn {
        id: ProcessId,
        spec: LaunchSpec,
        policy: RestartPolicy,
        reply: oneshot::Sender<Result<u32>>,
    },
    Stop {
        id: ProcessId,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Shared {
    status: DashMap<ProcessId, ProcessInfo>,
    events: broadcast::Sender<ExitEvent>,
}

/// Handle to the supervisor task. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    commands: mpsc::UnboundedSender<SupervisorCommand>,
    shared: Arc<Shared>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("tracked", &self.shared.status.len())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Starts the reaper task. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn start(config: SupervisorConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            status: DashMap::new(),
            events,
        });

        let reaper = Reaper {
            children: HashMap::new(),
            shared: Arc::clone(&shared),
            config,
        };
        tokio::spawn(reaper.run(rx));

        Self {
            commands,
            shared,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Launches a process and starts tracking it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProcessFailure`] if the process cannot be spawned or
    /// the supervisor has shut down.
    pub async fn spawn(&self, spec: LaunchSpec, policy: RestartPolicy) -> Result<ProcessId> {
        let id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = spec.name.clone();
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SupervisorCommand::Spawn {
                id,
                spec,
                policy,
                reply,
            })
            .map_err(|_| Error::process(&name, "supervisor is not running"))?;
        let pid = rx
            .await
            .map_err(|_| Error::process(&name, "supervisor is not running"))??;
        tracing::info!(process = %name, %id, pid, ?policy, "Started process");
        Ok(id)
    }

    /// Stops a process: SIGTERM, then SIGKILL after the grace period.
    ///
    /// Stopping an unknown or already exited process only forgets it.
    pub async fn stop(&self, id: ProcessId) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(SupervisorCommand::Stop { id, reply })
            .is_ok()
        {
            let _ = rx.await;
        }
        self.shared.status.remove(&id);
    }

    /// Stops every tracked process and ends the reaper task.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(SupervisorCommand::Shutdown { reply })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Returns `true` if the process is currently running.
    #[must_use]
    pub fn is_alive(&self, id: ProcessId) -> bool {
        self.state(id) == Some(ProcessState::Running)
    }

    /// Current state of a tracked process.
    #[must_use]
    pub fn state(&self, id: ProcessId) -> Option<ProcessState> {
        self.shared.status.get(&id).map(|info| info.state)
    }

    /// Snapshot of a tracked process.
    #[must_use]
    pub fn info(&self, id: ProcessId) -> Option<ProcessInfo> {
        self.shared.status.get(&id).map(|info| info.clone())
    }

    /// Snapshot of every tracked process.
    #[must_use]
    pub fn list(&self) -> Vec<(ProcessId, ProcessInfo)> {
        let mut all: Vec<_> = self
            .shared
            .status
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    /// Subscribes to exit events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ExitEvent> {
        self.shared.events.subscribe()
    }
}

enum ChildState {
    Running(Child),
    Backoff { until: Instant },
}

struct Tracked {
    spec: LaunchSpec,
    policy: RestartPolicy,
    state: ChildState,
    restarts: u32,
}

enum ReapAction {
    Nothing,
    Exited(Option<i32>),
    Relaunch,
}

struct Reaper {
    children: HashMap<ProcessId, Tracked>,
    shared: Arc<Shared>,
    config: SupervisorConfig,
}

impl Reaper {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SupervisorCommand>) {
        let mut tick = tokio::time::interval(self.config.reap_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        #[cfg(unix)]
        let mut sigchld =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::child()).ok();

        loop {
            #[cfg(unix)]
            let child_signal = async {
                match sigchld.as_mut() {
                    Some(signal) => {
                        signal.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            #[cfg(not(unix))]
            let child_signal = std::future::pending::<()>();

            tokio::select! {
                command = rx.recv() => match command {
                    Some(SupervisorCommand::Spawn { id, spec, policy, reply }) => {
                        let _ = reply.send(self.spawn(id, spec, policy));
                    }
                    Some(SupervisorCommand::Stop { id, reply }) => self.stop(id, reply),
                    Some(SupervisorCommand::Shutdown { reply }) => {
                        self.stop_all().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.stop_all().await;
                        break;
                    }
                },
                _ = tick.tick() => {}
                () = child_signal => {}
            }
            self.reap();
        }
        tracing::debug!("Supervisor stopped");
    }

    fn spawn(&mut self, id: ProcessId, spec: LaunchSpec, policy: RestartPolicy) -> Result<u32> {
        let child = spec
            .launch()
            .map_err(|e| Error::process(&spec.name, format!("failed to spawn {}: {e}", spec.program)))?;
        let pid = child.id().unwrap_or_default();
        self.shared.status.insert(
            id,
            ProcessInfo {
                name: spec.name.clone(),
                pid: child.id(),
                state: ProcessState::Running,
                policy,
                restarts: 0,
            },
        );
        self.children.insert(
            id,
            Tracked {
                spec,
                policy,
                state: ChildState::Running(child),
                restarts: 0,
            },
        );
        Ok(pid)
    }

    fn stop(&mut self, id: ProcessId, reply: oneshot::Sender<()>) {
        let tracked = self.children.remove(&id);
        let grace = self.config.stop_grace;
        tokio::spawn(async move {
            if let Some(Tracked {
                spec,
                state: ChildState::Running(child),
                ..
            }) = tracked
            {
                terminate(&spec.name, child, grace).await;
            }
            let _ = reply.send(());
        });
    }

    async fn stop_all(&mut self) {
        let grace = self.config.stop_grace;
        let running: Vec<_> = self
            .children
            .drain()
            .filter_map(|(_, tracked)| match tracked.state {
                ChildState::Running(child) => Some((tracked.spec.name, child)),
                ChildState::Backoff { .. } => None,
            })
            .collect();
        tracing::info!(processes = running.len(), "Stopping all supervised processes");
        futures::future::join_all(
            running
                .into_iter()
                .map(|(name, child)| async move { terminate(&name, child, grace).await }),
        )
        .await;
        self.shared.status.clear();
    }

    fn reap(&mut self) {
        let now = Instant::now();
        let mut finished = Vec::new();

        for (id, tracked) in &mut self.children {
            let action = match &mut tracked.state {
                ChildState::Running(child) => match child.try_wait() {
                    Ok(Some(status)) => ReapAction::Exited(status.code()),
                    Ok(None) => ReapAction::Nothing,
                    Err(e) => {
                        tracing::warn!(process = %tracked.spec.name, error = %e, "Failed to poll process");
                        ReapAction::Nothing
                    }
                },
                ChildState::Backoff { until } if now >= *until => ReapAction::Relaunch,
                ChildState::Backoff { .. } => ReapAction::Nothing,
            };

            match action {
                ReapAction::Nothing => {}
                ReapAction::Exited(code) => {
                    let restarting = tracked.policy == RestartPolicy::Always;
                    let state = if restarting {
                        tracing::error!(
                            process = %tracked.spec.name,
                            %id,
                            ?code,
                            backoff_ms = self.config.restart_backoff.as_millis() as u64,
                            "Always-on process exited unexpectedly, restarting"
                        );
                        tracked.state = ChildState::Backoff {
                            until: now + self.config.restart_backoff,
                        };
                        ProcessState::Restarting
                    } else {
                        tracing::warn!(process = %tracked.spec.name, %id, ?code, "Process exited");
                        finished.push(*id);
                        ProcessState::Exited(code)
                    };
                    if let Some(mut info) = self.shared.status.get_mut(id) {
                        info.state = state;
                        info.pid = None;
                    }
                    let _ = self.shared.events.send(ExitEvent {
                        id: *id,
                        name: tracked.spec.name.clone(),
                        code,
                        restarting,
                    });
                }
                ReapAction::Relaunch => match tracked.spec.launch() {
                    Ok(child) => {
                        tracked.restarts += 1;
                        tracing::info!(
                            process = %tracked.spec.name,
                            %id,
                            pid = child.id(),
                            restarts = tracked.restarts,
                            "Relaunched process"
                        );
                        if let Some(mut info) = self.shared.status.get_mut(id) {
                            info.state = ProcessState::Running;
                            info.pid = child.id();
                            info.restarts = tracked.restarts;
                        }
                        tracked.state = ChildState::Running(child);
                    }
                    Err(e) => {
                        tracing::error!(process = %tracked.spec.name, error = %e, "Failed to relaunch process");
                        tracked.state = ChildState::Backoff {
                            until: now + self.config.restart_backoff,
                        };
                    }
                },
            }
        }

        for id in finished {
            self.children.remove(&id);
        }
    }
}

async fn terminate(name: &str, mut child: Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain syscall; the pid belongs to a child we have not reaped.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => tracing::info!(process = name, %status, "Process stopped"),
        Ok(Err(e)) => tracing::warn!(process = name, error = %e, "Failed to wait for process"),
        Err(_) => {
            tracing::warn!(process = name, grace_ms = grace.as_millis() as u64, "Process ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(process = name, error = %e, "Failed to kill process");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn fast() -> SupervisorConfig {
        SupervisorConfig {
            reap_interval: Duration::from_millis(20),
            restart_backoff: Duration::from_millis(50),
            stop_grace: Duration::from_secs(2),
        }
    }

    fn sh(name: &str, script: &str) -> LaunchSpec {
        LaunchSpec::new(name, "sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let supervisor = Supervisor::start(fast());
        let id = supervisor
            .spawn(sh("sleeper", "sleep 30"), RestartPolicy::Never)
            .await
            .unwrap();
        assert!(supervisor.is_alive(id));
        assert!(supervisor.info(id).unwrap().pid.is_some());

        supervisor.stop(id).await;
        assert!(!supervisor.is_alive(id));
        assert!(supervisor.state(id).is_none());

        // Stopping again is harmless.
        supervisor.stop(id).await;
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_process_failure() {
        let supervisor = Supervisor::start(fast());
        let err = supervisor
            .spawn(
                LaunchSpec::new("ghost", "/definitely/not/a/binary", vec![]),
                RestartPolicy::Never,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), vassago_core::ErrorKind::ProcessFailure);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_reported() {
        let supervisor = Supervisor::start(fast());
        let mut events = supervisor.subscribe();
        let id = supervisor
            .spawn(sh("crasher", "exit 3"), RestartPolicy::Never)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.code, Some(3));
        assert!(!event.restarting);
        assert_eq!(supervisor.state(id), Some(ProcessState::Exited(Some(3))));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_always_policy_relaunches() {
        let supervisor = Supervisor::start(fast());
        let id = supervisor
            .spawn(sh("flaky", "sleep 0.05; exit 1"), RestartPolicy::Always)
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while supervisor.info(id).map_or(0, |i| i.restarts) < 2 {
            assert!(Instant::now() < deadline, "process was not relaunched");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        supervisor.shutdown().await;
        assert!(supervisor.list().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let supervisor = Supervisor::start(fast());
        let a = supervisor
            .spawn(sh("a", "sleep 30"), RestartPolicy::Always)
            .await
            .unwrap();
        let b = supervisor
            .spawn(sh("b", "sleep 30"), RestartPolicy::Never)
            .await
            .unwrap();
        assert_eq!(supervisor.list().len(), 2);

        supervisor.shutdown().await;
        assert!(!supervisor.is_alive(a));
        assert!(!supervisor.is_alive(b));

        let err = supervisor
            .spawn(sh("late", "sleep 1"), RestartPolicy::Never)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), vassago_core::ErrorKind::ProcessFailure);
    }
}
