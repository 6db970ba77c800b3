//! Process lifecycle supervision.
//!
//! The `Supervisor` owns the registry of instances and is the single place where
//! process exits, host signals and control commands turn into state transitions.
//! Every child gets one monitor task that waits for the OS to report its exit,
//! records the result and applies the exit-on-error policy.
//!
//! Locking: the registry lock guards only which instances exist and is never held
//! across an await. Each instance serializes start/stop/restart through its own
//! ops lock, and publishes state through its own `watch` channel, so unrelated
//! processes never contend.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::output::{self, Multiplexer, StreamKind};
use crate::process::{ExitResult, Instance, ProcessSpec, ProcessState, RunHandle};
use crate::sys;

/// How long an exit waits for the output readers to hit EOF. A grandchild that
/// keeps the pipe open must not hold the exit hostage.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// Group-level policies.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    /// A process failing on its own stops the whole group.
    pub exit_on_error: bool,
    /// Return from `await_termination` once every process is terminal.
    pub exit_on_stop: bool,
    /// How long a stopped process may take before it is killed.
    pub grace: Duration,
}

/// One row of `list`/`status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
}

/// What a reload changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

enum StopOutcome {
    Signaled(u32),
    AlreadyStopping,
    NotLive,
}

pub struct Supervisor {
    registry: Mutex<Vec<Arc<Instance>>>,
    policy: Policy,
    output: Multiplexer,
    /// Woken whenever an instance exits or a pending respawn completes.
    changed: Notify,
    /// First failure that triggered exit-on-error.
    fatal: Mutex<Option<(String, ExitResult)>>,
    /// Restarts and reloads in flight; the group is not "all stopped" while any run.
    pending: AtomicUsize,
    shutting_down: AtomicBool,
    reload_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

/// Keeps `pending` raised for the lifetime of a restart or reload.
struct PendingGuard<'a>(&'a Supervisor);

impl<'a> PendingGuard<'a> {
    fn new(supervisor: &'a Supervisor) -> Self {
        supervisor.pending.fetch_add(1, Ordering::SeqCst);
        Self(supervisor)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::SeqCst);
        self.0.changed.notify_waiters();
    }
}

impl Supervisor {
    pub fn new(policy: Policy, output: Multiplexer) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Vec::new()),
            policy,
            output,
            changed: Notify::new(),
            fatal: Mutex::new(None),
            pending: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            reload_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        })
    }

    /// Token canceled when the supervisor is done; collaborators stop on it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn instances(&self) -> Vec<Arc<Instance>> {
        lock(&self.registry).clone()
    }

    fn find(&self, name: &str) -> Result<Arc<Instance>> {
        lock(&self.registry)
            .iter()
            .find(|instance| instance.name() == name)
            .cloned()
            .ok_or_else(|| Error::UnknownProcess(name.to_string()))
    }

    /// Registers one instance per spec and spawns them all.
    ///
    /// Startup is all-or-nothing: if any spawn fails, the ones already running are
    /// stopped, the rest are marked failed, and the spawn error is returned.
    pub async fn start_all(self: &Arc<Self>, specs: Vec<ProcessSpec>) -> Result<()> {
        if specs.is_empty() {
            return Err(Error::EmptySpec);
        }
        self.output.fit_names(&specs);
        let instances: Vec<Arc<Instance>> = specs
            .into_iter()
            .map(|spec| Arc::new(Instance::new(spec)))
            .collect();
        *lock(&self.registry) = instances.clone();

        for (idx, instance) in instances.iter().enumerate() {
            let spawned = {
                let _ops = instance.lock_ops().await;
                self.spawn_locked(instance)
            };
            if let Err(err) = spawned {
                tracing::error!(process = %instance.name(), error = %err, "startup aborted");
                for rest in &instances[idx + 1..] {
                    rest.transition(|s| {
                        s.state = ProcessState::Failed;
                        s.exit = Some(ExitResult::Error("startup aborted".to_string()));
                    });
                }
                self.shutdown().await;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Spawns a fresh child for `instance`. Caller holds the instance's ops lock
    /// and has made sure no child is alive.
    fn spawn_locked(self: &Arc<Self>, instance: &Arc<Instance>) -> Result<()> {
        let spec = &instance.spec;
        if self.shutting_down.load(Ordering::SeqCst) {
            instance.transition_if(|s| {
                (s.state == ProcessState::Starting).then(|| {
                    s.state = ProcessState::Stopped;
                    s.exit = Some(ExitResult::Error("not started".to_string()));
                })
            });
            return Err(Error::ShuttingDown(spec.name.clone()));
        }
        instance.transition(|s| {
            s.state = ProcessState::Starting;
            s.exit = None;
            s.stopped_by_supervisor = false;
        });
        match spec.port {
            Some(port) => self
                .output
                .system(spec, &format!("starting {} on port {}", spec.name, port)),
            None => self.output.system(spec, &format!("starting {}", spec.name)),
        }

        let mut child = match sys::command(spec).spawn() {
            Ok(child) => child,
            Err(source) => {
                let reason = source.to_string();
                self.output
                    .system(spec, &format!("failed to start: {}", reason));
                instance.transition(|s| {
                    s.state = ProcessState::Failed;
                    s.exit = Some(ExitResult::Error(reason));
                });
                self.changed.notify_waiters();
                return Err(Error::Spawn {
                    name: spec.name.clone(),
                    source,
                });
            }
        };
        let pid = child.id().unwrap_or(0);

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(output::pump(
                stdout,
                StreamKind::Stdout,
                spec.clone(),
                self.output.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(output::pump(
                stderr,
                StreamKind::Stderr,
                spec.clone(),
                self.output.clone(),
            )));
        }

        let kill = Arc::new(Notify::new());
        let mut run = 0;
        instance.transition(|s| {
            s.state = ProcessState::Running;
            s.handle = Some(RunHandle {
                pid,
                kill: kill.clone(),
            });
            s.runs += 1;
            run = s.runs;
        });
        tracing::info!(process = %spec.name, pid, run, "spawned");
        tokio::spawn(
            self.clone()
                .monitor(instance.clone(), child, pid, kill, readers),
        );
        Ok(())
    }

    /// Waits for the child to exit, records the result, and applies policy.
    async fn monitor(
        self: Arc<Self>,
        instance: Arc<Instance>,
        mut child: Child,
        pid: u32,
        kill: Arc<Notify>,
        readers: Vec<JoinHandle<()>>,
    ) {
        let exit = loop {
            tokio::select! {
                status = child.wait() => {
                    break match status {
                        Ok(status) => ExitResult::from_status(status),
                        Err(err) => ExitResult::Error(err.to_string()),
                    };
                }
                _ = kill.notified() => {
                    sys::kill(pid);
                    let _ = child.start_kill();
                }
            }
        };
        // The exit is recorded the moment the child is reaped; only the exit
        // line waits for the readers. The guard keeps the group unsettled until then.
        let _draining = PendingGuard::new(&self);
        let mut state = ProcessState::Stopped;
        instance.transition(|s| {
            // Supervisor-initiated stops never count as failures, whatever the code.
            s.state = if s.stopped_by_supervisor || exit.success() {
                ProcessState::Stopped
            } else {
                ProcessState::Failed
            };
            s.exit = Some(exit.clone());
            s.handle = None;
            state = s.state;
        });
        tracing::info!(process = %instance.name(), pid, %exit, %state, "exited");

        if state == ProcessState::Failed && self.policy.exit_on_error {
            {
                let mut fatal = lock(&self.fatal);
                if fatal.is_none() {
                    *fatal = Some((instance.name().to_string(), exit.clone()));
                }
            }
            tracing::warn!(process = %instance.name(), "failure stops the group");
            let supervisor = self.clone();
            tokio::spawn(async move {
                supervisor.stop_all().await;
            });
        }

        let drain = async {
            for reader in readers {
                let _ = reader.await;
            }
        };
        let _ = tokio::time::timeout(OUTPUT_DRAIN, drain).await;
        self.output.system(&instance.spec, &exit.to_string());
    }

    /// Spawns `name` if it has no live child.
    pub async fn start(self: &Arc<Self>, name: &str) -> Result<()> {
        let instance = self.find(name)?;
        let _ops = instance.lock_ops().await;
        if instance.status().is_live() {
            return Err(Error::AlreadyRunning(name.to_string()));
        }
        self.spawn_locked(&instance)
    }

    /// Requests a graceful stop of `name`; does not wait for the exit.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let instance = self.find(name)?;
        let _ops = instance.lock_ops().await;
        self.stop_locked(&instance)
    }

    /// Stops every live instance in registry order and returns their names.
    pub async fn stop_all(&self) -> Vec<String> {
        let mut stopped = Vec::new();
        for instance in self.instances() {
            let _ops = instance.lock_ops().await;
            match self.stop_locked(&instance) {
                Ok(()) => stopped.push(instance.name().to_string()),
                Err(Error::NotRunning(_)) => {}
                Err(err) => tracing::warn!(process = %instance.name(), error = %err, "stop failed"),
            }
        }
        stopped
    }

    fn stop_locked(&self, instance: &Instance) -> Result<()> {
        let mut outcome = StopOutcome::NotLive;
        instance.transition_if(|s| match (s.state, s.pid()) {
            (ProcessState::Stopping, _) => {
                outcome = StopOutcome::AlreadyStopping;
                None
            }
            (_, Some(pid)) => {
                // The flag must be visible before the signal goes out, or the
                // monitor could classify the exit as a crash.
                s.stopped_by_supervisor = true;
                s.state = ProcessState::Stopping;
                outcome = StopOutcome::Signaled(pid);
                Some(())
            }
            (_, None) => None,
        });
        match outcome {
            StopOutcome::Signaled(pid) => {
                self.output.system(&instance.spec, "terminating");
                tracing::debug!(process = %instance.name(), pid, "sent terminate");
                sys::terminate(pid);
                Ok(())
            }
            StopOutcome::AlreadyStopping => Ok(()),
            StopOutcome::NotLive => Err(Error::NotRunning(instance.name().to_string())),
        }
    }

    /// Stops `instance` (if live) and waits for the exit, killing it after the grace
    /// period. Caller holds the ops lock.
    async fn stop_and_wait_locked(&self, instance: &Instance) {
        if self.stop_locked(instance).is_err() {
            return;
        }
        self.await_exit(instance).await;
    }

    async fn await_exit(&self, instance: &Instance) {
        if tokio::time::timeout(self.policy.grace, instance.wait_exit())
            .await
            .is_err()
        {
            self.force_kill(instance);
            instance.wait_exit().await;
        }
    }

    fn force_kill(&self, instance: &Instance) {
        if let Some(handle) = instance.status().handle {
            self.output.system(&instance.spec, "killing");
            tracing::warn!(process = %instance.name(), pid = handle.pid, "grace period expired");
            handle.kill.notify_one();
        }
    }

    /// Stops `name`, waits until its old child is gone, then spawns a new one.
    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<()> {
        let instance = self.find(name)?;
        self.restart_instance(&instance).await
    }

    async fn restart_instance(self: &Arc<Self>, instance: &Arc<Instance>) -> Result<()> {
        let _pending = PendingGuard::new(self);
        let _ops = instance.lock_ops().await;
        self.stop_and_wait_locked(instance).await;
        self.spawn_locked(instance)
    }

    /// Restarts every instance concurrently and returns their names.
    pub async fn restart_all(self: &Arc<Self>) -> Result<Vec<String>> {
        let _pending = PendingGuard::new(self);
        let mut set = JoinSet::new();
        let instances = self.instances();
        for instance in &instances {
            let supervisor = self.clone();
            let instance = instance.clone();
            set.spawn(async move { supervisor.restart_instance(&instance).await });
        }
        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_err.get_or_insert(err);
                }
                Err(err) => tracing::error!(error = %err, "restart task panicked"),
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(instances.iter().map(|i| i.name().to_string()).collect()),
        }
    }

    /// Snapshot of every instance in registry order.
    pub fn list(&self) -> Vec<ProcessInfo> {
        self.instances()
            .iter()
            .map(|instance| {
                let status = instance.status();
                ProcessInfo {
                    name: instance.name().to_string(),
                    state: status.state,
                    pid: status.pid(),
                }
            })
            .collect()
    }

    fn all_terminal(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
            && self
                .instances()
                .iter()
                .all(|instance| instance.state().is_terminal())
    }

    fn fatal_error(&self) -> Option<Error> {
        lock(&self.fatal)
            .clone()
            .map(|(name, exit)| Error::ProcessFailed { name, exit })
    }

    /// Blocks until every instance is terminal (with exit-on-stop), a failure
    /// fires exit-on-error, or the supervisor is canceled.
    pub async fn await_termination(&self) -> Result<()> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(err) = self.fatal_error() {
                return Err(err);
            }
            if self.policy.exit_on_stop && self.all_terminal() {
                return Ok(());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.cancel.cancelled() => {
                    return match self.fatal_error() {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
            }
        }
    }

    /// Graceful group shutdown: stop everything, wait up to the grace period,
    /// then kill whatever is left. No new process starts afterwards.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.stop_all().await;
        let instances = self.instances();
        let all_exited = async {
            for instance in &instances {
                instance.wait_exit().await;
            }
        };
        if tokio::time::timeout(self.policy.grace, all_exited)
            .await
            .is_err()
        {
            self.kill_all();
            for instance in &instances {
                instance.wait_exit().await;
            }
        }
        self.settle().await;
    }

    /// Waits until no exit, restart or reload is still in flight.
    async fn settle(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Kills every live child immediately.
    pub fn kill_all(&self) {
        for instance in self.instances() {
            self.force_kill(&instance);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Applies a re-read Procfile: removed entries are stopped, entries whose
    /// command or port changed are respawned, new entries are started, and
    /// unchanged entries keep running untouched.
    pub async fn reload(self: &Arc<Self>, specs: Vec<ProcessSpec>) -> Result<ReloadSummary> {
        if specs.is_empty() {
            return Err(Error::EmptySpec);
        }
        let _reload = self.reload_lock.lock().await;
        let _pending = PendingGuard::new(self);
        let mut summary = ReloadSummary::default();
        if self.is_shutting_down() {
            return Ok(summary);
        }

        let current = self.instances();
        let mut next = Vec::with_capacity(specs.len());
        let mut retired = Vec::new();
        let mut fresh = Vec::new();
        for spec in &specs {
            match current.iter().find(|i| i.spec.name == spec.name) {
                Some(existing)
                    if existing.spec.cmdline == spec.cmdline && existing.spec.port == spec.port =>
                {
                    next.push(existing.clone());
                }
                Some(existing) => {
                    summary.changed.push(spec.name.clone());
                    retired.push(existing.clone());
                    let instance = Arc::new(Instance::new(spec.clone()));
                    fresh.push(instance.clone());
                    next.push(instance);
                }
                None => {
                    summary.added.push(spec.name.clone());
                    let instance = Arc::new(Instance::new(spec.clone()));
                    fresh.push(instance.clone());
                    next.push(instance);
                }
            }
        }
        for instance in &current {
            if !specs.iter().any(|spec| spec.name == instance.spec.name) {
                summary.removed.push(instance.name().to_string());
                retired.push(instance.clone());
            }
        }

        for instance in &retired {
            let _ops = instance.lock_ops().await;
            self.stop_and_wait_locked(instance).await;
        }
        self.output.fit_names(&specs);
        *lock(&self.registry) = next;

        for instance in &fresh {
            let _ops = instance.lock_ops().await;
            if let Err(err) = self.spawn_locked(instance) {
                tracing::warn!(process = %instance.name(), error = %err, "reload could not start process");
            }
        }
        tracing::info!(?summary, "reloaded");
        Ok(summary)
    }
}

/// Locks a std mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::output::{MemorySink, OutputOptions};
    use crate::process::Status;

    const WAIT: Duration = Duration::from_secs(10);

    fn spec(name: &str, cmdline: &str, color_index: usize) -> ProcessSpec {
        ProcessSpec {
            name: name.to_string(),
            cmdline: cmdline.to_string(),
            color_index,
            port: None,
        }
    }

    fn policy() -> Policy {
        Policy {
            exit_on_error: false,
            exit_on_stop: true,
            grace: Duration::from_millis(500),
        }
    }

    fn supervisor(policy: Policy) -> (Arc<Supervisor>, MemorySink) {
        let sink = MemorySink::default();
        let mux = Multiplexer::new(
            Box::new(sink.clone()),
            OutputOptions {
                logtime: false,
                color: false,
            },
        );
        (Supervisor::new(policy, mux), sink)
    }

    fn web_and_worker() -> Vec<ProcessSpec> {
        vec![
            spec("web", "sleep 100", 0),
            spec("worker", "sleep 100", 1),
        ]
    }

    async fn wait_for_state(sup: &Supervisor, name: &str, state: ProcessState) -> Status {
        let instance = sup.find(name).unwrap();
        let mut rx = instance.subscribe();
        let status = tokio::time::timeout(WAIT, rx.wait_for(|s| s.state == state))
            .await
            .expect("timed out waiting for state")
            .unwrap()
            .clone();
        status
    }

    async fn wait_for_line(sink: &MemorySink, line: &str) {
        let seen = async {
            while !sink.lines().iter().any(|l| l == line) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(WAIT, seen)
            .await
            .unwrap_or_else(|_| panic!("never saw {:?}", line));
    }

    fn alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[tokio::test]
    async fn start_all_runs_everything_in_order() {
        let (sup, _sink) = supervisor(policy());
        sup.start_all(web_and_worker()).await.unwrap();
        let list = sup.list();
        assert_eq!(
            list.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            vec!["web", "worker"]
        );
        assert!(list
            .iter()
            .all(|p| p.state == ProcessState::Running && p.pid.is_some()));
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn empty_spec_list_is_rejected() {
        let (sup, _sink) = supervisor(policy());
        assert!(matches!(sup.start_all(Vec::new()).await, Err(Error::EmptySpec)));
    }

    #[tokio::test]
    async fn spawn_failure_aborts_the_whole_group() {
        let (sup, _sink) = supervisor(policy());
        let specs = vec![
            spec("web", "sleep 100", 0),
            spec("broken", "sleep 1\0", 1),
            spec("worker", "sleep 100", 2),
        ];
        let err = sup.start_all(specs).await.unwrap_err();
        assert!(matches!(err, Error::Spawn { ref name, .. } if name == "broken"));
        let list = sup.list();
        assert!(list.iter().all(|p| p.state != ProcessState::Running));
        assert_eq!(list[0].state, ProcessState::Stopped);
        assert_eq!(list[1].state, ProcessState::Failed);
        assert_eq!(list[2].state, ProcessState::Failed);
    }

    #[tokio::test]
    async fn restart_replaces_handle_and_leaves_others_alone() {
        let (sup, _sink) = supervisor(policy());
        sup.start_all(web_and_worker()).await.unwrap();
        let before = sup.list();
        let old_web = before[0].pid.unwrap();
        let worker_pid = before[1].pid.unwrap();

        sup.restart("web").await.unwrap();

        let after = sup.list();
        let new_web = after[0].pid.unwrap();
        assert_ne!(old_web, new_web);
        assert!(!alive(old_web));
        assert_eq!(after[0].state, ProcessState::Running);
        assert_eq!(after[1].state, ProcessState::Running);
        assert_eq!(after[1].pid, Some(worker_pid));
        let web = sup.find("web").unwrap().status();
        assert_eq!(web.runs, 2);
        assert!(!web.stopped_by_supervisor);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn supervisor_stop_is_never_a_failure() {
        let (sup, sink) = supervisor(policy());
        let specs = vec![spec(
            "web",
            "trap 'exit 3' TERM; echo ready; while true; do sleep 0.1; done",
            0,
        )];
        sup.start_all(specs).await.unwrap();
        wait_for_line(&sink, "web | ready").await;
        sup.stop("web").await.unwrap();
        assert_eq!(sup.find("web").unwrap().state(), ProcessState::Stopping);
        let status = wait_for_state(&sup, "web", ProcessState::Stopped).await;
        assert!(status.stopped_by_supervisor);
        assert!(matches!(
            status.exit,
            Some(ExitResult::Code(3)) | Some(ExitResult::Signal(_))
        ));
        assert!(sup.await_termination().await.is_ok());
    }

    #[tokio::test]
    async fn stop_reports_not_running_and_unknown() {
        let (sup, _sink) = supervisor(policy());
        sup.start_all(vec![spec("web", "exit 0", 0)]).await.unwrap();
        wait_for_state(&sup, "web", ProcessState::Stopped).await;
        assert!(matches!(sup.stop("web").await, Err(Error::NotRunning(_))));
        assert!(matches!(sup.stop("db").await, Err(Error::UnknownProcess(_))));
        assert!(matches!(sup.restart("db").await, Err(Error::UnknownProcess(_))));
    }

    #[tokio::test]
    async fn start_rejects_live_instance() {
        let (sup, _sink) = supervisor(Policy {
            exit_on_stop: false,
            ..policy()
        });
        sup.start_all(web_and_worker()).await.unwrap();
        assert!(matches!(sup.start("web").await, Err(Error::AlreadyRunning(_))));
        sup.stop("web").await.unwrap();
        wait_for_state(&sup, "web", ProcessState::Stopped).await;
        sup.start("web").await.unwrap();
        assert_eq!(sup.find("web").unwrap().state(), ProcessState::Running);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn crash_without_policy_leaves_others_running() {
        let (sup, _sink) = supervisor(policy());
        sup.start_all(vec![
            spec("web", "sleep 0.2; exit 1", 0),
            spec("worker", "sleep 100", 1),
        ])
        .await
        .unwrap();
        let web = wait_for_state(&sup, "web", ProcessState::Failed).await;
        assert_eq!(web.exit, Some(ExitResult::Code(1)));
        assert!(!web.stopped_by_supervisor);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sup.find("worker").unwrap().state(), ProcessState::Running);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn exit_on_error_brings_down_the_group() {
        let (sup, _sink) = supervisor(Policy {
            exit_on_error: true,
            ..policy()
        });
        sup.start_all(vec![
            spec("web", "sleep 0.2; exit 1", 0),
            spec("worker", "sleep 100", 1),
            spec("clock", "sleep 100", 2),
        ])
        .await
        .unwrap();
        let err = tokio::time::timeout(WAIT, sup.await_termination())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::ProcessFailed { ref name, .. } if name == "web"));
        let worker = wait_for_state(&sup, "worker", ProcessState::Stopped).await;
        assert!(worker.stopped_by_supervisor);
        wait_for_state(&sup, "clock", ProcessState::Stopped).await;
        assert_eq!(sup.find("web").unwrap().state(), ProcessState::Failed);
    }

    #[tokio::test]
    async fn exit_on_stop_returns_when_all_finish() {
        let (sup, sink) = supervisor(policy());
        sup.start_all(vec![
            spec("one", "echo hello", 0),
            spec("two", "exit 0", 1),
        ])
        .await
        .unwrap();
        tokio::time::timeout(WAIT, sup.await_termination())
            .await
            .unwrap()
            .unwrap();
        let lines = sink.lines();
        assert!(lines.contains(&"one | hello".to_string()));
        assert!(lines.contains(&"two | exited with code 0".to_string()));
    }

    #[tokio::test]
    async fn restart_does_not_trip_exit_on_stop() {
        let (sup, _sink) = supervisor(policy());
        sup.start_all(vec![spec("web", "sleep 100", 0)]).await.unwrap();
        let waiter = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.await_termination().await })
        };
        sup.restart("web").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());
        sup.stop("web").await.unwrap();
        tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_kills_after_grace() {
        let (sup, sink) = supervisor(Policy {
            grace: Duration::from_millis(200),
            ..policy()
        });
        sup.start_all(vec![
            spec(
                "stubborn",
                "trap '' TERM; echo ready; while true; do sleep 0.1; done",
                0,
            ),
            spec("worker", "sleep 100", 1),
        ])
        .await
        .unwrap();
        wait_for_line(&sink, "stubborn | ready").await;
        tokio::time::timeout(WAIT, sup.shutdown()).await.unwrap();
        let list = sup.list();
        assert!(list.iter().all(|p| p.state == ProcessState::Stopped));
        assert!(sink.lines().contains(&"stubborn | killing".to_string()));
        assert!(matches!(sup.start("worker").await, Err(Error::ShuttingDown(_))));
    }

    #[tokio::test]
    async fn restart_walks_through_every_state() {
        let (sup, _sink) = supervisor(policy());
        sup.start_all(vec![spec("web", "sleep 100", 0)]).await.unwrap();
        let web = sup.find("web").unwrap();
        assert_eq!(web.history(), vec![ProcessState::Starting, ProcessState::Running]);

        sup.restart("web").await.unwrap();

        assert_eq!(
            web.history(),
            vec![
                ProcessState::Starting,
                ProcessState::Running,
                ProcessState::Stopping,
                ProcessState::Stopped,
                ProcessState::Starting,
                ProcessState::Running,
            ]
        );
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn late_stop_cannot_claim_a_crash() {
        let (sup, sink) = supervisor(Policy {
            exit_on_error: true,
            ..policy()
        });
        // The background sleep holds the output pipe open past the exit.
        sup.start_all(vec![spec("web", "echo bye; sleep 2 & exit 1", 0)])
            .await
            .unwrap();
        wait_for_line(&sink, "web | bye").await;
        let web = sup.find("web").unwrap();
        let mut rx = web.subscribe();
        let failed = tokio::time::timeout(
            OUTPUT_DRAIN / 2,
            rx.wait_for(|s| s.state == ProcessState::Failed),
        )
        .await
        .is_ok();
        assert!(failed, "exit not recorded before output drained");

        assert!(matches!(sup.stop("web").await, Err(Error::NotRunning(_))));
        let status = web.status();
        assert_eq!(status.state, ProcessState::Failed);
        assert_eq!(status.exit, Some(ExitResult::Code(1)));
        assert!(!status.stopped_by_supervisor);
        let err = tokio::time::timeout(WAIT, sup.await_termination())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::ProcessFailed { ref name, .. } if name == "web"));
        wait_for_line(&sink, "web | exited with code 1").await;
    }

    #[tokio::test]
    async fn restart_all_gives_everyone_new_pids() {
        let (sup, _sink) = supervisor(policy());
        sup.start_all(web_and_worker()).await.unwrap();
        let before: Vec<_> = sup.list().iter().map(|p| p.pid).collect();
        let names = sup.restart_all().await.unwrap();
        assert_eq!(names, vec!["web", "worker"]);
        let after = sup.list();
        for (old, new) in before.iter().zip(&after) {
            assert_eq!(new.state, ProcessState::Running);
            assert_ne!(*old, new.pid);
        }
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn signal_and_stop_all_reach_the_same_states() {
        let (a, _) = supervisor(policy());
        let (b, _) = supervisor(policy());
        a.start_all(web_and_worker()).await.unwrap();
        b.start_all(web_and_worker()).await.unwrap();
        a.shutdown().await;
        b.stop_all().await;
        for name in ["web", "worker"] {
            wait_for_state(&b, name, ProcessState::Stopped).await;
        }
        let states = |sup: &Supervisor| sup.list().into_iter().map(|p| p.state).collect::<Vec<_>>();
        assert_eq!(states(&a), states(&b));
    }

    #[tokio::test]
    async fn reload_applies_a_diff() {
        let (sup, _sink) = supervisor(Policy {
            exit_on_stop: false,
            ..policy()
        });
        sup.start_all(vec![
            spec("web", "sleep 100", 0),
            spec("worker", "sleep 100", 1),
            spec("clock", "sleep 100", 2),
        ])
        .await
        .unwrap();
        let web_pid = sup.find("web").unwrap().status().pid();
        let clock = sup.find("clock").unwrap();

        let summary = sup
            .reload(vec![
                spec("web", "sleep 100", 0),
                spec("worker", "sleep 200", 1),
                spec("mail", "sleep 100", 2),
            ])
            .await
            .unwrap();
        assert_eq!(summary.added, vec!["mail"]);
        assert_eq!(summary.removed, vec!["clock"]);
        assert_eq!(summary.changed, vec!["worker"]);

        let list = sup.list();
        assert_eq!(
            list.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            vec!["web", "worker", "mail"]
        );
        assert_eq!(list[0].pid, web_pid);
        assert!(list.iter().all(|p| p.state == ProcessState::Running));
        assert_eq!(clock.state(), ProcessState::Stopped);
        sup.shutdown().await;
    }
}
