//! Data structures for tracking process state.
//!
//! This module defines the specification for a process (`ProcessSpec`), its lifecycle
//! state (`ProcessState`), and the runtime record (`Instance`) that the supervisor keeps
//! for every spec. Each instance owns its state behind a `watch` channel, so transitions
//! are totally ordered per instance and waiters are woken with the new value.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, Notify};

/// Specification for a process to be run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Unique name, as written in the Procfile.
    pub name: String,
    /// Shell command line; `$PORT`-style variables are expanded by the shell.
    pub cmdline: String,
    /// Index into the prefix color palette.
    pub color_index: usize,
    /// Value injected as `PORT`, if port assignment is enabled.
    pub port: Option<u16>,
}

/// The current lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// About to be spawned (initial state, and the first step of a restart).
    Starting,
    /// A child process is alive.
    Running,
    /// A stop was requested; waiting for the OS to report exit.
    Stopping,
    /// Exited cleanly, or was stopped by the supervisor.
    Stopped,
    /// Exited with a failure on its own, or could not be spawned.
    Failed,
}

impl ProcessState {
    /// Stopped and Failed are terminal until the next start.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
            ProcessState::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitResult {
    /// Exited with a status code.
    Code(i32),
    /// Terminated by a signal (no exit code available).
    Signal(Option<i32>),
    /// Never started, or waiting on it failed.
    Error(String),
}

impl ExitResult {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitResult::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            ExitResult::Signal(status.signal())
        }
        #[cfg(not(unix))]
        {
            ExitResult::Signal(None)
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitResult::Code(0))
    }
}

impl fmt::Display for ExitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitResult::Code(code) => write!(f, "exited with code {}", code),
            ExitResult::Signal(Some(sig)) => write!(f, "terminated by signal {}", sig),
            ExitResult::Signal(None) => write!(f, "terminated by signal"),
            ExitResult::Error(err) => write!(f, "failed: {}", err),
        }
    }
}

/// Handle on one live child, valid for a single run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub pid: u32,
    /// Wakes the monitor to kill the child outright.
    pub kill: Arc<Notify>,
}

/// Point-in-time view of an instance, published on every transition.
#[derive(Debug, Clone)]
pub struct Status {
    pub state: ProcessState,
    /// Present only while a child is alive (Starting/Running/Stopping).
    pub handle: Option<RunHandle>,
    /// Set on the transition into Stopped/Failed.
    pub exit: Option<ExitResult>,
    /// True iff the current stop was requested by the operator or supervisor.
    pub stopped_by_supervisor: bool,
    /// Number of times a child has been spawned for this instance.
    pub runs: u64,
}

impl Status {
    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|h| h.pid)
    }

    pub fn is_live(&self) -> bool {
        self.handle.is_some()
    }
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: ProcessState::Starting,
            handle: None,
            exit: None,
            stopped_by_supervisor: false,
            runs: 0,
        }
    }
}

/// Runtime record for one spec.
#[derive(Debug)]
pub struct Instance {
    pub spec: ProcessSpec,
    status: watch::Sender<Status>,
    /// Serializes start/stop/restart requests for this instance only.
    ops: Mutex<()>,
    /// Every distinct state published, in order.
    #[cfg(test)]
    history: std::sync::Mutex<Vec<ProcessState>>,
}

impl Instance {
    pub fn new(spec: ProcessSpec) -> Self {
        let (status, _) = watch::channel(Status::default());
        Self {
            spec,
            status,
            ops: Mutex::new(()),
            #[cfg(test)]
            history: std::sync::Mutex::new(vec![ProcessState::Starting]),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Consistent snapshot of the current status.
    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ProcessState {
        self.status.borrow().state
    }

    /// Applies a transition atomically and wakes every waiter.
    pub fn transition(&self, f: impl FnOnce(&mut Status)) {
        self.status.send_modify(f);
        #[cfg(test)]
        self.record();
    }

    /// Applies `f`, waking waiters only if it reports a change.
    pub fn transition_if<R>(&self, f: impl FnOnce(&mut Status) -> Option<R>) -> Option<R> {
        let mut out = None;
        self.status.send_if_modified(|status| {
            out = f(status);
            out.is_some()
        });
        #[cfg(test)]
        self.record();
        out
    }

    #[cfg(test)]
    fn record(&self) {
        let state = self.state();
        let mut history = self.history.lock().unwrap();
        if history.last() != Some(&state) {
            history.push(state);
        }
    }

    /// States published so far, with repeats collapsed.
    #[cfg(test)]
    pub fn history(&self) -> Vec<ProcessState> {
        self.history.lock().unwrap().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    /// Waits until no child is alive. After a stop has been issued this means the
    /// instance reached Stopped or Failed.
    pub async fn wait_exit(&self) -> Status {
        let mut rx = self.subscribe();
        let status = match rx.wait_for(|status| !status.is_live()).await {
            Ok(status) => status.clone(),
            // The sender lives as long as `self`.
            Err(_) => self.status(),
        };
        status
    }

    pub async fn lock_ops(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.ops.lock().await
    }
}
