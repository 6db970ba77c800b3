//! Host signal relay.
//!
//! Translates OS signals into supervisor operations: interrupt and terminate
//! shut the group down (a second one kills what is left), hangup re-reads the
//! Procfile and applies the difference.

use std::sync::Arc;

use crate::procfile::{self, SpecSource};
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    Interrupt,
    Terminate,
    Hangup,
}

impl HostSignal {
    fn label(self) -> &'static str {
        match self {
            HostSignal::Interrupt => "SIGINT",
            HostSignal::Terminate => "SIGTERM",
            HostSignal::Hangup => "SIGHUP",
        }
    }
}

#[derive(Clone)]
pub struct SignalRelay {
    supervisor: Arc<Supervisor>,
    source: SpecSource,
    /// Subset given on the command line; reloads keep to it.
    names: Vec<String>,
}

impl SignalRelay {
    pub fn new(supervisor: Arc<Supervisor>, source: SpecSource, names: Vec<String>) -> Self {
        Self {
            supervisor,
            source,
            names,
        }
    }

    /// Listens until the supervisor is canceled. Each signal is handled on its own
    /// task so a second interrupt can arrive while a shutdown is in progress.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.listen().await })
    }

    #[cfg(unix)]
    async fn listen(self) {
        use tokio::signal::unix::{signal, SignalKind};

        let cancel = self.supervisor.cancel_token();
        let (mut sigint, mut sigterm, mut sighup) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        ) {
            (Ok(sigint), Ok(sigterm), Ok(sighup)) => (sigint, sigterm, sighup),
            _ => {
                tracing::warn!("could not install signal handlers");
                return;
            }
        };
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = sigint.recv() => HostSignal::Interrupt,
                Some(()) = sigterm.recv() => HostSignal::Terminate,
                Some(()) = sighup.recv() => HostSignal::Hangup,
                else => break,
            };
            tokio::spawn(self.clone().handle(received));
        }
    }

    #[cfg(not(unix))]
    async fn listen(self) {
        let cancel = self.supervisor.cancel_token();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = tokio::signal::ctrl_c() => {
                    if received.is_err() {
                        tracing::warn!("could not install ctrl-c handler");
                        break;
                    }
                    tokio::spawn(self.clone().handle(HostSignal::Interrupt));
                }
            }
        }
    }

    pub async fn handle(self, signal: HostSignal) {
        match signal {
            HostSignal::Interrupt | HostSignal::Terminate => {
                if self.supervisor.is_shutting_down() {
                    tracing::warn!(signal = signal.label(), "second interrupt, killing remaining processes");
                    self.supervisor.kill_all();
                    return;
                }
                tracing::info!(signal = signal.label(), "shutting down");
                self.supervisor.shutdown().await;
                self.supervisor.cancel_token().cancel();
            }
            HostSignal::Hangup => self.reload().await,
        }
    }

    async fn reload(&self) {
        let specs = match self
            .source
            .load()
            .and_then(|specs| procfile::select(specs, &self.names))
        {
            Ok(specs) => specs,
            Err(err) => {
                tracing::warn!(label = err.as_label(), error = %err, "reload skipped");
                return;
            }
        };
        match self.supervisor.reload(specs).await {
            Ok(summary) => tracing::info!(
                added = ?summary.added,
                removed = ?summary.removed,
                changed = ?summary.changed,
                "procfile reloaded"
            ),
            Err(err) => tracing::warn!(error = %err, "reload failed"),
        }
    }
}
