//! Control protocol: remote start/stop/restart/list over TCP.
//!
//! Framing is one JSON object per line. A client connects, writes one `Request`,
//! reads one `Response` and disconnects. Every connection is served on its own
//! task and calls straight into the `Supervisor`, so protocol commands go through
//! the same per-instance locks as signals and process exits.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::supervisor::{ProcessInfo, Supervisor};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Restarts wait for the old process to exit, which can take a full grace period.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);
/// How long the server waits for a client to finish its request line.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest request line the server reads.
const MAX_REQUEST: u64 = 64 * 1024;

/// Commands understood by the control server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    Start,
    Stop,
    StopAll,
    Restart,
    RestartAll,
    List,
    Status,
}

impl Command {
    fn needs_targets(self) -> bool {
        matches!(self, Command::Start | Command::Stop | Command::Restart)
    }

    fn as_str(self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::StopAll => "stop-all",
            Command::Restart => "restart",
            Command::RestartAll => "restart-all",
            Command::List => "list",
            Command::Status => "status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    pub message: String,
}

impl Response {
    fn ok(message: String) -> Self {
        Self { ok: true, message }
    }

    fn err(err: &Error) -> Self {
        Self {
            ok: false,
            message: err.to_string(),
        }
    }
}

/// Accepts connections until `cancel` fires.
pub async fn serve(listener: TcpListener, supervisor: Arc<Supervisor>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let supervisor = supervisor.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, supervisor).await {
                            tracing::debug!(%peer, error = %err, "control connection failed");
                        }
                    });
                }
                Err(err) => tracing::warn!(error = %err, "accept failed"),
            }
        }
    }
    tracing::debug!("control server stopped");
}

async fn handle_connection<S>(stream: S, supervisor: Arc<Supervisor>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read.take(MAX_REQUEST)).lines();
    let line = match tokio::time::timeout(REQUEST_TIMEOUT, lines.next_line()).await {
        Ok(line) => line?,
        Err(_) => {
            tracing::debug!("control client sent no request");
            return Ok(());
        }
    };
    let Some(line) = line else {
        return Ok(());
    };
    let response = match serde_json::from_str::<Request>(&line) {
        Ok(request) => {
            tracing::info!(command = request.command.as_str(), targets = ?request.targets, "control request");
            dispatch(&supervisor, request).await
        }
        Err(err) => Response::err(&Error::Protocol(err.to_string())),
    };
    let mut payload = serde_json::to_string(&response)?;
    payload.push('\n');
    write.write_all(payload.as_bytes()).await?;
    write.shutdown().await
}

/// Runs one request against the supervisor and formats the result.
pub async fn dispatch(supervisor: &Arc<Supervisor>, request: Request) -> Response {
    match execute(supervisor, request).await {
        Ok(message) => Response::ok(message),
        Err(err) => {
            tracing::debug!(label = err.as_label(), error = %err, "control request failed");
            Response::err(&err)
        }
    }
}

async fn execute(supervisor: &Arc<Supervisor>, request: Request) -> Result<String> {
    let Request { command, targets } = request;
    if command.needs_targets() {
        if targets.is_empty() {
            return Err(Error::Protocol(format!(
                "{} needs at least one process name",
                command.as_str()
            )));
        }
        // Reject unknown names before touching anything.
        let known = supervisor.list();
        if let Some(unknown) = targets
            .iter()
            .find(|name| !known.iter().any(|p| &p.name == *name))
        {
            return Err(Error::UnknownProcess(unknown.clone()));
        }
    }
    match command {
        Command::Start => {
            for name in &targets {
                supervisor.start(name).await?;
            }
            Ok(format!("started {}", targets.join(", ")))
        }
        Command::Stop => {
            for name in &targets {
                supervisor.stop(name).await?;
            }
            Ok(format!("stopping {}", targets.join(", ")))
        }
        Command::Restart => {
            for name in &targets {
                supervisor.restart(name).await?;
            }
            Ok(format!("restarted {}", targets.join(", ")))
        }
        Command::StopAll => {
            let stopped = supervisor.stop_all().await;
            if stopped.is_empty() {
                Ok("nothing to stop".to_string())
            } else {
                Ok(format!("stopping {}", stopped.join(", ")))
            }
        }
        Command::RestartAll => {
            let restarted = supervisor.restart_all().await?;
            Ok(format!("restarted {}", restarted.join(", ")))
        }
        Command::List => Ok(format_list(&supervisor.list())),
        Command::Status => Ok(format_status(&supervisor.list())),
    }
}

/// `name  state`, one line per process.
pub fn format_list(processes: &[ProcessInfo]) -> String {
    let width = name_width(processes);
    processes
        .iter()
        .map(|p| format!("{:<width$}  {}", p.name, p.state, width = width))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `*name  state  pid`; the marker is `*` for processes with a live child.
pub fn format_status(processes: &[ProcessInfo]) -> String {
    let width = name_width(processes);
    processes
        .iter()
        .map(|p| {
            let marker = if p.pid.is_some() { '*' } else { ' ' };
            let pid = p.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".into());
            format!(
                "{}{:<width$}  {:<8}  {}",
                marker,
                p.name,
                p.state.as_str(),
                pid,
                width = width
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn name_width(processes: &[ProcessInfo]) -> usize {
    processes.iter().map(|p| p.name.len()).max().unwrap_or(0)
}

/// Sends one request and waits for the answer.
pub async fn send(addr: &str, request: &Request) -> Result<Response> {
    let fail = |reason: String| Error::Communication {
        addr: addr.to_string(),
        reason,
    };
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| fail("connect timed out".into()))?
        .map_err(|err| fail(err.to_string()))?;
    let (read, mut write) = stream.into_split();

    let mut payload =
        serde_json::to_string(request).map_err(|err| Error::Protocol(err.to_string()))?;
    payload.push('\n');
    write
        .write_all(payload.as_bytes())
        .await
        .map_err(|err| fail(err.to_string()))?;

    let mut lines = BufReader::new(read).lines();
    let line = tokio::time::timeout(RESPONSE_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| fail("no response".into()))?
        .map_err(|err| fail(err.to_string()))?
        .ok_or_else(|| fail("connection closed without a response".into()))?;
    serde_json::from_str(&line).map_err(|err| Error::Protocol(err.to_string()))
}
