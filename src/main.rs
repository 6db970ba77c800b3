//! Pitcrew: run and control the processes of a Procfile.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! merges them with the optional config file, and dispatches to `check`, `start`
//! (the supervisor) or `run` (a control protocol client).

mod config;
mod control;
mod error;
mod output;
mod process;
mod procfile;
mod signals;
mod supervisor;
mod sys;

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{CommandFactory, Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigLayer, Settings};
use crate::control::Request;
use crate::output::{Multiplexer, OutputOptions};
use crate::procfile::SpecSource;
use crate::signals::SignalRelay;
use crate::supervisor::{Policy, Supervisor};

const LOG_ENV: &str = "PITCREW_LOG";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "pitcrew",
    version,
    about = "Manage Procfile-based applications",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true,
    after_help = config::options_help()
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to a .pitcrew.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Proc file.
    #[arg(short = 'f', long, global = true)]
    procfile: Option<PathBuf>,
    /// Control server port.
    #[arg(short = 'p', long, global = true, env = "PITCREW_RPC_PORT")]
    port: Option<u16>,
    /// Start the control server.
    #[arg(long, global = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    rpc_server: Option<bool>,
    /// Address the control server binds to.
    #[arg(long, global = true, env = "PITCREW_RPC_ADDR")]
    rpc_addr: Option<String>,
    /// Control server the `run` client talks to (host:port).
    #[arg(long, global = true, env = "PITCREW_RPC_SERVER")]
    rpc_server_addr: Option<String>,
    /// Base directory.
    #[arg(long, global = true)]
    basedir: Option<PathBuf>,
    /// First port handed out as PORT.
    #[arg(short = 'b', long, global = true)]
    base_port: Option<u16>,
    /// Set PORT for each process.
    #[arg(long, global = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    set_ports: Option<bool>,
    /// Exit if a process quits with a nonzero code.
    #[arg(long, global = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    exit_on_error: Option<bool>,
    /// Exit once every process has stopped.
    #[arg(long, global = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    exit_on_stop: Option<bool>,
    /// Show timestamp in log.
    #[arg(long, global = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    logtime: Option<bool>,
    /// Colorize process names.
    #[arg(long, global = true, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    color: Option<bool>,
    /// Milliseconds to wait for a stop before killing.
    #[arg(long, global = true)]
    grace_ms: Option<u64>,
}

impl Cli {
    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            procfile: self.procfile.clone(),
            port: self.port,
            rpc_server: self.rpc_server,
            rpc_addr: self.rpc_addr.clone(),
            rpc_server_addr: self.rpc_server_addr.clone(),
            basedir: self.basedir.clone(),
            base_port: self.base_port,
            set_ports: self.set_ports,
            exit_on_error: self.exit_on_error,
            exit_on_stop: self.exit_on_stop,
            logtime: self.logtime,
            color: self.color,
            grace_ms: self.grace_ms,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Show help information.
    Help,
    /// Show version information.
    Version,
    /// Show entries in the Procfile.
    Check,
    /// Start the processes (all of them, or only the named ones).
    Start { names: Vec<String> },
    /// Send a command to a running pitcrew.
    Run {
        #[arg(value_enum)]
        command: control::Command,
        names: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let command = match &cli.command {
        None | Some(Commands::Help) => {
            Cli::command().print_help()?;
            println!();
            return Ok(());
        }
        Some(Commands::Version) => {
            println!("pitcrew {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(command) => command.clone(),
    };

    let settings = load_settings(&cli)?;
    if let Some(dir) = &settings.basedir {
        std::env::set_current_dir(dir)
            .with_context(|| format!("failed to change directory to {}", dir.display()))?;
    }

    match command {
        Commands::Check => check(&settings),
        Commands::Start { names } => start(settings, names).await,
        Commands::Run { command, names } => run(&settings, command, names).await,
        Commands::Help | Commands::Version => Ok(()),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let file = match config::find_config(cli.config.as_deref()) {
        Some(path) => config::load_config(&path)?,
        None => ConfigLayer::default(),
    };
    Ok(Settings::from(cli.layer().or(file)))
}

fn spec_source(settings: &Settings) -> SpecSource {
    SpecSource {
        path: settings.procfile.clone(),
        set_ports: settings.set_ports,
        base_port: settings.base_port,
    }
}

fn check(settings: &Settings) -> Result<()> {
    let specs = spec_source(settings).load()?;
    println!("{}", procfile::check_summary(&specs));
    Ok(())
}

async fn start(settings: Settings, names: Vec<String>) -> Result<()> {
    let source = spec_source(&settings);
    let specs = procfile::select(source.load()?, &names)?;

    let color = settings
        .color
        .unwrap_or_else(|| std::io::stdout().is_terminal());
    let output = Multiplexer::stdout(OutputOptions {
        logtime: settings.logtime,
        color,
    });
    let supervisor = Supervisor::new(
        Policy {
            exit_on_error: settings.exit_on_error,
            exit_on_stop: settings.exit_on_stop,
            grace: settings.grace,
        },
        output,
    );

    // Bind before spawning so a busy port fails without leaving children behind.
    let listener = if settings.rpc_server {
        let addr = settings.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind control server on {}", addr))?;
        tracing::info!(%addr, "control server listening");
        Some(listener)
    } else {
        None
    };

    supervisor
        .start_all(specs)
        .await
        .context("failed to start processes")?;

    let cancel = supervisor.cancel_token();
    let server = listener.map(|listener| {
        tokio::spawn(control::serve(
            listener,
            supervisor.clone(),
            cancel.clone(),
        ))
    });
    let relay = SignalRelay::new(supervisor.clone(), source, names).spawn();

    let result = supervisor.await_termination().await;
    supervisor.shutdown().await;
    cancel.cancel();
    let _ = relay.await;
    if let Some(server) = server {
        let _ = server.await;
    }
    result.map_err(Into::into)
}

async fn run(settings: &Settings, command: control::Command, names: Vec<String>) -> Result<()> {
    let request = Request {
        command,
        targets: names,
    };
    let response = control::send(&settings.client_addr(), &request).await?;
    if !response.ok {
        bail!("{}", response.message);
    }
    if !response.message.is_empty() {
        println!("{}", response.message);
    }
    Ok(())
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
