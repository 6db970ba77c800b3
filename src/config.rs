//! Configuration management for pitcrew.
//!
//! Settings come from three layers: command-line flags (and their environment
//! variables), an optional `.pitcrew.toml`, and the defaults declared in
//! [`OPTIONS`]. The table is the one place that names every option, its default
//! and its meaning; help text is rendered from it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// One documented option.
#[derive(Debug, Clone, Copy)]
pub struct OptionDoc {
    pub name: &'static str,
    pub default: &'static str,
    pub description: &'static str,
}

pub const DEFAULT_PROCFILE: &str = "Procfile";
pub const DEFAULT_RPC_PORT: u16 = 8555;
pub const DEFAULT_RPC_ADDR: &str = "0.0.0.0";
pub const DEFAULT_BASE_PORT: u16 = 5000;
pub const DEFAULT_GRACE_MS: u64 = 3000;
pub const DEFAULT_CONFIG_FILE: &str = ".pitcrew.toml";

/// Every setting, in the order shown in help output.
pub const OPTIONS: &[OptionDoc] = &[
    OptionDoc {
        name: "procfile",
        default: "Procfile",
        description: "proc file",
    },
    OptionDoc {
        name: "port",
        default: "8555",
        description: "control server port",
    },
    OptionDoc {
        name: "rpc_server",
        default: "true",
        description: "start the control server",
    },
    OptionDoc {
        name: "rpc_addr",
        default: "0.0.0.0",
        description: "address the control server binds to",
    },
    OptionDoc {
        name: "basedir",
        default: "",
        description: "base directory",
    },
    OptionDoc {
        name: "base_port",
        default: "5000",
        description: "first port handed out as PORT",
    },
    OptionDoc {
        name: "set_ports",
        default: "true",
        description: "false to avoid setting PORT for each process",
    },
    OptionDoc {
        name: "exit_on_error",
        default: "false",
        description: "exit if a process quits with a nonzero code",
    },
    OptionDoc {
        name: "exit_on_stop",
        default: "true",
        description: "exit once every process has stopped",
    },
    OptionDoc {
        name: "logtime",
        default: "true",
        description: "show timestamp in log",
    },
    OptionDoc {
        name: "color",
        default: "auto",
        description: "colorize process names (auto: only on a terminal)",
    },
    OptionDoc {
        name: "grace_ms",
        default: "3000",
        description: "milliseconds to wait for a stop before killing",
    },
];

/// Renders [`OPTIONS`] as the "config keys" section of `--help`.
pub fn options_help() -> String {
    let width = OPTIONS.iter().map(|o| o.name.len()).max().unwrap_or(0);
    let mut out = format!("Config keys ({}):\n", DEFAULT_CONFIG_FILE);
    for option in OPTIONS {
        let default = if option.default.is_empty() {
            String::new()
        } else {
            format!(" [default: {}]", option.default)
        };
        out.push_str(&format!(
            "  {:<width$}  {}{}\n",
            option.name,
            option.description,
            default,
            width = width
        ));
    }
    out
}

/// One layer of settings. Used both for the config file and for the flags
/// given on the command line; unset fields fall through to the next layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    pub procfile: Option<PathBuf>,
    pub port: Option<u16>,
    pub rpc_server: Option<bool>,
    pub rpc_addr: Option<String>,
    /// Client-side target (`host:port`); not a file setting.
    #[serde(skip)]
    pub rpc_server_addr: Option<String>,
    pub basedir: Option<PathBuf>,
    pub base_port: Option<u16>,
    pub set_ports: Option<bool>,
    pub exit_on_error: Option<bool>,
    pub exit_on_stop: Option<bool>,
    pub logtime: Option<bool>,
    pub color: Option<bool>,
    pub grace_ms: Option<u64>,
}

impl ConfigLayer {
    /// Fills every unset field of `self` from `lower`.
    pub fn or(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            procfile: self.procfile.or(lower.procfile),
            port: self.port.or(lower.port),
            rpc_server: self.rpc_server.or(lower.rpc_server),
            rpc_addr: self.rpc_addr.or(lower.rpc_addr),
            rpc_server_addr: self.rpc_server_addr.or(lower.rpc_server_addr),
            basedir: self.basedir.or(lower.basedir),
            base_port: self.base_port.or(lower.base_port),
            set_ports: self.set_ports.or(lower.set_ports),
            exit_on_error: self.exit_on_error.or(lower.exit_on_error),
            exit_on_stop: self.exit_on_stop.or(lower.exit_on_stop),
            logtime: self.logtime.or(lower.logtime),
            color: self.color.or(lower.color),
            grace_ms: self.grace_ms.or(lower.grace_ms),
        }
    }
}

/// Loads and parses a config file.
pub fn load_config(path: &Path) -> Result<ConfigLayer> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: ConfigLayer = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Returns the explicit config path, or the default file if it exists.
pub fn find_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let path = Path::new(DEFAULT_CONFIG_FILE);
    path.exists().then(|| path.to_path_buf())
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub procfile: PathBuf,
    pub port: u16,
    pub rpc_server: bool,
    pub rpc_addr: String,
    pub rpc_server_addr: Option<String>,
    pub basedir: Option<PathBuf>,
    pub base_port: u16,
    pub set_ports: bool,
    pub exit_on_error: bool,
    pub exit_on_stop: bool,
    pub logtime: bool,
    /// `None` means detect from the terminal.
    pub color: Option<bool>,
    pub grace: Duration,
}

impl From<ConfigLayer> for Settings {
    fn from(layer: ConfigLayer) -> Self {
        Self {
            procfile: layer
                .procfile
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PROCFILE)),
            port: layer.port.unwrap_or(DEFAULT_RPC_PORT),
            rpc_server: layer.rpc_server.unwrap_or(true),
            rpc_addr: layer
                .rpc_addr
                .unwrap_or_else(|| DEFAULT_RPC_ADDR.to_string()),
            rpc_server_addr: layer.rpc_server_addr,
            basedir: layer.basedir.filter(|dir| !dir.as_os_str().is_empty()),
            base_port: layer.base_port.unwrap_or(DEFAULT_BASE_PORT),
            set_ports: layer.set_ports.unwrap_or(true),
            exit_on_error: layer.exit_on_error.unwrap_or(false),
            exit_on_stop: layer.exit_on_stop.unwrap_or(true),
            logtime: layer.logtime.unwrap_or(true),
            color: layer.color,
            grace: Duration::from_millis(layer.grace_ms.unwrap_or(DEFAULT_GRACE_MS)),
        }
    }
}

impl Settings {
    /// Address the control server listens on.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.rpc_addr, self.port)
    }

    /// Address the `run` client connects to.
    pub fn client_addr(&self) -> String {
        self.rpc_server_addr
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{}", self.port))
    }
}
