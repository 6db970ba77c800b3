//! Platform layer: building a child command and delivering signals to it.
//!
//! The supervisor only asks for "a command for this spec", "terminate pid" and
//! "kill pid"; everything OS-specific stays here.

use std::process::Stdio;

use tokio::process::Command;

use crate::process::ProcessSpec;

/// Environment variable carrying the assigned port.
pub const PORT_VAR: &str = "PORT";

/// Builds the shell command for `spec` with piped output and the parent
/// environment plus `PORT` when one is assigned.
pub fn command(spec: &ProcessSpec) -> Command {
    let mut command = shell_command(&spec.cmdline);
    if let Some(port) = spec.port {
        command.env(PORT_VAR, port.to_string());
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);
    command
}

#[cfg(unix)]
fn shell_command(cmdline: &str) -> Command {
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(cmdline);
    // Own process group: terminal Ctrl-C reaches only the supervisor, and
    // signals can be sent to the whole tree.
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }
    command
}

#[cfg(windows)]
fn shell_command(cmdline: &str) -> Command {
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
    let mut command = Command::new("cmd");
    command.arg("/C").arg(windows_vars(cmdline));
    command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    command
}

/// Rewrites `$NAME` references into `%NAME%` for cmd.exe.
#[cfg(any(windows, test))]
fn windows_vars(cmdline: &str) -> String {
    use std::sync::OnceLock;

    use regex::Regex;

    static VAR: OnceLock<Option<Regex>> = OnceLock::new();
    match VAR.get_or_init(|| Regex::new(r"\$([a-zA-Z]+[a-zA-Z0-9_]+)").ok()) {
        Some(re) => re.replace_all(cmdline, "%$1%").into_owned(),
        None => cmdline.to_string(),
    }
}

/// Asks the process tree rooted at `pid` to exit.
#[cfg(unix)]
pub fn terminate(pid: u32) {
    send(pid, libc::SIGTERM);
}

/// Kills the process tree rooted at `pid` outright.
#[cfg(unix)]
pub fn kill(pid: u32) {
    send(pid, libc::SIGKILL);
}

#[cfg(unix)]
fn send(pid: u32, sig: libc::c_int) {
    // Never let pid 0 turn into "our own process group".
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    if pid <= 0 {
        return;
    }
    unsafe {
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
pub fn terminate(pid: u32) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // CTRL_BREAK is the closest thing Windows has to SIGTERM for a console group.
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

/// The monitor also calls `Child::start_kill`, which covers Windows.
#[cfg(windows)]
pub fn kill(_pid: u32) {}

#[cfg(all(not(unix), not(windows)))]
pub fn terminate(_pid: u32) {}

#[cfg(all(not(unix), not(windows)))]
pub fn kill(_pid: u32) {}
