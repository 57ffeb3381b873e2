//! Line protocol between the server and its watchdog sibling.
//!
//! Messages are single UTF-8 lines terminated by `\n`. The server sends
//! PIDs to kill and a graceful-shutdown request on the watchdog's stdin;
//! the watchdog acknowledges on stdout. Any other watchdog stdout line is
//! a debug message for the server's logger, and every stderr line is an
//! error message.

pub const WATCHDOG_MODE_FLAG: &str = "watchdog-mode";
pub const BASE_DIR_FLAG: &str = "base-dir";
pub const SERVER_INSTANCE_ID_FLAG: &str = "server-instance-id";

pub const GRACEFUL_SHUTDOWN_SIGNAL: &str = "graceful-shutdown";
pub const GRACEFUL_SHUTDOWN_COMPLETED_SIGNAL: &str = "graceful-shutdown-completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogMessage {
    ProcessToKill(u32),
    Shutdown,
}

/// Parses one inbound watchdog line. Returns `None` for anything that is
/// neither a PID nor the shutdown signal; such lines are logged and
/// dropped by the receiver.
pub fn parse_line(line: &str) -> Option<WatchdogMessage> {
    let trimmed = line.trim_end_matches(['\n', '\r']);
    if trimmed == GRACEFUL_SHUTDOWN_SIGNAL {
        return Some(WatchdogMessage::Shutdown);
    }
    trimmed.parse::<u32>().ok().map(WatchdogMessage::ProcessToKill)
}

pub fn format_pid_line(pid: u32) -> String {
    format!("{pid}\n")
}
