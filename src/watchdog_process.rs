//! Server-side half of the watchdog: spawning the detached sibling via a
//! re-exec of our own binary, the line-protocol client over its stdio
//! pipes, and the facade the rest of the server talks to.

use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use crate::app_dir::ApplicationDirectory;
use crate::logger::Logger;
use crate::watchdog_protocol::{
    BASE_DIR_FLAG, GRACEFUL_SHUTDOWN_COMPLETED_SIGNAL, GRACEFUL_SHUTDOWN_SIGNAL,
    SERVER_INSTANCE_ID_FLAG, WATCHDOG_MODE_FLAG, format_pid_line,
};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum WatchdogError {
    Io(io::Error),
    StdioUnavailable(&'static str),
    AckTimeout(Duration),
    Disconnected,
}

impl std::fmt::Display for WatchdogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchdogError::Io(err) => write!(f, "watchdog io error: {err}"),
            WatchdogError::StdioUnavailable(stream) => {
                write!(f, "watchdog {stream} pipe unavailable")
            }
            WatchdogError::AckTimeout(timeout) => write!(
                f,
                "timed out after {} ms waiting for watchdog shutdown acknowledgement",
                timeout.as_millis()
            ),
            WatchdogError::Disconnected => {
                write!(f, "watchdog exited before acknowledging shutdown")
            }
        }
    }
}

impl std::error::Error for WatchdogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchdogError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for WatchdogError {
    fn from(err: io::Error) -> Self {
        WatchdogError::Io(err)
    }
}

/// Line-protocol client over the watchdog's stdio. One reader thread per
/// stream pushes lines onto channels; the acknowledgement line is routed
/// to its own channel so `send_stop` can wait on it.
pub struct WatchdogClient {
    stdin: Mutex<ChildStdin>,
    ack_rx: Mutex<mpsc::Receiver<()>>,
    debug_rx: Mutex<Option<mpsc::Receiver<String>>>,
    error_rx: Mutex<Option<mpsc::Receiver<String>>>,
    ack_timeout: Mutex<Duration>,
}

impl WatchdogClient {
    pub fn new(child: &mut Child) -> Result<Self, WatchdogError> {
        let stdin = child
            .stdin
            .take()
            .ok_or(WatchdogError::StdioUnavailable("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(WatchdogError::StdioUnavailable("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(WatchdogError::StdioUnavailable("stderr"))?;

        let (ack_tx, ack_rx) = mpsc::channel();
        let (debug_tx, debug_rx) = mpsc::channel();
        let (error_tx, error_rx) = mpsc::channel();

        thread::Builder::new()
            .name("watchdog-stdout".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(stdout);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    if trimmed == GRACEFUL_SHUTDOWN_COMPLETED_SIGNAL {
                        let _ = ack_tx.send(());
                    } else if debug_tx.send(trimmed.to_string()).is_err() {
                        return;
                    }
                }
            })
            .map_err(io::Error::from)?;

        thread::Builder::new()
            .name("watchdog-stderr".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    if error_tx.send(trimmed.to_string()).is_err() {
                        return;
                    }
                }
            })
            .map_err(io::Error::from)?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            ack_rx: Mutex::new(ack_rx),
            debug_rx: Mutex::new(Some(debug_rx)),
            error_rx: Mutex::new(Some(error_rx)),
            ack_timeout: Mutex::new(DEFAULT_ACK_TIMEOUT),
        })
    }

    pub fn set_ack_timeout(&self, timeout: Duration) {
        *self.ack_timeout.lock().expect("ack timeout mutex poisoned") = timeout;
    }

    pub fn take_debug_messages(&self) -> Option<mpsc::Receiver<String>> {
        self.debug_rx.lock().expect("debug channel mutex poisoned").take()
    }

    pub fn take_error_messages(&self) -> Option<mpsc::Receiver<String>> {
        self.error_rx.lock().expect("error channel mutex poisoned").take()
    }

    pub fn send_process_pid(&self, pid: u32) -> Result<(), WatchdogError> {
        let mut stdin = self.stdin.lock().expect("watchdog stdin mutex poisoned");
        stdin.write_all(format_pid_line(pid).as_bytes())?;
        stdin.flush()?;
        Ok(())
    }

    /// Sends the graceful-shutdown signal and waits for the watchdog's
    /// acknowledgement. A write failure is returned immediately without
    /// waiting.
    pub fn send_stop(&self) -> Result<(), WatchdogError> {
        {
            let mut stdin = self.stdin.lock().expect("watchdog stdin mutex poisoned");
            stdin.write_all(format!("{GRACEFUL_SHUTDOWN_SIGNAL}\n").as_bytes())?;
            stdin.flush()?;
        }

        let timeout = *self.ack_timeout.lock().expect("ack timeout mutex poisoned");
        let ack_rx = self.ack_rx.lock().expect("ack channel mutex poisoned");
        match ack_rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(WatchdogError::AckTimeout(timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(WatchdogError::Disconnected),
        }
    }
}

/// The watchdog facade: spawns the sibling, forwards its chatter into the
/// logger, and gates every operation behind a started latch so callers
/// racing server boot simply block until boot completes.
pub struct Watchdog {
    logger: Logger,
    started: Arc<(Mutex<bool>, Condvar)>,
    client: Mutex<Option<Arc<WatchdogClient>>>,
    base_dir: String,
    server_instance_id: String,
}

impl Watchdog {
    pub fn new(app_dir: &ApplicationDirectory, logger: Logger) -> Self {
        Self {
            logger,
            started: Arc::new((Mutex::new(false), Condvar::new())),
            client: Mutex::new(None),
            base_dir: app_dir.base_dir().to_string_lossy().to_string(),
            server_instance_id: app_dir.id().to_string(),
        }
    }

    pub fn start(&self) -> Result<(), WatchdogError> {
        self.logger.debug("Starting watchdog");

        let mut child = spawn_watchdog_process(&self.base_dir, &self.server_instance_id)?;
        let client = match WatchdogClient::new(&mut child) {
            Ok(client) => Arc::new(client),
            Err(err) => {
                self.logger.with_error(&err).error("Failed to start watchdog transport");
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };
        self.forward_messages(&client);
        // The child handle is only needed for reaping; the watchdog is
        // expected to outlive a crashing server.
        thread::spawn(move || {
            let _ = child.wait();
        });

        *self.client.lock().expect("watchdog client mutex poisoned") = Some(client);

        let (flag, cvar) = &*self.started;
        *flag.lock().expect("watchdog started mutex poisoned") = true;
        cvar.notify_all();

        self.logger.debug("Started watchdog");
        Ok(())
    }

    /// Hands the engine PID to the watchdog. Blocks until `start` has
    /// completed.
    pub fn register_process_pid(&self, pid: u32) -> Result<(), WatchdogError> {
        self.wait_for_start();
        self.logger.with("pid", pid).debug("Adding child process to watchdog");
        self.current_client().send_process_pid(pid)
    }

    /// Requests graceful watchdog shutdown and waits for the ack. Blocks
    /// until `start` has completed.
    pub fn stop(&self) -> Result<(), WatchdogError> {
        self.wait_for_start();
        self.logger.debug("Sending graceful shutdown signal to watchdog");
        self.current_client().send_stop()
    }

    fn wait_for_start(&self) {
        let (flag, cvar) = &*self.started;
        let mut started = flag.lock().expect("watchdog started mutex poisoned");
        while !*started {
            started = cvar.wait(started).expect("watchdog started mutex poisoned");
        }
    }

    fn current_client(&self) -> Arc<WatchdogClient> {
        self.client
            .lock()
            .expect("watchdog client mutex poisoned")
            .clone()
            .expect("watchdog client set when started latch is closed")
    }

    fn forward_messages(&self, client: &WatchdogClient) {
        if let Some(debug_rx) = client.take_debug_messages() {
            let logger = self.logger.with("source", "watchdog");
            thread::spawn(move || {
                for message in debug_rx {
                    logger.debug(&message);
                }
            });
        }
        if let Some(error_rx) = client.take_error_messages() {
            let logger = self.logger.with("source", "watchdog");
            thread::spawn(move || {
                for message in error_rx {
                    logger.error(&message);
                }
            });
        }
    }
}

fn spawn_watchdog_process(base_dir: &str, server_instance_id: &str) -> io::Result<Child> {
    let program = std::env::current_exe()?;
    let mut command = Command::new(program);
    command
        .arg(format!("--{WATCHDOG_MODE_FLAG}"))
        .arg(format!("--{BASE_DIR_FLAG}"))
        .arg(base_dir)
        .arg(format!("--{SERVER_INSTANCE_ID_FLAG}"))
        .arg(server_instance_id)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Detach the watchdog from our process group and terminal session so
    // it survives whatever kills the server.
    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;
        command.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        use windows_sys::Win32::System::Threading::{
            CREATE_NEW_PROCESS_GROUP, DETACHED_PROCESS,
        };
        command.creation_flags(CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS);
    }

    command.spawn()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spawn_script(script: &str) -> Child {
        Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawn test script")
    }

    #[test]
    fn send_process_pid_writes_one_line() {
        let mut child = spawn_script("cat > /dev/null");
        let client = WatchdogClient::new(&mut child).expect("client");
        client.send_process_pid(12345).expect("send pid");
        drop(client);
        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn send_stop_waits_for_the_ack() {
        let mut child = spawn_script(
            "read line; echo before-the-ack; echo graceful-shutdown-completed",
        );
        let client = WatchdogClient::new(&mut child).expect("client");
        client.set_ack_timeout(Duration::from_secs(5));

        let debug_rx = client.take_debug_messages().expect("debug channel");
        client.send_stop().expect("stop should see the ack");
        assert_eq!(
            debug_rx.recv_timeout(Duration::from_secs(1)).expect("debug line"),
            "before-the-ack"
        );
        let _ = child.wait();
    }

    #[test]
    fn send_stop_times_out_without_an_ack() {
        let mut child = spawn_script("read line; sleep 30");
        let client = WatchdogClient::new(&mut child).expect("client");
        client.set_ack_timeout(Duration::from_millis(100));

        let err = client.send_stop().expect_err("stop should time out");
        assert!(matches!(err, WatchdogError::AckTimeout(_)));
        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn stderr_lines_arrive_on_the_error_channel() {
        let mut child = spawn_script("echo oops >&2; cat > /dev/null");
        let client = WatchdogClient::new(&mut child).expect("client");
        let error_rx = client.take_error_messages().expect("error channel");
        assert_eq!(
            error_rx.recv_timeout(Duration::from_secs(2)).expect("error line"),
            "oops"
        );
        let _ = child.kill();
        let _ = child.wait();
    }
}
