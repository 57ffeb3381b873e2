//! Watchdog receiver: the detached sibling process entered through
//! `--watchdog-mode`.
//!
//! This module deliberately bypasses the event log. Every informational
//! line goes to the watchdog's own stdout and every error line to its
//! stderr as raw text; the parent server forwards both streams into its
//! logger. The watchdog must keep functioning after the parent has died,
//! so it holds no resource the parent owns beyond the inherited pipes.

use std::collections::HashSet;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use crate::watchdog_protocol::{
    GRACEFUL_SHUTDOWN_COMPLETED_SIGNAL, WatchdogMessage, parse_line,
};

const PARENT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TerminateEvent {
    Shutdown,
    ParentExited,
    Interrupted,
}

/// Runs the watchdog until a terminating event arrives, then kills every
/// accumulated PID. The acknowledgement line is written only on the
/// explicit shutdown branch; when the parent died or an interrupt arrived
/// there is nobody left listening.
pub fn run(base_dir: &str, server_instance_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    install_interrupt_handler();

    debug_line(&format!(
        "Watchdog process has started (base-dir={base_dir} server-instance-id={server_instance_id})"
    ))?;

    let parent = parent_pid();
    let pids: Arc<Mutex<HashSet<u32>>> = Arc::new(Mutex::new(HashSet::new()));
    let (event_tx, event_rx) = mpsc::channel();

    spawn_stdin_reader(pids.clone(), event_tx.clone());
    spawn_liveness_poller(parent, event_tx);

    let event = event_rx
        .recv()
        .map_err(|_| io::Error::other("watchdog event sources disconnected"))?;

    match event {
        TerminateEvent::Shutdown => {
            debug_line("Graceful shutdown signal received")?;
            terminate_all(&pids, &mut io::stdout().lock());
            let mut out = io::stdout().lock();
            writeln!(out, "{GRACEFUL_SHUTDOWN_COMPLETED_SIGNAL}")?;
            out.flush()?;
        }
        TerminateEvent::ParentExited => {
            debug_line("Lost connection to parent, shutting down")?;
            terminate_all(&pids, &mut io::stdout().lock());
        }
        TerminateEvent::Interrupted => {
            debug_line("Received interrupt signal, shutting down")?;
            terminate_all(&pids, &mut io::stdout().lock());
        }
    }

    debug_line("Watchdog process has exited")?;
    Ok(())
}

fn debug_line(message: &str) -> io::Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{message}")?;
    out.flush()
}

/// Reads protocol lines from stdin. PIDs are added to the kill set right
/// here, concurrently with any terminate drain, which is why the set is
/// mutex-guarded. EOF only stops the reader; the liveness poller notices
/// the dead parent shortly after.
fn spawn_stdin_reader(pids: Arc<Mutex<HashSet<u32>>>, event_tx: mpsc::Sender<TerminateEvent>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(io::stdin());
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                continue;
            }
            match parse_line(&line) {
                Some(WatchdogMessage::ProcessToKill(pid)) => {
                    {
                        let mut set = pids.lock().expect("watchdog pid set mutex poisoned");
                        set.insert(pid);
                    }
                    let _ = debug_line(&format!("Adding process to kill pid={pid}"));
                }
                Some(WatchdogMessage::Shutdown) => {
                    let _ = event_tx.send(TerminateEvent::Shutdown);
                    return;
                }
                None => {
                    eprintln!("Ignoring invalid watchdog message: {trimmed}");
                }
            }
        }
    });
}

fn spawn_liveness_poller(parent: u32, event_tx: mpsc::Sender<TerminateEvent>) {
    thread::spawn(move || {
        let mut since_parent_check = PARENT_POLL_INTERVAL;
        loop {
            if INTERRUPTED.load(Ordering::SeqCst) {
                let _ = event_tx.send(TerminateEvent::Interrupted);
                return;
            }
            if since_parent_check >= PARENT_POLL_INTERVAL {
                since_parent_check = Duration::ZERO;
                if !parent_alive(parent) {
                    let _ = event_tx.send(TerminateEvent::ParentExited);
                    return;
                }
            }
            thread::sleep(INTERRUPT_POLL_INTERVAL);
            since_parent_check += INTERRUPT_POLL_INTERVAL;
        }
    });
}

fn terminate_all<W: Write>(pids: &Mutex<HashSet<u32>>, out: &mut W) {
    let set = pids.lock().expect("watchdog pid set mutex poisoned");
    let _ = writeln!(out, "Trying to terminate children count={}", set.len());
    for &pid in set.iter() {
        let _ = writeln!(out, "Killing process pid={pid}");
        if let Err(err) = kill_process(pid) {
            eprintln!("Failed to kill child pid={pid}: {err}");
        }
    }
    let _ = out.flush();
}

fn kill_process(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        if unsafe { libc::kill(pid as i32, libc::SIGKILL) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
    #[cfg(not(unix))]
    {
        let mut system = sysinfo::System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        let process = system
            .process(sysinfo::Pid::from_u32(pid))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such process"))?;
        if process.kill() {
            Ok(())
        } else {
            Err(io::Error::other("failed to terminate process"))
        }
    }
}

fn parent_pid() -> u32 {
    #[cfg(unix)]
    {
        unsafe { libc::getppid() as u32 }
    }
    #[cfg(not(unix))]
    {
        let mut system = sysinfo::System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        system
            .process(sysinfo::Pid::from_u32(std::process::id()))
            .and_then(|process| process.parent())
            .map(|parent| parent.as_u32())
            .unwrap_or(0)
    }
}

fn parent_alive(parent: u32) -> bool {
    if parent == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        // Reparenting means the original parent is gone even if its PID
        // was recycled.
        if unsafe { libc::getppid() } as u32 != parent {
            return false;
        }
        let rc = unsafe { libc::kill(parent as i32, 0) };
        rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }
    #[cfg(not(unix))]
    {
        let mut system = sysinfo::System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        system.process(sysinfo::Pid::from_u32(parent)).is_some()
    }
}

fn install_interrupt_handler() {
    #[cfg(unix)]
    unsafe {
        let handler = on_interrupt as extern "C" fn(libc::c_int);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

#[cfg(unix)]
extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}
