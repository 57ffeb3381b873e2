use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::discovery::ENGINE_EXECUTABLE_NAME;
use crate::logger::Logger;
#[cfg(windows)]
use crate::win_env;

/// Executable name of the real engine process on windows, where the
/// launched binary is only an intermediate launcher.
#[cfg(windows)]
pub const WINDOWS_ENGINE_PROCESS_NAME: &str = "EngineCore.exe";

#[cfg(windows)]
const ENGINE_CHILD_RESOLVE_TIMEOUT: Duration = Duration::from_secs(20);
#[cfg(windows)]
const ENGINE_CHILD_RESOLVE_INTERVAL: Duration = Duration::from_secs(1);

/// Immutable launch configuration for one local engine session.
#[derive(Debug, Clone)]
pub struct LocalSessionDetails {
    pub engine_root: PathBuf,
    pub starting_directory: PathBuf,
    pub is_starting_directory_set: bool,
    pub show_desktop: bool,
}

/// The stdio triple handed to the engine child. The launcher transfers
/// ownership of all three handles into the new process.
pub struct EngineStdio {
    pub stdin: File,
    pub stdout: File,
    pub stderr: File,
}

#[derive(Debug)]
pub enum LaunchError {
    Io(io::Error),
    InvalidEnvEntry(String),
    #[cfg(windows)]
    EmptyEnvironment,
    #[cfg(windows)]
    EnvBlock(win_env::EnvBlockError),
    #[cfg(windows)]
    InvalidPid(u32),
    #[cfg(windows)]
    ChildResolveTimeout(Duration),
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Io(err) => write!(f, "engine launch io error: {err}"),
            LaunchError::InvalidEnvEntry(entry) => {
                write!(f, "invalid environment entry (expected name=value): {entry:?}")
            }
            #[cfg(windows)]
            LaunchError::EmptyEnvironment => {
                write!(f, "refusing to launch the engine with an empty environment")
            }
            #[cfg(windows)]
            LaunchError::EnvBlock(err) => write!(f, "failed to build environment block: {err}"),
            #[cfg(windows)]
            LaunchError::InvalidPid(pid) => write!(f, "invalid launcher process id: {pid}"),
            #[cfg(windows)]
            LaunchError::ChildResolveTimeout(timeout) => write!(
                f,
                "engine child process did not appear within {} s",
                timeout.as_secs()
            ),
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for LaunchError {
    fn from(err: io::Error) -> Self {
        LaunchError::Io(err)
    }
}

/// Handle on the launched engine. On windows this is the resolved engine
/// child of the intermediate launcher, identified by PID only.
#[derive(Debug)]
pub struct EngineProcess {
    pid: u32,
    #[cfg(unix)]
    child: std::process::Child,
}

impl EngineProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Reaps the child if it already exited; true while still running.
    pub fn is_running(&mut self) -> bool {
        #[cfg(unix)]
        {
            !matches!(self.child.try_wait(), Ok(Some(_)))
        }
        #[cfg(not(unix))]
        {
            let mut system = sysinfo::System::new();
            system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
            system.process(sysinfo::Pid::from_u32(self.pid)).is_some()
        }
    }

    pub fn terminate(&mut self) {
        #[cfg(unix)]
        {
            if self.signal_session(libc::SIGTERM).is_err() {
                self.kill_process_tree_scan(libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            self.kill();
        }
    }

    pub fn kill(&mut self) {
        #[cfg(unix)]
        {
            if self.signal_session(libc::SIGKILL).is_err() {
                self.kill_process_tree_scan(libc::SIGKILL);
            }
            let _ = self.child.wait();
        }
        #[cfg(not(unix))]
        {
            let mut system = sysinfo::System::new();
            system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
            if let Some(process) = system.process(sysinfo::Pid::from_u32(self.pid)) {
                process.kill();
            }
        }
    }

    /// The engine is its own session leader, so signalling the process
    /// group reaches any grandchildren it spawned.
    #[cfg(unix)]
    fn signal_session(&self, signal: i32) -> io::Result<()> {
        let pid = self.pid as i32;
        let result = unsafe { libc::kill(-pid, signal) };
        if result == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        // An already-gone process group counts as success.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }

    /// Fallback when group signalling fails: walk the process table and
    /// signal every descendant individually.
    #[cfg(unix)]
    fn kill_process_tree_scan(&self, signal: i32) {
        use std::collections::{HashMap, HashSet};

        let root = sysinfo::Pid::from_u32(self.pid);
        let mut system = sysinfo::System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        let mut children: HashMap<sysinfo::Pid, Vec<sysinfo::Pid>> = HashMap::new();
        for (proc_pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*proc_pid);
            }
        }

        let mut stack = vec![root];
        let mut seen: HashSet<sysinfo::Pid> = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(kids) = children.get(&current) {
                for child in kids {
                    if !seen.contains(child) {
                        stack.push(*child);
                    }
                }
            }
        }

        for pid in seen {
            let _ = unsafe { libc::kill(pid.as_u32() as i32, signal) };
        }
    }

    /// Polls for exit; true when the process went away within the window.
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if !self.is_running() {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

/// Starts the engine executable under `<root>/bin` with an explicit
/// argv, working directory, and environment, detached from the server's
/// controlling terminal, with the supplied stdio triple.
pub fn launch(
    logger: &Logger,
    engine_root: &Path,
    working_dir: &Path,
    args: &[String],
    env: &[String],
    stdio: EngineStdio,
) -> Result<EngineProcess, LaunchError> {
    let engine_path = engine_root.join("bin").join(ENGINE_EXECUTABLE_NAME);
    std::fs::metadata(&engine_path)?;

    logger
        .with("program", engine_path.to_string_lossy().to_string())
        .with("working-dir", working_dir.to_string_lossy().to_string())
        .debug("Launching engine process");

    #[cfg(unix)]
    {
        launch_unix(&engine_path, working_dir, args, env, stdio)
    }
    #[cfg(windows)]
    {
        launch_windows(logger, &engine_path, working_dir, args, env, stdio)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = stdio;
        Err(LaunchError::Io(io::Error::other(
            "engine launch is not supported on this platform",
        )))
    }
}

#[cfg(unix)]
fn launch_unix(
    engine_path: &Path,
    working_dir: &Path,
    args: &[String],
    env: &[String],
    stdio: EngineStdio,
) -> Result<EngineProcess, LaunchError> {
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    let mut command = Command::new(engine_path);
    command
        .args(args)
        .current_dir(working_dir)
        .env_clear()
        .stdin(Stdio::from(stdio.stdin))
        .stdout(Stdio::from(stdio.stdout))
        .stderr(Stdio::from(stdio.stderr));

    for entry in env {
        let (name, value) = entry
            .split_once('=')
            .filter(|(name, _)| !name.is_empty())
            .ok_or_else(|| LaunchError::InvalidEnvEntry(entry.clone()))?;
        command.env(name, value);
    }

    // A fresh session keeps terminal signals aimed at the server from
    // reaching the engine tree.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    Ok(EngineProcess {
        pid: child.id(),
        child,
    })
}

#[cfg(windows)]
fn launch_windows(
    logger: &Logger,
    engine_path: &Path,
    working_dir: &Path,
    args: &[String],
    env: &[String],
    stdio: EngineStdio,
) -> Result<EngineProcess, LaunchError> {
    use std::os::windows::io::AsRawHandle;

    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{
        CREATE_NEW_PROCESS_GROUP, CREATE_UNICODE_ENVIRONMENT, CreateProcessW, DETACHED_PROCESS,
        PROCESS_INFORMATION, STARTF_USESTDHANDLES, STARTUPINFOW,
    };

    let mut command_line = quote_argument(&engine_path.to_string_lossy());
    for arg in args {
        command_line.push(' ');
        command_line.push_str(&quote_argument(arg));
    }
    let mut command_line_w = to_wide(&command_line);
    let working_dir_w = to_wide(&working_dir.to_string_lossy());

    let block = win_env::build(env).map_err(LaunchError::EnvBlock)?;
    if block.is_empty() {
        return Err(LaunchError::EmptyEnvironment);
    }

    let mut startup_info: STARTUPINFOW = unsafe { std::mem::zeroed() };
    startup_info.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
    startup_info.dwFlags = STARTF_USESTDHANDLES;
    startup_info.hStdInput = stdio.stdin.as_raw_handle();
    startup_info.hStdOutput = stdio.stdout.as_raw_handle();
    startup_info.hStdError = stdio.stderr.as_raw_handle();

    let mut process_info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
    let creation_flags =
        CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS | CREATE_UNICODE_ENVIRONMENT;

    let created = unsafe {
        CreateProcessW(
            std::ptr::null(),
            command_line_w.as_mut_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            1,
            creation_flags,
            block.as_ptr() as *const core::ffi::c_void,
            working_dir_w.as_ptr(),
            &startup_info,
            &mut process_info,
        )
    };
    if created == 0 {
        return Err(LaunchError::Io(io::Error::last_os_error()));
    }

    unsafe {
        CloseHandle(process_info.hThread);
        CloseHandle(process_info.hProcess);
    }

    let launcher_pid = process_info.dwProcessId;
    if launcher_pid == 0 {
        return Err(LaunchError::InvalidPid(launcher_pid));
    }

    // The process just created is only a launcher; the engine appears as
    // its uniquely named child a moment later.
    let engine_pid = wait_for_engine_child(logger, launcher_pid)?;
    Ok(EngineProcess { pid: engine_pid })
}

#[cfg(windows)]
fn wait_for_engine_child(logger: &Logger, launcher_pid: u32) -> Result<u32, LaunchError> {
    let deadline = std::time::Instant::now() + ENGINE_CHILD_RESOLVE_TIMEOUT;
    let mut system = sysinfo::System::new();
    loop {
        std::thread::sleep(ENGINE_CHILD_RESOLVE_INTERVAL);
        if let Some(pid) = engine_child_of(&mut system, launcher_pid) {
            logger.with("pid", pid).debug("Resolved engine child process");
            return Ok(pid);
        }
        if std::time::Instant::now() >= deadline {
            return Err(LaunchError::ChildResolveTimeout(ENGINE_CHILD_RESOLVE_TIMEOUT));
        }
    }
}

#[cfg(windows)]
fn engine_child_of(system: &mut sysinfo::System, launcher_pid: u32) -> Option<u32> {
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    let parent = sysinfo::Pid::from_u32(launcher_pid);
    for (pid, process) in system.processes() {
        if process.parent() == Some(parent)
            && process.name() == std::ffi::OsStr::new(WINDOWS_ENGINE_PROCESS_NAME)
        {
            return Some(pid.as_u32());
        }
    }
    None
}

#[cfg(windows)]
fn to_wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

#[cfg(windows)]
fn quote_argument(arg: &str) -> String {
    format!("\"{arg}\"")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::OwnedFd;
    use std::os::unix::fs::PermissionsExt;

    fn fake_engine_root(temp: &tempfile::TempDir, script: &str) -> PathBuf {
        let root = temp.path().join("engine-root");
        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).expect("bin dir");
        let path = bin.join(ENGINE_EXECUTABLE_NAME);
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).expect("engine script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod engine script");
        root
    }

    fn pipe_files() -> (File, File) {
        let (reader, writer) = std::io::pipe().expect("pipe");
        (
            File::from(OwnedFd::from(reader)),
            File::from(OwnedFd::from(writer)),
        )
    }

    #[test]
    fn missing_engine_binary_fails_before_spawning() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (stdin_reader, _stdin_writer) = pipe_files();
        let (_stdout_reader, stdout_writer) = pipe_files();
        let (_stderr_reader, stderr_writer) = pipe_files();

        let err = launch(
            &Logger::global(),
            &temp.path().join("nowhere"),
            temp.path(),
            &[],
            &["PATH=/usr/bin".to_string()],
            EngineStdio {
                stdin: stdin_reader,
                stdout: stdout_writer,
                stderr: stderr_writer,
            },
        )
        .expect_err("launch should fail");
        assert!(matches!(err, LaunchError::Io(_)));
    }

    #[test]
    fn launched_engine_sees_explicit_env_and_stdio() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = fake_engine_root(&temp, "printf '%s' \"$ENGINE_TEST_MARKER\"");

        let (stdin_reader, stdin_writer) = pipe_files();
        let (mut stdout_reader, stdout_writer) = pipe_files();
        let (_stderr_reader, stderr_writer) = pipe_files();

        let mut process = launch(
            &Logger::global(),
            &root,
            temp.path(),
            &[],
            &[
                "PATH=/usr/bin:/bin".to_string(),
                "ENGINE_TEST_MARKER=marker-value".to_string(),
            ],
            EngineStdio {
                stdin: stdin_reader,
                stdout: stdout_writer,
                stderr: stderr_writer,
            },
        )
        .expect("launch");
        drop(stdin_writer);

        let mut output = String::new();
        stdout_reader.read_to_string(&mut output).expect("read stdout");
        assert_eq!(output, "marker-value");

        assert!(process.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn launched_engine_runs_in_its_own_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = fake_engine_root(&temp, "sleep 30");

        let (stdin_reader, _stdin_writer) = pipe_files();
        let (_stdout_reader, stdout_writer) = pipe_files();
        let (_stderr_reader, stderr_writer) = pipe_files();

        let mut process = launch(
            &Logger::global(),
            &root,
            temp.path(),
            &[],
            &["PATH=/usr/bin:/bin".to_string()],
            EngineStdio {
                stdin: stdin_reader,
                stdout: stdout_writer,
                stderr: stderr_writer,
            },
        )
        .expect("launch");

        let own_sid = unsafe { libc::getsid(0) };
        let child_sid = unsafe { libc::getsid(process.pid() as i32) };
        assert!(child_sid >= 0, "child session id should be readable");
        assert_ne!(own_sid, child_sid, "engine must not share the server session");

        process.kill();
        assert!(!process.is_running());
    }

    #[test]
    fn malformed_env_entries_fail_the_launch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = fake_engine_root(&temp, "true");

        let (stdin_reader, _stdin_writer) = pipe_files();
        let (_stdout_reader, stdout_writer) = pipe_files();
        let (_stderr_reader, stderr_writer) = pipe_files();

        let err = launch(
            &Logger::global(),
            &root,
            temp.path(),
            &[],
            &["NOVALUE".to_string()],
            EngineStdio {
                stdin: stdin_reader,
                stdout: stdout_writer,
                stderr: stderr_writer,
            },
        )
        .expect_err("launch should fail");
        assert!(matches!(err, LaunchError::InvalidEnvEntry(_)));
    }
}
