//! Engine session management: launching the engine child, brokering
//! evaluate-and-capture requests against it over its stdio, and tearing it
//! down. The server runs at most one engine session; a dead engine is not
//! restarted.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use memchr::memmem;

use crate::app_dir::ApplicationDirectory;
use crate::config::Config;
use crate::discovery::{self, DiscoveryError, EnvironmentInfo};
use crate::launcher::{self, EngineProcess, EngineStdio, LaunchError, LocalSessionDetails};
use crate::logger::Logger;
use crate::session_dir::SessionDirectory;
use crate::watchdog_process::{Watchdog, WatchdogError};

/// Monotonic per-server-run session identity. `0` is the "unset" sentinel.
pub type SessionId = u64;

pub const SESSION_DIR_ENV: &str = "MCP_ENGINE_SESSION_DIR";
pub const PKG_DIR_ENV: &str = "MCP_ENGINE_PKG_DIR";
pub const CERT_FILE_ENV: &str = "MCP_ENGINE_CERT_FILE";
pub const CERT_KEY_FILE_ENV: &str = "MCP_ENGINE_CERT_KEY_FILE";
pub const FIGURES_DIR_ENV: &str = "MCP_ENGINE_FIGURES_DIR";

const READY_MARKER: &str = "<<engine:ready>>";
const INPUT_FRAME_PREFIX: &str = "MCP_ENGINE_INPUT";
const FIGURES_DIR_NAME: &str = "figures";

const ENGINE_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);
const ENGINE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const OUTPUT_WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct EvalRequest {
    pub code: String,
}

#[derive(Debug, Clone, Default)]
pub struct EvalResponse {
    pub console_output: String,
    pub images: Vec<Vec<u8>>,
}

#[derive(Debug)]
pub enum EngineError {
    Discovery(DiscoveryError),
    Launch(LaunchError),
    Io(io::Error),
    Watchdog(WatchdogError),
    SessionAlreadyRunning,
    UnknownSession(SessionId),
    EngineExited,
    StartupTimeout(Duration),
    EvalTimeout(Duration),
    /// Memoised startup failure handed to every caller of the global
    /// session; all holders share the same underlying error.
    Startup(Arc<EngineError>),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Discovery(err) => write!(f, "{err}"),
            EngineError::Launch(err) => write!(f, "{err}"),
            EngineError::Io(err) => write!(f, "engine io error: {err}"),
            EngineError::Watchdog(err) => write!(f, "{err}"),
            EngineError::SessionAlreadyRunning => {
                write!(f, "an engine session is already running")
            }
            EngineError::UnknownSession(id) => write!(f, "unknown engine session {id}"),
            EngineError::EngineExited => write!(f, "the engine process has exited"),
            EngineError::StartupTimeout(timeout) => write!(
                f,
                "engine did not become ready within {} s",
                timeout.as_secs()
            ),
            EngineError::EvalTimeout(timeout) => write!(
                f,
                "engine evaluation timed out after {} ms",
                timeout.as_millis()
            ),
            EngineError::Startup(err) => write!(f, "engine startup failed: {err}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Discovery(err) => Some(err),
            EngineError::Launch(err) => Some(err),
            EngineError::Io(err) => Some(err),
            EngineError::Watchdog(err) => Some(err),
            EngineError::Startup(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::Io(err)
    }
}

impl From<DiscoveryError> for EngineError {
    fn from(err: DiscoveryError) -> Self {
        EngineError::Discovery(err)
    }
}

impl From<LaunchError> for EngineError {
    fn from(err: LaunchError) -> Self {
        EngineError::Launch(err)
    }
}

impl From<WatchdogError> for EngineError {
    fn from(err: WatchdogError) -> Self {
        EngineError::Watchdog(err)
    }
}

/// Where newly launched engine PIDs get reported for supervised
/// termination. The watchdog facade is the production implementation.
pub trait EnginePidRegistry: Send + Sync {
    fn register(&self, pid: u32) -> Result<(), WatchdogError>;
}

impl EnginePidRegistry for Watchdog {
    fn register(&self, pid: u32) -> Result<(), WatchdogError> {
        self.register_process_pid(pid)
    }
}

#[derive(Default, Debug)]
struct OutputState {
    buffer: Vec<u8>,
    ready_seen: bool,
    eof: bool,
}

#[derive(Debug)]
struct EvalState {
    next_seq: u64,
    seen_figures: HashSet<OsString>,
}

/// One running engine child plus its session directory and output
/// accumulator. Shared behind an `Arc`; evals are serialised internally.
#[derive(Debug)]
pub struct LocalEngineSession {
    id: SessionId,
    dir: SessionDirectory,
    figures_dir: PathBuf,
    process: Mutex<EngineProcess>,
    stdin: Mutex<Option<File>>,
    output: Arc<(Mutex<OutputState>, Condvar)>,
    eval: Mutex<EvalState>,
}

impl LocalEngineSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Blocks until the engine has printed its ready marker. Idempotent;
    /// returns immediately once readiness has been observed.
    fn wait_until_ready(&self, timeout: Duration) -> Result<(), EngineError> {
        let (state, cvar) = &*self.output;
        let deadline = Instant::now() + timeout;
        let mut guard = state.lock().expect("engine output mutex poisoned");
        loop {
            if !guard.ready_seen
                && let Some(end) = find_marker_end(&guard.buffer, READY_MARKER.as_bytes())
            {
                guard.buffer.drain(..end);
                guard.ready_seen = true;
            }
            if guard.ready_seen {
                return Ok(());
            }
            if guard.eof {
                return Err(EngineError::EngineExited);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::StartupTimeout(timeout));
            }
            let wait = (deadline - now).min(OUTPUT_WAIT_SLICE);
            let (next, _timeout) = cvar
                .wait_timeout(guard, wait)
                .expect("engine output mutex poisoned");
            guard = next;
        }
    }

    /// Sends one framed evaluation request and captures the console output
    /// produced up to the engine's matching done marker, plus any figure
    /// images written during the request.
    pub fn eval_with_capture(
        &self,
        logger: &Logger,
        request: EvalRequest,
        timeout: Duration,
    ) -> Result<EvalResponse, EngineError> {
        let mut eval = self.eval.lock().expect("engine eval mutex poisoned");
        let seq = eval.next_seq;
        eval.next_seq += 1;

        logger
            .with("seq", seq)
            .with("bytes", request.code.len())
            .debug("Sending evaluation request to engine");

        {
            let mut stdin = self.stdin.lock().expect("engine stdin mutex poisoned");
            let stdin = stdin.as_mut().ok_or(EngineError::EngineExited)?;
            let header = format!("{INPUT_FRAME_PREFIX} {} {}\n", request.code.len(), seq);
            stdin.write_all(header.as_bytes())?;
            stdin.write_all(request.code.as_bytes())?;
            stdin.flush()?;
        }

        let console_output = self.wait_for_done_marker(seq, timeout)?;
        let images = self.collect_new_figures(&mut eval)?;

        Ok(EvalResponse {
            console_output,
            images,
        })
    }

    fn wait_for_done_marker(&self, seq: u64, timeout: Duration) -> Result<String, EngineError> {
        let marker = format!("<<engine:done:{seq}>>");
        let (state, cvar) = &*self.output;
        let deadline = Instant::now() + timeout;
        let mut guard = state.lock().expect("engine output mutex poisoned");
        loop {
            if let Some(position) = memmem::find(&guard.buffer, marker.as_bytes()) {
                let console = String::from_utf8_lossy(&guard.buffer[..position])
                    .trim_end_matches('\n')
                    .to_string();
                let mut end = position + marker.len();
                if guard.buffer.get(end) == Some(&b'\n') {
                    end += 1;
                }
                guard.buffer.drain(..end);
                return Ok(console);
            }
            if guard.eof {
                return Err(EngineError::EngineExited);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::EvalTimeout(timeout));
            }
            let wait = (deadline - now).min(OUTPUT_WAIT_SLICE);
            let (next, _timeout) = cvar
                .wait_timeout(guard, wait)
                .expect("engine output mutex poisoned");
            guard = next;
        }
    }

    fn collect_new_figures(&self, eval: &mut EvalState) -> Result<Vec<Vec<u8>>, EngineError> {
        let mut fresh: Vec<PathBuf> = Vec::new();
        let entries = match std::fs::read_dir(&self.figures_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        for entry in entries.filter_map(|entry| entry.ok()) {
            let name = entry.file_name();
            let path = entry.path();
            if path.extension().is_some_and(|extension| extension == "png")
                && !eval.seen_figures.contains(&name)
            {
                eval.seen_figures.insert(name);
                fresh.push(path);
            }
        }
        fresh.sort();

        let mut images = Vec::with_capacity(fresh.len());
        for path in fresh {
            images.push(std::fs::read(path)?);
        }
        Ok(images)
    }

    /// Orderly teardown: close stdin so the engine's request loop sees
    /// EOF, then escalate to SIGTERM and SIGKILL if it lingers.
    fn shutdown(&self, logger: &Logger, timeout: Duration) {
        logger
            .with("session", self.id)
            .with("session-dir", self.dir.path().to_string_lossy().to_string())
            .debug("Stopping engine session");
        {
            let mut stdin = self.stdin.lock().expect("engine stdin mutex poisoned");
            drop(stdin.take());
        }

        let mut process = self.process.lock().expect("engine process mutex poisoned");
        if process.wait_timeout(timeout) {
            return;
        }
        process.terminate();
        if process.wait_timeout(Duration::from_secs(2)) {
            return;
        }
        logger
            .with("pid", process.pid())
            .warn("Engine ignored termination request, killing");
        process.kill();
    }
}

/// Thin coordinator over discovery, session-directory materialisation and
/// the launcher. Owns the single session slot.
pub struct EngineManager {
    config: Config,
    app_dir: Arc<ApplicationDirectory>,
    pid_registry: Arc<dyn EnginePidRegistry>,
    session: Mutex<Option<Arc<LocalEngineSession>>>,
    next_session_id: AtomicU64,
}

impl EngineManager {
    pub fn new(
        config: Config,
        app_dir: Arc<ApplicationDirectory>,
        pid_registry: Arc<dyn EnginePidRegistry>,
    ) -> Self {
        Self {
            config,
            app_dir,
            pid_registry,
            session: Mutex::new(None),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn list_environments(&self, logger: &Logger) -> Vec<EnvironmentInfo> {
        discovery::list_environments(logger)
    }

    pub fn start_engine_session(
        &self,
        logger: &Logger,
        details: &LocalSessionDetails,
    ) -> Result<SessionId, EngineError> {
        let mut slot = self.session.lock().expect("engine session mutex poisoned");
        if slot.is_some() {
            return Err(EngineError::SessionAlreadyRunning);
        }

        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let logger = logger.with("session", id);

        let dir = SessionDirectory::create(&self.app_dir, &logger)?;
        let figures_dir = dir.path().join(FIGURES_DIR_NAME);
        std::fs::create_dir(&figures_dir)?;

        let (stdin_reader, stdin_writer) = pipe_files()?;
        let (stdout_reader, stdout_writer) = pipe_files()?;
        let (stderr_reader, stderr_writer) = pipe_files()?;

        let env = session_environment(&dir, &figures_dir);
        let args = session_args(&dir, details);
        let working_dir = if details.is_starting_directory_set {
            details.starting_directory.clone()
        } else {
            dir.path().to_path_buf()
        };

        let process = launcher::launch(
            &logger,
            &details.engine_root,
            &working_dir,
            &args,
            &env,
            EngineStdio {
                stdin: stdin_reader,
                stdout: stdout_writer,
                stderr: stderr_writer,
            },
        )?;
        let pid = process.pid();

        if let Err(err) = self.pid_registry.register(pid) {
            logger
                .with_error(&err)
                .error("Failed to register engine with the watchdog, killing it");
            let mut process = process;
            process.kill();
            return Err(err.into());
        }

        let output = Arc::new((Mutex::new(OutputState::default()), Condvar::new()));
        spawn_output_reader(stdout_reader, output.clone());
        spawn_stderr_logger(stderr_reader, logger.clone());

        let session = Arc::new(LocalEngineSession {
            id,
            dir,
            figures_dir,
            process: Mutex::new(process),
            stdin: Mutex::new(Some(stdin_writer)),
            output,
            eval: Mutex::new(EvalState {
                next_seq: 1,
                seen_figures: HashSet::new(),
            }),
        });
        logger.with("pid", pid).info("Started engine session");
        *slot = Some(session);
        Ok(id)
    }

    /// Returns the session client once the engine is ready to evaluate.
    pub fn get_session_client(
        &self,
        logger: &Logger,
        id: SessionId,
    ) -> Result<Arc<LocalEngineSession>, EngineError> {
        let session = {
            let slot = self.session.lock().expect("engine session mutex poisoned");
            slot.clone().filter(|session| session.id == id)
        }
        .ok_or(EngineError::UnknownSession(id))?;

        session.wait_until_ready(ENGINE_STARTUP_TIMEOUT)?;
        logger.with("session", id).debug("Engine session client ready");
        Ok(session)
    }

    pub fn stop_engine_session(&self, logger: &Logger, id: SessionId) -> Result<(), EngineError> {
        let session = {
            let mut slot = self.session.lock().expect("engine session mutex poisoned");
            if slot.as_ref().is_some_and(|session| session.id == id) {
                slot.take()
            } else {
                None
            }
        }
        .ok_or(EngineError::UnknownSession(id))?;

        session.shutdown(logger, ENGINE_SHUTDOWN_TIMEOUT);
        Ok(())
    }

    /// Lifecycle teardown: stops whatever session is running.
    pub fn stop(&self, logger: &Logger) {
        let session = {
            let mut slot = self.session.lock().expect("engine session mutex poisoned");
            slot.take()
        };
        if let Some(session) = session {
            session.shutdown(logger, ENGINE_SHUTDOWN_TIMEOUT);
        }
    }
}

fn session_environment(dir: &SessionDirectory, figures_dir: &std::path::Path) -> Vec<String> {
    let mut env: Vec<String> = std::env::vars()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    env.push(format!("{SESSION_DIR_ENV}={}", dir.path().display()));
    env.push(format!("{PKG_DIR_ENV}={}", dir.package_dir().display()));
    env.push(format!("{CERT_FILE_ENV}={}", dir.certificate_file().display()));
    env.push(format!(
        "{CERT_KEY_FILE_ENV}={}",
        dir.certificate_key_file().display()
    ));
    env.push(format!("{FIGURES_DIR_ENV}={}", figures_dir.display()));
    env
}

fn session_args(dir: &SessionDirectory, details: &LocalSessionDetails) -> Vec<String> {
    let mut args = Vec::new();
    if !details.show_desktop {
        args.push("-nodisplay".to_string());
    }
    args.push("-bootstrap".to_string());
    args.push(dir.package_dir().join("bootstrap.m").display().to_string());
    args
}

fn pipe_files() -> io::Result<(File, File)> {
    let (reader, writer) = io::pipe()?;
    #[cfg(unix)]
    {
        use std::os::fd::OwnedFd;
        Ok((
            File::from(OwnedFd::from(reader)),
            File::from(OwnedFd::from(writer)),
        ))
    }
    #[cfg(windows)]
    {
        use std::os::windows::io::OwnedHandle;
        Ok((
            File::from(OwnedHandle::from(reader)),
            File::from(OwnedHandle::from(writer)),
        ))
    }
}

fn spawn_output_reader(mut stdout: File, output: Arc<(Mutex<OutputState>, Condvar)>) {
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match stdout.read(&mut chunk) {
                Ok(0) | Err(_) => {
                    let (state, cvar) = &*output;
                    let mut guard = state.lock().expect("engine output mutex poisoned");
                    guard.eof = true;
                    cvar.notify_all();
                    return;
                }
                Ok(count) => {
                    let (state, cvar) = &*output;
                    let mut guard = state.lock().expect("engine output mutex poisoned");
                    guard.buffer.extend_from_slice(&chunk[..count]);
                    cvar.notify_all();
                }
            }
        }
    });
}

fn spawn_stderr_logger(stderr: File, logger: Logger) {
    thread::spawn(move || {
        let mut reader = io::BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match io::BufRead::read_line(&mut reader, &mut line) {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if !trimmed.is_empty() {
                logger.with("stream", "engine-stderr").debug(trimmed);
            }
        }
    });
}

/// Index one past the marker and its trailing newline, if present.
fn find_marker_end(buffer: &[u8], marker: &[u8]) -> Option<usize> {
    let position = memmem::find(buffer, marker)?;
    let mut end = position + marker.len();
    if buffer.get(end) == Some(&b'\n') {
        end += 1;
    }
    Some(end)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    struct NullRegistry;

    impl EnginePidRegistry for NullRegistry {
        fn register(&self, _pid: u32) -> Result<(), WatchdogError> {
            Ok(())
        }
    }

    struct FailingRegistry;

    impl EnginePidRegistry for FailingRegistry {
        fn register(&self, _pid: u32) -> Result<(), WatchdogError> {
            Err(WatchdogError::Disconnected)
        }
    }

    /// Shell stand-in for the engine implementing the framing protocol:
    /// announce readiness, then for each framed request run the payload as
    /// shell and emit the done marker.
    const FAKE_ENGINE: &str = r#"echo '<<engine:ready>>'
while read -r marker len seq; do
  [ "$marker" = "MCP_ENGINE_INPUT" ] || continue
  code=$(dd bs=1 count="$len" 2>/dev/null)
  eval "$code"
  echo "<<engine:done:$seq>>"
done"#;

    fn fake_engine_root(temp: &tempfile::TempDir) -> PathBuf {
        let root = temp.path().join("engine-root");
        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).expect("bin dir");
        let path = bin.join(crate::discovery::ENGINE_EXECUTABLE_NAME);
        std::fs::write(&path, format!("#!/bin/sh\n{FAKE_ENGINE}\n")).expect("engine script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod engine script");
        root
    }

    fn manager_in(temp: &tempfile::TempDir, registry: Arc<dyn EnginePidRegistry>) -> EngineManager {
        let config = Config {
            base_dir: temp.path().join("app").to_string_lossy().to_string(),
            server_instance_id: "test".to_string(),
            ..Config::default()
        };
        let app_dir = Arc::new(ApplicationDirectory::new(&config).expect("app dir"));
        EngineManager::new(config, app_dir, registry)
    }

    fn session_details(root: PathBuf) -> LocalSessionDetails {
        LocalSessionDetails {
            engine_root: root,
            starting_directory: PathBuf::new(),
            is_starting_directory_set: false,
            show_desktop: true,
        }
    }

    #[test]
    fn eval_round_trip_captures_output_and_figures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = fake_engine_root(&temp);
        let manager = manager_in(&temp, Arc::new(NullRegistry));
        let logger = Logger::global();

        let id = manager
            .start_engine_session(&logger, &session_details(root))
            .expect("start session");
        assert_ne!(id, 0);

        let client = manager.get_session_client(&logger, id).expect("client");

        let response = client
            .eval_with_capture(
                &logger,
                EvalRequest {
                    code: "echo hello-from-engine".to_string(),
                },
                Duration::from_secs(10),
            )
            .expect("eval");
        assert_eq!(response.console_output, "hello-from-engine");
        assert!(response.images.is_empty());

        // A request that drops a PNG into the figures directory gets it
        // attached to the response; the next request does not see it again.
        let response = client
            .eval_with_capture(
                &logger,
                EvalRequest {
                    code: "printf 'png-bytes' > \"$MCP_ENGINE_FIGURES_DIR/figure-000001-01.png\""
                        .to_string(),
                },
                Duration::from_secs(10),
            )
            .expect("eval with figure");
        assert_eq!(response.images, vec![b"png-bytes".to_vec()]);

        let response = client
            .eval_with_capture(
                &logger,
                EvalRequest {
                    code: "true".to_string(),
                },
                Duration::from_secs(10),
            )
            .expect("third eval");
        assert!(response.images.is_empty());

        manager.stop_engine_session(&logger, id).expect("stop");
    }

    #[test]
    fn second_session_is_rejected_while_one_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = fake_engine_root(&temp);
        let manager = manager_in(&temp, Arc::new(NullRegistry));
        let logger = Logger::global();

        let id = manager
            .start_engine_session(&logger, &session_details(root.clone()))
            .expect("start session");
        let err = manager
            .start_engine_session(&logger, &session_details(root))
            .expect_err("second session must fail");
        assert!(matches!(err, EngineError::SessionAlreadyRunning));

        manager.stop_engine_session(&logger, id).expect("stop");
    }

    #[test]
    fn unknown_session_ids_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = manager_in(&temp, Arc::new(NullRegistry));
        let err = manager
            .get_session_client(&Logger::global(), 42)
            .expect_err("unknown session");
        assert!(matches!(err, EngineError::UnknownSession(42)));
    }

    #[test]
    fn registry_failure_kills_the_fresh_engine() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = fake_engine_root(&temp);
        let manager = manager_in(&temp, Arc::new(FailingRegistry));
        let err = manager
            .start_engine_session(&Logger::global(), &session_details(root))
            .expect_err("registration failure must fail the start");
        assert!(matches!(err, EngineError::Watchdog(_)));

        let slot = manager.session.lock().expect("session slot");
        assert!(slot.is_none());
    }

    #[test]
    fn eval_times_out_when_the_engine_stays_silent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = fake_engine_root(&temp);
        let manager = manager_in(&temp, Arc::new(NullRegistry));
        let logger = Logger::global();

        let id = manager
            .start_engine_session(&logger, &session_details(root))
            .expect("start session");
        let client = manager.get_session_client(&logger, id).expect("client");

        let err = client
            .eval_with_capture(
                &logger,
                EvalRequest {
                    code: "sleep 3".to_string(),
                },
                Duration::from_millis(300),
            )
            .expect_err("eval should time out");
        assert!(matches!(err, EngineError::EvalTimeout(_)));

        manager.stop_engine_session(&logger, id).expect("stop");
    }
}
