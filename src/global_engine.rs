//! The process-wide engine session: a once-only lazy initialiser with
//! concurrent-caller coalescing and failure memoisation. Exactly one
//! caller runs the startup sequence; everyone else blocks on the same
//! attempt and observes the same outcome. Init errors are final — there
//! is no retry and no replacement engine.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};

use crate::discovery;
use crate::engine::{EngineError, EngineManager, LocalEngineSession, SessionId};
use crate::launcher::LocalSessionDetails;
use crate::logger::Logger;

enum InitState {
    NotStarted,
    Running,
    Done {
        session_id: SessionId,
        error: Option<Arc<EngineError>>,
    },
}

pub struct GlobalEngineSession {
    manager: Arc<EngineManager>,
    state: Mutex<InitState>,
    cvar: Condvar,
}

impl GlobalEngineSession {
    pub fn new(manager: Arc<EngineManager>) -> Self {
        Self {
            manager,
            state: Mutex::new(InitState::NotStarted),
            cvar: Condvar::new(),
        }
    }

    pub fn manager(&self) -> &Arc<EngineManager> {
        &self.manager
    }

    /// Returns the shared session client, starting the engine on first
    /// use. Every caller of a failed startup receives the same memoised
    /// error.
    pub fn client(&self, logger: &Logger) -> Result<Arc<LocalEngineSession>, EngineError> {
        let runs_init = {
            let mut state = self.state.lock().expect("global engine mutex poisoned");
            while matches!(&*state, InitState::Running) {
                state = self.cvar.wait(state).expect("global engine mutex poisoned");
            }
            if matches!(&*state, InitState::NotStarted) {
                *state = InitState::Running;
                true
            } else {
                false
            }
        };

        if runs_init {
            let outcome = self.initialize(logger);
            let mut state = self.state.lock().expect("global engine mutex poisoned");
            *state = match outcome {
                Ok(session_id) => InitState::Done {
                    session_id,
                    error: None,
                },
                Err(err) => {
                    logger.with_error(&err).error("Engine startup failed");
                    InitState::Done {
                        session_id: 0,
                        error: Some(Arc::new(err)),
                    }
                }
            };
            self.cvar.notify_all();
        }

        let session_id = {
            let state = self.state.lock().expect("global engine mutex poisoned");
            match &*state {
                InitState::Done {
                    error: Some(err), ..
                } => return Err(EngineError::Startup(err.clone())),
                InitState::Done {
                    session_id,
                    error: None,
                } => *session_id,
                _ => unreachable!("init finished before the state became Done"),
            }
        };

        // Deliberately resolved per caller rather than memoised alongside
        // the session id.
        self.manager.get_session_client(logger, session_id)
    }

    fn initialize(&self, logger: &Logger) -> Result<SessionId, EngineError> {
        let engine_root = discovery::select_first_engine_root(self.manager.config(), logger)?;

        // A failed starting-dir selection never aborts startup; the engine
        // simply starts without one.
        let (starting_directory, is_starting_directory_set) =
            match discovery::select_starting_dir(self.manager.config()) {
                Ok(dir) => (dir, true),
                Err(err) => {
                    logger
                        .with_error(&err)
                        .warn("Could not select an engine starting directory");
                    (PathBuf::new(), false)
                }
            };

        let details = LocalSessionDetails {
            engine_root,
            starting_directory,
            is_starting_directory_set,
            show_desktop: true,
        };
        self.manager.start_engine_session(logger, &details)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::app_dir::ApplicationDirectory;
    use crate::config::Config;
    use crate::engine::EnginePidRegistry;
    use crate::watchdog_process::WatchdogError;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    struct NullRegistry;

    impl EnginePidRegistry for NullRegistry {
        fn register(&self, _pid: u32) -> Result<(), WatchdogError> {
            Ok(())
        }
    }

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

    fn global_session(temp: &tempfile::TempDir, preferred_root: &str) -> Arc<GlobalEngineSession> {
        let config = Config {
            base_dir: temp.path().join("app").to_string_lossy().to_string(),
            server_instance_id: "test".to_string(),
            preferred_engine_root: preferred_root.to_string(),
            preferred_starting_directory: temp.path().to_string_lossy().to_string(),
            ..Config::default()
        };
        let app_dir = Arc::new(ApplicationDirectory::new(&config).expect("app dir"));
        let manager = Arc::new(EngineManager::new(config, app_dir, Arc::new(NullRegistry)));
        Arc::new(GlobalEngineSession::new(manager))
    }

    #[test]
    fn concurrent_callers_share_one_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = fake_engine_root(&temp);
        let global = global_session(&temp, &root.to_string_lossy());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let global = global.clone();
            handles.push(std::thread::spawn(move || {
                global.client(&Logger::global()).map(|client| client.id())
            }));
        }

        let ids: Vec<SessionId> = handles
            .into_iter()
            .map(|handle| handle.join().expect("join").expect("client"))
            .collect();
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
        assert_ne!(ids[0], 0);

        let logger = Logger::global();
        global
            .manager()
            .stop_engine_session(&logger, ids[0])
            .expect("stop");
    }

    #[test]
    fn startup_failure_is_memoised_for_every_caller() {
        let temp = tempfile::tempdir().expect("tempdir");
        // Root exists as a preference but holds no engine binary, so the
        // launch fails and the failure must stick.
        let global = global_session(&temp, &temp.path().join("empty").to_string_lossy());
        let logger = Logger::global();

        let first = global.client(&logger).expect_err("first call fails");
        let second = global.client(&logger).expect_err("second call fails");

        let (EngineError::Startup(first), EngineError::Startup(second)) = (&first, &second) else {
            panic!("expected memoised startup errors, got {first} / {second}");
        };
        assert!(
            Arc::ptr_eq(first, second),
            "both callers must see the same cached error"
        );
    }
}
