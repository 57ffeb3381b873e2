use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::DEFAULT_SHUTDOWN_TIMEOUT;

pub type ShutdownFn =
    Box<dyn FnOnce() -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send>;

/// Single-shot shutdown coordinator. Registered closures run sequentially,
/// in registration order, on a dedicated teardown thread; the first error
/// wins but never short-circuits the sequence.
#[derive(Clone)]
pub struct LifecycleSignaler {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    cvar: Condvar,
}

struct State {
    functions: Vec<ShutdownFn>,
    timeout: Duration,
    requested_at: Option<Instant>,
    completed: bool,
    result: Option<ShutdownError>,
}

#[derive(Debug, Clone)]
pub enum ShutdownError {
    DeadlineExceeded,
    Function(Arc<dyn std::error::Error + Send + Sync>),
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownError::DeadlineExceeded => write!(f, "shutdown deadline exceeded"),
            ShutdownError::Function(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ShutdownError {}

impl Default for LifecycleSignaler {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleSignaler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    functions: Vec::new(),
                    timeout: DEFAULT_SHUTDOWN_TIMEOUT,
                    requested_at: None,
                    completed: false,
                    result: None,
                }),
                cvar: Condvar::new(),
            }),
        }
    }

    pub fn add_shutdown_function(&self, function: ShutdownFn) {
        let mut state = self.inner.state.lock().expect("lifecycle mutex poisoned");
        state.functions.push(function);
    }

    pub fn set_shutdown_timeout(&self, timeout: Duration) {
        let mut state = self.inner.state.lock().expect("lifecycle mutex poisoned");
        state.timeout = timeout;
    }

    pub fn shutdown_timeout(&self) -> Duration {
        let state = self.inner.state.lock().expect("lifecycle mutex poisoned");
        state.timeout
    }

    /// Idempotent; only the first call starts the teardown thread. Returns
    /// immediately.
    pub fn request_shutdown(&self) {
        {
            let mut state = self.inner.state.lock().expect("lifecycle mutex poisoned");
            if state.requested_at.is_some() {
                return;
            }
            state.requested_at = Some(Instant::now());
            // Waiters parked before the request must re-evaluate so the
            // timeout starts counting for them too.
            self.inner.cvar.notify_all();
        }

        let inner = self.inner.clone();
        thread::spawn(move || {
            let mut first_error: Option<ShutdownError> = None;
            loop {
                let function = {
                    let mut state = inner.state.lock().expect("lifecycle mutex poisoned");
                    if state.functions.is_empty() {
                        state.completed = true;
                        state.result = first_error.take();
                        inner.cvar.notify_all();
                        return;
                    }
                    state.functions.remove(0)
                };
                if let Err(err) = function()
                    && first_error.is_none()
                {
                    first_error = Some(ShutdownError::Function(Arc::from(err)));
                }
            }
        });
    }

    /// Blocks until every registered closure has run or the timeout
    /// (counted from the shutdown request) elapses. Blocks indefinitely
    /// while no shutdown has been requested.
    pub fn wait_for_shutdown_to_complete(&self) -> Result<(), ShutdownError> {
        let mut state = self.inner.state.lock().expect("lifecycle mutex poisoned");
        loop {
            if state.completed {
                return match &state.result {
                    Some(err) => Err(err.clone()),
                    None => Ok(()),
                };
            }
            match state.requested_at {
                Some(requested_at) => {
                    let deadline = requested_at + state.timeout;
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ShutdownError::DeadlineExceeded);
                    }
                    let (next, _timeout) = self
                        .inner
                        .cvar
                        .wait_timeout(state, deadline - now)
                        .expect("lifecycle mutex poisoned");
                    state = next;
                }
                None => {
                    state = self.inner.cvar.wait(state).expect("lifecycle mutex poisoned");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn request_then_wait_with_no_functions() {
        let signaler = LifecycleSignaler::new();
        signaler.request_shutdown();
        assert!(signaler.wait_for_shutdown_to_complete().is_ok());
    }

    #[test]
    fn functions_run_in_registration_order() {
        let signaler = LifecycleSignaler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            signaler.add_shutdown_function(Box::new(move || {
                order.lock().unwrap().push(tag);
                Ok(())
            }));
        }

        signaler.request_shutdown();
        signaler.wait_for_shutdown_to_complete().expect("shutdown");
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn first_error_wins_but_all_functions_run() {
        let signaler = LifecycleSignaler::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        signaler.add_shutdown_function(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let counter = calls.clone();
        signaler.add_shutdown_function(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("second failed".into())
        }));
        let counter = calls.clone();
        signaler.add_shutdown_function(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("third failed".into())
        }));

        signaler.request_shutdown();
        let err = signaler
            .wait_for_shutdown_to_complete()
            .expect_err("shutdown should fail");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.to_string(), "second failed");
    }

    #[test]
    fn wait_blocks_until_requested() {
        let signaler = LifecycleSignaler::new();
        signaler.set_shutdown_timeout(Duration::from_millis(100));

        let (tx, rx) = mpsc::channel();
        let waiter = signaler.clone();
        thread::spawn(move || {
            tx.send(waiter.wait_for_shutdown_to_complete()).ok();
        });

        // The timeout must not fire while no shutdown has been requested.
        assert!(
            rx.recv_timeout(Duration::from_millis(250)).is_err(),
            "wait completed before a shutdown was requested"
        );

        signaler.request_shutdown();
        let result = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("wait should complete after the request");
        assert!(result.is_ok());
    }

    #[test]
    fn slow_function_trips_the_deadline() {
        let signaler = LifecycleSignaler::new();
        signaler.set_shutdown_timeout(Duration::from_millis(50));
        signaler.add_shutdown_function(Box::new(|| {
            thread::sleep(Duration::from_millis(300));
            Ok(())
        }));

        let start = Instant::now();
        signaler.request_shutdown();
        let err = signaler
            .wait_for_shutdown_to_complete()
            .expect_err("shutdown should time out");
        assert!(matches!(err, ShutdownError::DeadlineExceeded));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn repeated_requests_run_each_function_once() {
        let signaler = LifecycleSignaler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        signaler.add_shutdown_function(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        signaler.request_shutdown();
        signaler.request_shutdown();
        signaler.wait_for_shutdown_to_complete().expect("shutdown");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
