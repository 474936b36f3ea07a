//! Caller-initiated cancellation and deadlines.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::process::LaunchedStage;

/// How often the watchdog looks at the cancel flag and the clock.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to cancel a running procedure from another thread.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Why a run stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// [`CancelHandle::cancel`] was called.
    Requested,
    /// The run's deadline passed.
    TimedOut { after: Duration },
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => write!(f, "cancelled by caller"),
            CancelReason::TimedOut { after } => {
                write!(f, "timed out after {:.1}s", after.as_secs_f64())
            }
        }
    }
}

/// Absolute deadline together with the timeout it was derived from.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    pub at: Instant,
    pub after: Duration,
}

impl Deadline {
    pub fn from_now(after: Duration) -> Self {
        Self {
            at: Instant::now() + after,
            after,
        }
    }

    pub fn has_passed(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// Check a handle and a deadline without blocking.
pub(crate) fn pending_reason(
    cancel: Option<&CancelHandle>,
    deadline: Option<&Deadline>,
) -> Option<CancelReason> {
    if cancel.is_some_and(CancelHandle::is_cancelled) {
        return Some(CancelReason::Requested);
    }
    match deadline {
        Some(d) if d.has_passed() => Some(CancelReason::TimedOut { after: d.after }),
        _ => None,
    }
}

/// Background thread that kills a pipeline's children on cancel or timeout.
///
/// Stages are registered in the shared list as they are spawned. Once the
/// watchdog fires it kills every unreaped stage in the list, including
/// stages registered later, until it is stopped.
pub struct Watchdog {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Option<CancelReason>>>,
}

impl Watchdog {
    pub fn spawn(
        name: &str,
        stages: Arc<Mutex<Vec<LaunchedStage>>>,
        cancel: Option<CancelHandle>,
        deadline: Option<Deadline>,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name(format!("{}-watchdog", name))
            .spawn(move || {
                let mut fired = None;
                while !stop_flag.load(Ordering::SeqCst) {
                    if fired.is_none() {
                        fired = pending_reason(cancel.as_ref(), deadline.as_ref());
                    }
                    if fired.is_some() {
                        for stage in stages.lock().iter_mut() {
                            stage.kill();
                        }
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                fired
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the watchdog and report whether it fired.
    pub fn stop(mut self) -> Option<CancelReason> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<CancelReason> {
        self.stop.store(true, Ordering::SeqCst);
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(reason)) => reason,
            Some(Err(_)) => {
                tracing::warn!("Watchdog thread panicked");
                None
            }
            None => None,
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
