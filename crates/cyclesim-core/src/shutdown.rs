//! Fault capture and shutdown coordination shared across threads.
//!
//! [`ShutdownCoordinator`] is the only controller state touched by more
//! than one thread. It holds:
//!
//! - the **shutdown flag**: monotonic, set at most once, never cleared;
//! - the **fault slot**: the first [`FaultRecord`] reported by any thread.
//!   Later faults are logged and discarded;
//! - the **teardown gate**: lets exactly one caller perform teardown. It
//!   shares a lock with the fault slot, so once teardown is claimed the
//!   captured fault can no longer change;
//! - the **termination rendezvous**: external interrupt requests block on
//!   it until the controller thread has finished unwinding.
//!
//! Faults reach the coordinator through three paths: the controller thread
//! itself (failing phases and listeners), a [`FaultReporter`] handed to
//! collaborators (including workers started with
//! [`FaultReporter::spawn_worker`]), and an optional process-wide panic hook
//! installed with [`ShutdownCoordinator::install_panic_hook`].

use std::any::Any;
use std::panic::{AssertUnwindSafe, PanicHookInfo};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use cyclesim_types::{IterationIndex, Phase};

use crate::listener::ListenerError;

/// A computational error: anything that failed inside a phase, a listener,
/// a worker, or the controller's own setup.
#[derive(Debug, thiserror::Error)]
pub enum FaultError {
    /// A one-time setup stage failed before the first iteration.
    #[error("{stage} failed: {source}")]
    Setup {
        /// The setup stage (e.g. `prepare_for_sim`).
        stage: &'static str,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// A phase collaborator returned an error.
    #[error("phase {phase} failed in iteration {iteration}: {source}")]
    Phase {
        /// The failing phase.
        phase: Phase,
        /// The iteration in which it failed.
        iteration: IterationIndex,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// A listener returned an error.
    #[error(transparent)]
    Listener(#[from] ListenerError),

    /// A worker thread returned an error.
    #[error("worker '{worker}' failed: {source}")]
    Worker {
        /// The worker's name.
        worker: String,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// Code panicked.
    #[error("panic in {origin}: {message}")]
    Panic {
        /// Where the panic happened.
        origin: String,
        /// The panic payload, if it was a string.
        message: String,
    },
}

/// The first computational error captured during a run.
#[derive(Debug, Clone)]
pub struct FaultRecord {
    error: Arc<FaultError>,
    origin: String,
    captured_at: DateTime<Utc>,
}

impl FaultRecord {
    /// The captured error.
    pub fn error(&self) -> &FaultError {
        &self.error
    }

    /// Shared handle to the captured error.
    pub fn shared_error(&self) -> Arc<FaultError> {
        Arc::clone(&self.error)
    }

    /// Description of where the error came from (thread or phase).
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// When the error was captured.
    pub const fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

/// Fault slot and teardown gate, guarded together.
#[derive(Debug, Default)]
struct FaultSlot {
    teardown_started: bool,
    fault: Option<FaultRecord>,
}

/// Why a reported fault was not kept.
enum Discarded {
    AfterTeardown(FaultRecord),
    NotFirst(FaultRecord),
}

/// Coordinates faults, interrupts, and teardown for one controller run.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    shutdown_requested: AtomicBool,
    slot: Mutex<FaultSlot>,
    discarded_faults: AtomicU64,
    controller_thread: OnceLock<ThreadId>,
    terminated: Mutex<bool>,
    terminated_cv: Condvar,
}

impl ShutdownCoordinator {
    /// Create a coordinator with the flag cleared and no fault.
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Shutdown flag
    // -----------------------------------------------------------------------

    /// Whether shutdown has been requested by a fault or an interrupt.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Set the shutdown flag. Returns `true` if this call set it.
    fn request_shutdown(&self) -> bool {
        !self.shutdown_requested.swap(true, Ordering::AcqRel)
    }

    // -----------------------------------------------------------------------
    // Fault slot
    // -----------------------------------------------------------------------

    /// Capture `error` unless a fault was already captured, and request
    /// shutdown either way.
    ///
    /// Returns `true` if `error` became the run's fault record. Faults that
    /// arrive after teardown has started are logged and discarded and do
    /// not touch the flag.
    ///
    /// The flag is set before the slot is filled, under the same lock as
    /// the teardown gate: whoever claims teardown sees either no fault, or
    /// a fault together with the flag.
    pub fn record_fault(&self, origin: impl Into<String>, error: FaultError) -> bool {
        let record = FaultRecord {
            error: Arc::new(error),
            origin: origin.into(),
            captured_at: Utc::now(),
        };
        let outcome = {
            let mut slot = self.lock_slot();
            if slot.teardown_started {
                Err(Discarded::AfterTeardown(record))
            } else {
                self.request_shutdown();
                if slot.fault.is_some() {
                    Err(Discarded::NotFirst(record))
                } else {
                    slot.fault = Some(record.clone());
                    Ok(record)
                }
            }
        };
        match outcome {
            Ok(captured) => {
                error!(
                    origin = %captured.origin,
                    error = %captured.error,
                    "captured error; requesting shutdown"
                );
                true
            }
            Err(Discarded::AfterTeardown(record)) => {
                self.discarded_faults.fetch_add(1, Ordering::Relaxed);
                warn!(
                    origin = %record.origin,
                    error = %record.error,
                    "error reported after teardown began; discarded"
                );
                false
            }
            Err(Discarded::NotFirst(record)) => {
                self.discarded_faults.fetch_add(1, Ordering::Relaxed);
                warn!(
                    origin = %record.origin,
                    error = %record.error,
                    "additional error after the first captured one; discarded"
                );
                false
            }
        }
    }

    /// The first captured fault, if any.
    pub fn captured_fault(&self) -> Option<FaultRecord> {
        self.lock_slot().fault.clone()
    }

    fn lock_slot(&self) -> MutexGuard<'_, FaultSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of faults that were reported but not kept.
    pub fn discarded_faults(&self) -> u64 {
        self.discarded_faults.load(Ordering::Relaxed)
    }

    /// A cloneable handle collaborators use to report faults.
    pub fn reporter(self: &Arc<Self>) -> FaultReporter {
        FaultReporter {
            coordinator: Arc::clone(self),
        }
    }

    // -----------------------------------------------------------------------
    // External interrupt
    // -----------------------------------------------------------------------

    /// Request an unexpected shutdown from outside the controller thread and
    /// block until the controller has finished teardown.
    ///
    /// Called from the controller thread itself (for example by a listener)
    /// it only sets the flag, since waiting there could never finish.
    pub fn request_interrupt(&self) {
        if self.begin_interrupt() {
            self.wait_terminated();
        }
    }

    /// Like [`request_interrupt`](Self::request_interrupt) but gives up
    /// waiting after `timeout`. Returns `true` if teardown completed.
    pub fn request_interrupt_timeout(&self, timeout: Duration) -> bool {
        if self.begin_interrupt() {
            self.wait_terminated_timeout(timeout)
        } else {
            self.is_terminated()
        }
    }

    /// Set the flag for an interrupt. Returns whether the caller may wait.
    fn begin_interrupt(&self) -> bool {
        error!("received unexpected shutdown request");
        self.request_shutdown();
        let on_controller_thread = self
            .controller_thread
            .get()
            .is_some_and(|id| *id == std::thread::current().id());
        if on_controller_thread {
            warn!("shutdown requested from the controller thread; not waiting for teardown");
        }
        !on_controller_thread
    }

    // -----------------------------------------------------------------------
    // Teardown gate and rendezvous
    // -----------------------------------------------------------------------

    /// Record the thread that drives the iteration loop.
    pub(crate) fn bind_controller_thread(&self) {
        let _ = self.controller_thread.set(std::thread::current().id());
    }

    /// Claim teardown. Returns `true` for exactly one caller.
    ///
    /// After a successful claim [`captured_fault`](Self::captured_fault) is
    /// final, and if it is `Some` the shutdown flag is set.
    pub fn begin_teardown(&self) -> bool {
        let mut slot = self.lock_slot();
        !std::mem::replace(&mut slot.teardown_started, true)
    }

    /// Whether teardown has been claimed.
    pub fn is_teardown_started(&self) -> bool {
        self.lock_slot().teardown_started
    }

    /// Mark teardown as finished and release every waiting interrupter.
    pub fn mark_terminated(&self) {
        let mut done = self.lock_terminated();
        if !*done {
            *done = true;
            self.terminated_cv.notify_all();
        }
    }

    /// Whether the controller has finished teardown.
    pub fn is_terminated(&self) -> bool {
        *self.lock_terminated()
    }

    /// Block until the controller has finished teardown.
    pub fn wait_terminated(&self) {
        let mut done = self.lock_terminated();
        while !*done {
            done = self
                .terminated_cv
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until teardown finishes or `timeout` elapses. Returns `true`
    /// if teardown finished.
    pub fn wait_terminated_timeout(&self, timeout: Duration) -> bool {
        let done = self.lock_terminated();
        let (done, _) = self
            .terminated_cv
            .wait_timeout_while(done, timeout, |finished| !*finished)
            .unwrap_or_else(PoisonError::into_inner);
        *done
    }

    fn lock_terminated(&self) -> MutexGuard<'_, bool> {
        self.terminated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Process-wide panic hook
    // -----------------------------------------------------------------------

    /// Install a panic hook that captures panics from every thread in the
    /// process as faults of this coordinator.
    ///
    /// The previous hook is restored when the returned guard is dropped.
    /// Panic hooks are process-global: only one run at a time should hold
    /// a guard.
    pub fn install_panic_hook(self: &Arc<Self>) -> PanicHookGuard {
        let previous = std::panic::take_hook();
        let coordinator = Arc::downgrade(self);
        std::panic::set_hook(Box::new(move |info| capture_panic(&coordinator, info)));
        info!("panic hook installed");
        PanicHookGuard {
            previous: Some(previous),
        }
    }
}

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

/// Restores the previous panic hook on drop.
pub struct PanicHookGuard {
    previous: Option<PanicHook>,
}

impl core::fmt::Debug for PanicHookGuard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PanicHookGuard").finish_non_exhaustive()
    }
}

impl Drop for PanicHookGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            // The hook cannot be swapped while this thread is panicking.
            if !std::thread::panicking() {
                let _ours = std::panic::take_hook();
                std::panic::set_hook(previous);
            }
        }
    }
}

fn capture_panic(coordinator: &Weak<ShutdownCoordinator>, info: &PanicHookInfo<'_>) {
    let thread = std::thread::current();
    let thread_name = thread.name().unwrap_or("<unnamed>");
    let origin = match info.location() {
        Some(loc) => format!("thread '{thread_name}' at {}:{}", loc.file(), loc.line()),
        None => format!("thread '{thread_name}'"),
    };
    let message = payload_message(info.payload());
    match coordinator.upgrade() {
        Some(coordinator) => {
            coordinator.record_fault(
                origin.clone(),
                FaultError::Panic { origin, message },
            );
        }
        None => error!(%origin, %message, "panic after the controller was dropped"),
    }
}

/// Extract a readable message from a panic payload.
pub fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}

/// Cloneable handle for reporting faults from collaborator code.
#[derive(Debug, Clone)]
pub struct FaultReporter {
    coordinator: Arc<ShutdownCoordinator>,
}

impl FaultReporter {
    /// Report a failure from `origin`. Returns `true` if it became the
    /// run's fault record.
    pub fn report(&self, origin: impl Into<String>, error: anyhow::Error) -> bool {
        let origin = origin.into();
        self.coordinator.record_fault(
            origin.clone(),
            FaultError::Worker {
                worker: origin,
                source: error,
            },
        )
    }

    /// Whether the run is shutting down. Long-running workers may poll this
    /// to stop early.
    pub fn is_shutdown_requested(&self) -> bool {
        self.coordinator.is_shutdown_requested()
    }

    /// Spawn a named worker thread whose error or panic is reported as a
    /// fault. The caller owns and joins the returned handle.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the thread cannot be spawned.
    pub fn spawn_worker<F>(&self, name: impl Into<String>, work: F) -> std::io::Result<JoinHandle<()>>
    where
        F: FnOnce(&Self) -> anyhow::Result<()> + Send + 'static,
    {
        let name = name.into();
        let reporter = self.clone();
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                match std::panic::catch_unwind(AssertUnwindSafe(|| work(&reporter))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        reporter.report(name, e);
                    }
                    Err(payload) => {
                        let origin = format!("worker '{name}'");
                        reporter.coordinator.record_fault(
                            origin.clone(),
                            FaultError::Panic {
                                origin,
                                message: payload_message(payload.as_ref()),
                            },
                        );
                    }
                }
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Barrier;
    use std::time::Instant;

    use anyhow::anyhow;

    use super::*;

    fn worker_fault(msg: &str) -> FaultError {
        FaultError::Worker {
            worker: "w".to_owned(),
            source: anyhow!(msg.to_owned()),
        }
    }

    #[test]
    fn starts_clear() {
        let c = ShutdownCoordinator::new();
        assert!(!c.is_shutdown_requested());
        assert!(c.captured_fault().is_none());
        assert!(!c.is_terminated());
        assert!(!c.is_teardown_started());
    }

    #[test]
    fn first_fault_wins() {
        let c = ShutdownCoordinator::new();
        assert!(c.record_fault("first", worker_fault("one")));
        assert!(!c.record_fault("second", worker_fault("two")));

        let record = c.captured_fault().unwrap();
        assert_eq!(record.origin(), "first");
        assert!(record.error().to_string().contains("one"));
        assert!(c.is_shutdown_requested());
        assert_eq!(c.discarded_faults(), 1);
    }

    #[test]
    fn concurrent_faults_keep_exactly_one() {
        let c = Arc::new(ShutdownCoordinator::new());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let c = Arc::clone(&c);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    c.record_fault(format!("t{i}"), worker_fault("boom"))
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(c.discarded_faults(), 7);
        assert!(c.captured_fault().is_some());
    }

    #[test]
    fn faults_after_teardown_are_discarded() {
        let c = ShutdownCoordinator::new();
        assert!(c.begin_teardown());
        assert!(!c.record_fault("late", worker_fault("late")));
        assert!(c.captured_fault().is_none());
        assert!(!c.is_shutdown_requested());
        assert_eq!(c.discarded_faults(), 1);
    }

    #[test]
    fn fault_before_teardown_is_visible_with_the_flag() {
        let c = ShutdownCoordinator::new();
        assert!(c.record_fault("worker", worker_fault("early")));
        assert!(c.begin_teardown());
        assert!(c.is_shutdown_requested());
        assert_eq!(c.captured_fault().unwrap().origin(), "worker");
        assert!(!c.record_fault("later", worker_fault("late")));
        assert_eq!(c.captured_fault().unwrap().origin(), "worker");
    }

    #[test]
    fn fault_racing_teardown_is_kept_or_discarded_never_lost() {
        for round in 0..200 {
            let c = Arc::new(ShutdownCoordinator::new());
            let barrier = Arc::new(Barrier::new(2));
            let worker = {
                let c = Arc::clone(&c);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    c.record_fault(format!("worker-{round}"), worker_fault("racing"))
                })
            };
            barrier.wait();
            assert!(c.begin_teardown());
            let seen_at_claim = c.captured_fault().map(|r| r.origin().to_owned());
            let flag_at_claim = c.is_shutdown_requested();
            let kept = worker.join().unwrap();

            let final_origin = c.captured_fault().map(|r| r.origin().to_owned());
            assert_eq!(seen_at_claim, final_origin);
            assert_eq!(kept, final_origin.is_some());
            if final_origin.is_some() {
                assert!(flag_at_claim);
            } else {
                assert_eq!(c.discarded_faults(), 1);
            }
        }
    }

    #[test]
    fn teardown_gate_opens_once() {
        let c = Arc::new(ShutdownCoordinator::new());
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || c.begin_teardown())
            })
            .collect();
        let claimed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|claimed| *claimed)
            .count();
        assert_eq!(claimed, 1);
    }

    #[test]
    fn interrupt_blocks_until_terminated() {
        let c = Arc::new(ShutdownCoordinator::new());
        let interrupter = {
            let c = Arc::clone(&c);
            std::thread::spawn(move || {
                c.request_interrupt();
                c.is_terminated()
            })
        };

        while !c.is_shutdown_requested() {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(!interrupter.is_finished());

        c.mark_terminated();
        assert!(interrupter.join().unwrap());
        assert!(c.captured_fault().is_none());
    }

    #[test]
    fn interrupt_timeout_gives_up() {
        let c = ShutdownCoordinator::new();
        let started = Instant::now();
        assert!(!c.request_interrupt_timeout(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(c.is_shutdown_requested());
    }

    #[test]
    fn interrupt_from_controller_thread_does_not_wait() {
        let c = ShutdownCoordinator::new();
        c.bind_controller_thread();
        c.request_interrupt();
        assert!(c.is_shutdown_requested());
        assert!(!c.is_terminated());
    }

    #[test]
    fn interrupt_after_termination_returns_immediately() {
        let c = ShutdownCoordinator::new();
        c.mark_terminated();
        c.mark_terminated();
        c.request_interrupt();
        assert!(c.request_interrupt_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn worker_error_is_reported() {
        let c = Arc::new(ShutdownCoordinator::new());
        let reporter = c.reporter();
        let handle = reporter
            .spawn_worker("router-1", |_| Err(anyhow!("no route")))
            .unwrap();
        handle.join().unwrap();

        let record = c.captured_fault().unwrap();
        assert_eq!(record.origin(), "router-1");
        assert!(matches!(record.error(), FaultError::Worker { worker, .. } if worker == "router-1"));
    }

    #[test]
    fn worker_panic_is_reported() {
        let c = Arc::new(ShutdownCoordinator::new());
        let handle = c
            .reporter()
            .spawn_worker("crasher", |_| panic!("worker exploded"))
            .unwrap();
        assert!(handle.join().is_ok());

        let record = c.captured_fault().unwrap();
        match record.error() {
            FaultError::Panic { message, .. } => assert_eq!(message, "worker exploded"),
            other => panic!("unexpected fault: {other}"),
        }
    }

    #[test]
    fn successful_worker_reports_nothing() {
        let c = Arc::new(ShutdownCoordinator::new());
        let handle = c.reporter().spawn_worker("fine", |r| {
            assert!(!r.is_shutdown_requested());
            Ok(())
        });
        handle.unwrap().join().unwrap();
        assert!(!c.is_shutdown_requested());
    }

    #[test]
    fn payload_messages() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(payload_message(s.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(payload_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(payload_message(other.as_ref()), "<non-string panic payload>");
    }
}
