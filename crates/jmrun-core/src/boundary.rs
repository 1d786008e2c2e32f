//! Exit interception for engines embedded in the host process.
//!
//! An embedded engine ends its run by asking to terminate the process. While
//! an [`ExitBoundary`] is installed, [`request_exit`] unwinds the calling
//! thread with an [`EngineExitSignal`] instead, so the supervisor can read the
//! code and carry on. The boundary is process-wide and single-slot: only one
//! run may hold it at a time.
//!
//! Threads running engine code (see [`run_as_engine`] and
//! [`spawn_engine_thread`]) always unwind on an exit request, even after the
//! boundary of their run was restored.

use crate::error::JmrunError;
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe, PanicHookInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error};

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

static BOUNDARY_ACTIVE: AtomicBool = AtomicBool::new(false);

thread_local! {
    static ENGINE_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Exit code carried by an intercepted termination request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineExitSignal {
    code: i32,
}

impl EngineExitSignal {
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// Recover the signal from a caught unwind payload
    pub fn from_payload(payload: &(dyn Any + Send)) -> Option<Self> {
        payload.downcast_ref::<EngineExitSignal>().copied()
    }
}

impl fmt::Display for EngineExitSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine requested exit with code {}", self.code)
    }
}

/// Terminate on behalf of an embedded engine.
///
/// Inside a boundary, or on a thread running engine code, this unwinds with
/// [`EngineExitSignal`]; anywhere else it exits the process with `code`.
pub fn request_exit(code: i32) -> ! {
    let signal = EngineExitSignal::new(code);
    if ExitBoundary::is_installed() {
        panic::panic_any(signal);
    }
    if is_engine_thread() {
        // No boundary hook to absorb it, so skip the panic hook entirely
        panic::resume_unwind(Box::new(signal));
    }
    std::process::exit(code)
}

/// Whether the current thread is running engine code
pub fn is_engine_thread() -> bool {
    ENGINE_THREAD.with(Cell::get)
}

/// Run `f` as engine code on the current thread and catch its unwind.
///
/// The mark is cleared afterwards, so pooled threads can be reused.
pub fn run_as_engine<R>(f: impl FnOnce() -> R) -> std::thread::Result<R> {
    let outer = ENGINE_THREAD.with(|flag| flag.replace(true));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    ENGINE_THREAD.with(|flag| flag.set(outer));
    result
}

/// Start a thread for an embedded engine's background work.
///
/// An exit request on it ends the thread, never the host. Other panics are
/// propagated to the joiner.
pub fn spawn_engine_thread<F>(name: impl Into<String>, f: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new().name(name.into()).spawn(move || {
        if let Err(payload) = run_as_engine(f) {
            match EngineExitSignal::from_payload(payload.as_ref()) {
                Some(signal) => debug!(code = signal.code(), "Engine thread requested exit"),
                None => panic::resume_unwind(payload),
            }
        }
    })
}

/// Guard owning the process-wide interception slot and the panic hook it
/// replaced. Dropping it restores the previous hook.
pub struct ExitBoundary {
    previous: Option<PanicHook>,
}

impl ExitBoundary {
    /// Claim the slot and install the intercepting panic hook.
    ///
    /// Fails with [`JmrunError::BoundaryBusy`] while another boundary is
    /// active.
    pub fn install() -> Result<Self, JmrunError> {
        if BOUNDARY_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(JmrunError::BoundaryBusy);
        }

        let previous = panic::take_hook();
        panic::set_hook(Box::new(intercepting_hook));
        debug!("Exit interception boundary installed");

        Ok(Self {
            previous: Some(previous),
        })
    }

    pub fn is_installed() -> bool {
        BOUNDARY_ACTIVE.load(Ordering::Acquire)
    }

    /// Reinstall the previous hook and release the slot
    pub fn restore(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(previous) = self.previous.take() else {
            return;
        };

        if std::thread::panicking() {
            // set_hook would panic here. The intercepting hook stays behind,
            // so the slot stays claimed and later installs fail as busy.
            error!(
                "Exit interception boundary dropped while panicking; the panic hook was not \
                 restored and no further in-process runs are possible"
            );
            drop(previous);
            return;
        }

        panic::set_hook(previous);
        BOUNDARY_ACTIVE.store(false, Ordering::Release);
        debug!("Exit interception boundary restored");
    }
}

impl Drop for ExitBoundary {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ExitBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitBoundary")
            .field("active", &self.previous.is_some())
            .finish()
    }
}

fn intercepting_hook(info: &PanicHookInfo<'_>) {
    let thread = std::thread::current();
    let name = thread.name().unwrap_or("<unnamed>");

    if let Some(signal) = info.payload().downcast_ref::<EngineExitSignal>() {
        // Nonzero codes are reported by the run that catches the unwind.
        if !signal.is_success() {
            debug!(thread = name, code = signal.code(), "Intercepted engine exit");
        }
        return;
    }

    error!(thread = name, "Error in thread {name}: {info}");
}
