//! Stack traces for panics inside coordinator work.
//!
//! `JoinError` only carries the panic payload. The hook installed here
//! captures a backtrace on the panicking thread so the coordinator can
//! attach it to the test's error. Only registered tokio tasks and closures
//! run through [`catch`] are captured; any other panic is left to the
//! previous hook and nothing is retained for it.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, Once, OnceLock, PoisonError};
use tokio::task::Id;

static INSTALL: Once = Once::new();

thread_local! {
    /// Set while [`catch`] runs a closure on this thread.
    static CATCHING: RefCell<Option<Option<String>>> = const { RefCell::new(None) };
}

/// Registered task ids, and the trace once one of them panicked.
fn traces() -> &'static Mutex<HashMap<Id, Option<String>>> {
    static TRACES: OnceLock<Mutex<HashMap<Id, Option<String>>>> = OnceLock::new();
    TRACES.get_or_init(Default::default)
}

/// A panic recovered by [`catch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caught {
    pub message: String,
    pub trace: String,
}

/// Chain a trace-capturing hook in front of the current panic hook.
///
/// Idempotent.
pub fn install_hook() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let caught = CATCHING
                .try_with(|c| match c.borrow_mut().as_mut() {
                    Some(slot) => {
                        *slot = Some(Backtrace::force_capture().to_string());
                        true
                    }
                    None => false,
                })
                .unwrap_or(false);
            if !caught && let Some(id) = tokio::task::try_id() {
                let mut traces = traces().lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(slot) = traces.get_mut(&id) {
                    *slot = Some(Backtrace::force_capture().to_string());
                }
            }
            previous(info);
        }));
    });
}

/// Capture a trace if the current task panics.
///
/// Call from inside the task; pair with [`take_trace`] or [`forget`].
pub fn register_current_task() {
    if let Some(id) = tokio::task::try_id() {
        traces()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, None);
    }
}

/// The trace captured for a registered task, if it panicked.
///
/// Unregisters the task.
pub fn take_trace(id: Id) -> Option<String> {
    traces()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id)
        .flatten()
}

/// Unregister a task that finished without panicking.
pub fn forget(id: Id) {
    take_trace(id);
}

/// Run `f`, turning a panic into a [`Caught`] with its stack trace.
pub fn catch<T>(f: impl FnOnce() -> T) -> Result<T, Caught> {
    install_hook();
    let outer = CATCHING.with(|c| c.borrow_mut().replace(None));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    let trace = CATCHING.with(|c| std::mem::replace(&mut *c.borrow_mut(), outer)).flatten();
    result.map_err(|payload| Caught {
        message: panic_message(payload.as_ref()),
        trace: trace.unwrap_or_else(|| "<no stack trace captured>".to_string()),
    })
}

/// The message a panic was raised with.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}
