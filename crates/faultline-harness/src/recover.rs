//! Fault-recovery checkpoint.
//!
//! The original harness arms a trap handler that long-jumps back into the
//! command loop when an injected error fires while user code is running.
//! Reproducing that literally is platform-specific, so the recovery point is
//! modeled as an explicit catch boundary: command execution runs inside
//! [`run_guarded`], anything on the fault path calls [`raise`] with a typed
//! [`FaultEvent`], and the boundary hands the event back to the loop, which
//! records the command as failed and moves on.
//!
//! Only fault events are absorbed; any other panic keeps unwinding.

use std::panic::{self, AssertUnwindSafe};

/// The trap that interrupted a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Bus error (the usual result of consuming an injected error).
    BusError,
    /// Access fault.
    Segv,
    /// Any other signal number.
    Trap(i32),
}

/// Typed fault signal delivered to the command loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultEvent {
    pub kind: FaultKind,
    pub message: String,
}

impl FaultEvent {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FaultEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fault {:?}: {}", self.kind, self.message)
    }
}

/// Deliver a fault event to the nearest [`run_guarded`] boundary.
pub fn raise(event: FaultEvent) -> ! {
    panic::panic_any(event)
}

/// Run `f` under the recovery checkpoint.
///
/// Returns the fault event if one was raised; other panics propagate.
pub fn run_guarded<T>(f: impl FnOnce() -> T) -> Result<T, FaultEvent> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<FaultEvent>() {
            Ok(event) => Err(*event),
            Err(other) => panic::resume_unwind(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_results_pass_through() {
        assert_eq!(run_guarded(|| 41 + 1), Ok(42));
    }

    #[test]
    fn raised_fault_is_caught_as_event() {
        let result: Result<(), FaultEvent> =
            run_guarded(|| raise(FaultEvent::new(FaultKind::BusError, "injected ce consumed")));
        let event = result.unwrap_err();
        assert_eq!(event.kind, FaultKind::BusError);
        assert_eq!(event.message, "injected ce consumed");
    }

    #[test]
    fn unrelated_panics_keep_unwinding() {
        let outer = panic::catch_unwind(|| {
            let _ = run_guarded(|| panic!("not a fault"));
        });
        assert!(outer.is_err());
    }
}
