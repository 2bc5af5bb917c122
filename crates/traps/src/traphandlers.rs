//! Hardware fault handling, which is built on top of the lower-level
//! signal-handling mechanisms in [`crate::sys`].
//!
//! The runtime lets compiled managed code elide explicit null and
//! stack-limit checks: a null dereference or a touch of the stack guard
//! region produces a hardware fault, the OS delivers it to the handler
//! installed here, and the handler reinterprets it as a managed exception.
//! Faults the runtime cannot or should not reinterpret are re-delivered with
//! the default OS disposition, terminating the process the normal way.

use crate::env::{FieldHandle, RuntimeEnv, StackRegion};
use std::io;
use std::sync::OnceLock;
use thiserror::Error;

/// The classification of a fault the runtime reinterprets.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultClass {
    /// A dereference of a null pointer by managed code.
    NullPointer,
    /// Managed code ran into its stack guard region.
    StackOverflow,
}

/// Result of classifying a fault against a thread's stack-guard region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum FaultTest {
    /// Not a fault the runtime reinterprets; defer to OS-default handling.
    Unhandled,
    /// A fault with a managed-exception mapping.
    Fault(FaultClass),
}

/// Program counter and frame-pointer-equivalent register recovered from an
/// OS-delivered machine context.
#[derive(Debug, Copy, Clone)]
pub(crate) struct TrapRegisters {
    pub pc: usize,
    pub fp: usize,
}

/// A fabricated call-stack frame rooted at the fault point.
///
/// When a fault interrupts managed code there is no real frame for the
/// faulting instruction, so snapshot capture is seeded with this value
/// instead: the predecessor is the interrupted frame pointer and the return
/// address is the interrupted program counter. It only lives for the
/// duration of one fault-handling invocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SyntheticFrame {
    /// Frame-pointer-equivalent register value at the fault point.
    pub prev: usize,
    /// Program counter at the fault point.
    pub return_address: usize,
}

/// Errors fatal to fault-subsystem startup.
///
/// Any of these must abort runtime initialization; none of them can occur on
/// the fault-handling path itself.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The root exception type has no reserved stack-state field, which
    /// indicates a metadata mismatch between the runtime and its own
    /// exception type definitions.
    #[error("the root exception type has no reserved stack-state field")]
    MissingStackStateField,

    /// The OS rejected a fault-signal handler registration.
    #[error("failed to register a handler for {signal}")]
    Registration {
        /// Name of the signal whose registration failed.
        signal: &'static str,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The calling thread's blocked-signal mask could not be read.
    #[error("failed to capture the thread signal mask")]
    MaskCapture(#[source] io::Error),
}

/// The resolved reference to the reserved stack-state field on the root
/// exception type. Written once by `init_signals` before any fault can be
/// handled, read-only afterwards.
static STACK_STATE_FIELD: OnceLock<FieldHandle> = OnceLock::new();

pub(crate) fn stack_state_field() -> Option<FieldHandle> {
    STACK_STATE_FIELD.get().copied()
}

/// Resolves and caches the field used to stash captured call-stack state on
/// the root exception type.
///
/// Must complete successfully before [`install_handlers`] on any thread. An
/// unresolvable field is fatal: the caller must abort startup rather than
/// run managed code without fault translation.
pub fn init_signals(env: &dyn RuntimeEnv) -> Result<(), SetupError> {
    let field = env
        .stack_state_field()
        .ok_or(SetupError::MissingStackStateField)?;
    let _ = STACK_STATE_FIELD.set(field);
    Ok(())
}

/// Registers the OS fault-signal handlers and snapshots the calling thread's
/// blocked-signal mask.
///
/// Called once per runtime thread at setup. Handler registration itself is
/// process-wide and idempotent; the mask snapshot is what makes the
/// per-thread call necessary. On registration failure every disposition
/// changed by this call is restored before the error is returned, and the
/// caller must not proceed with startup.
pub fn install_handlers() -> Result<(), SetupError> {
    crate::sys::install_handlers()
}

/// Reapplies the thread's blocked-signal mask captured by
/// [`install_handlers`].
///
/// Used after contexts where the mask may have drifted, e.g. resuming after
/// a handled fault or a suspend/resume cycle. Best-effort: an OS failure is
/// logged and swallowed, and a thread that never installed handlers is left
/// untouched.
pub fn restore_signal_mask() {
    crate::sys::restore_signal_mask()
}

/// Releases resources held by the fault subsystem.
///
/// Currently nothing is held, but this remains a distinct call site so
/// future handler or resource additions have a defined release point.
pub fn teardown_signals() {}

/// Binds `env` as the calling thread's runtime environment for the duration
/// of `closure`.
///
/// The fault handler resolves the interrupting thread's environment through
/// this binding; a fault on a thread with no binding (or outside a
/// `catch_faults` scope) is always re-delivered to the OS. Bindings nest,
/// and the previous binding is restored when `closure` exits, including by
/// unwind.
pub fn catch_faults<R>(env: &dyn RuntimeEnv, closure: impl FnOnce() -> R) -> R {
    tls::set(env, closure)
}

/// Maps a faulting address against a thread's stack-guard region.
///
/// No faulting address means the hardware observed a dereference through
/// null. An address inside `[base - guard_size, base)` is a stack-probe or
/// push into the guard region. Anything else is not ours to interpret.
pub(crate) fn classify_fault(fault_addr: Option<usize>, stack: StackRegion) -> FaultTest {
    match fault_addr {
        None => FaultTest::Fault(FaultClass::NullPointer),
        Some(addr) if stack.guard_contains(addr) => FaultTest::Fault(FaultClass::StackOverflow),
        Some(_) => FaultTest::Unhandled,
    }
}

/// Attempts to reinterpret a fault as a managed exception.
///
/// Returns only when the fault is not one this runtime handles, in which
/// case the caller must fall back to OS-default handling. When the fault is
/// classified, delivery diverges through the environment's raise entry
/// point and control never comes back here.
pub(crate) fn handle_fault(fault_addr: Option<usize>, regs: TrapRegisters) {
    tls::with(|env| {
        // A fault on a thread the runtime does not manage, or outside any
        // managed call, is not ours.
        let env = match env {
            Some(env) => env,
            None => return,
        };

        // Never reinterpret a fault that hit while the runtime's own native
        // code was on top of the stack.
        if env.is_native_frame() {
            return;
        }

        let class = match classify_fault(fault_addr, env.stack_region()) {
            FaultTest::Fault(class) => class,
            FaultTest::Unhandled => return,
        };

        // Classification happens before any allocation so that an
        // allocation failure cannot lose the decision. The field handle is
        // resolved at startup; if it's somehow absent the fault is handed
        // back to the OS rather than risking a panic on this path.
        let field = match stack_state_field() {
            Some(field) => field,
            None => return,
        };

        deliver_fault(env, class, field, regs)
    })
}

/// Builds and raises the managed exception for a classified fault.
///
/// A single small heap allocation happens here, from within a true fault
/// handler. That is a deliberate departure from strict signal-handler
/// discipline; a secondary fault raised by the allocator while already in
/// this handler is an acknowledged, undefended risk.
pub(crate) fn deliver_fault(
    env: &dyn RuntimeEnv,
    class: FaultClass,
    field: FieldHandle,
    regs: TrapRegisters,
) -> ! {
    // Once classification succeeded this function must produce *some*
    // exception object: if allocation fails, whatever the allocator left
    // pending (an out-of-memory condition) is raised instead.
    let exception = env
        .allocate_exception(class)
        .unwrap_or_else(|| env.take_pending_exception());

    let frame = SyntheticFrame {
        prev: regs.fp,
        return_address: regs.pc,
    };
    let snapshot = env.capture_call_stack(&frame);
    env.set_long_field(exception, field, snapshot.as_raw());

    env.raise(exception)
}

/// Thread-local storage of the current thread's runtime environment.
///
/// Managed code is entered from native runtime code, and a fault may then be
/// delivered at an arbitrary program point with no arguments of ours. This
/// module persists the environment reference from the call site to the
/// fault site.
pub(crate) mod tls {
    use super::RuntimeEnv;
    use std::cell::Cell;
    use std::mem;

    thread_local!(static ENV: Cell<Option<&'static dyn RuntimeEnv>> = Cell::new(None));

    /// Configures thread-local state such that for the duration of
    /// `closure` any call to `with` yields `env`, unless rebound by a
    /// nested `set`.
    pub fn set<R>(env: &dyn RuntimeEnv, closure: impl FnOnce() -> R) -> R {
        struct Reset<'a, T: Copy>(&'a Cell<T>, T);

        impl<T: Copy> Drop for Reset<'_, T> {
            fn drop(&mut self) {
                self.0.set(self.1);
            }
        }

        ENV.with(|cell| {
            // The extension of the lifetime to `'static` is safe because the
            // reference is only ever handed back out below with an anonymous
            // lifetime scoped inside this `set` call, so `'static` never
            // leaks out of this module.
            let env = unsafe {
                mem::transmute::<&dyn RuntimeEnv, &'static dyn RuntimeEnv>(env)
            };
            let _reset = Reset(cell, cell.replace(Some(env)));
            closure()
        })
    }

    /// Yields the environment bound to the current thread, if any.
    pub fn with<R>(closure: impl FnOnce(Option<&dyn RuntimeEnv>) -> R) -> R {
        ENV.with(|cell| closure(cell.get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{CapturedStack, ExceptionRef};
    use std::cell::{Cell, RefCell};
    use std::panic::{self, AssertUnwindSafe};

    // The value every test resolves the stack-state field to. Tests share
    // the process-wide `STACK_STATE_FIELD`, so they must agree on it.
    const FIELD: usize = 0x40;

    /// What a raised exception unwinds with in tests, standing in for the
    /// runtime's non-local transfer of control.
    struct Raised(ExceptionRef);

    struct MockEnv {
        stack: StackRegion,
        native_frame: bool,
        allocation_fails: bool,
        pending: Cell<Option<ExceptionRef>>,
        allocated: Cell<usize>,
        captured_roots: RefCell<Vec<SyntheticFrame>>,
        stored_fields: RefCell<Vec<(ExceptionRef, FieldHandle, u64)>>,
    }

    impl MockEnv {
        fn new() -> MockEnv {
            MockEnv {
                stack: StackRegion {
                    base: 0x100_0000,
                    guard_size: 0x1_0000,
                },
                native_frame: false,
                allocation_fails: false,
                pending: Cell::new(None),
                allocated: Cell::new(0),
                captured_roots: RefCell::new(Vec::new()),
                stored_fields: RefCell::new(Vec::new()),
            }
        }
    }

    impl RuntimeEnv for MockEnv {
        fn stack_region(&self) -> StackRegion {
            self.stack
        }

        fn is_native_frame(&self) -> bool {
            self.native_frame
        }

        fn stack_state_field(&self) -> Option<FieldHandle> {
            Some(FieldHandle::from_raw(FIELD))
        }

        fn allocate_exception(&self, class: FaultClass) -> Option<ExceptionRef> {
            if self.allocation_fails {
                return None;
            }
            self.allocated.set(self.allocated.get() + 1);
            Some(ExceptionRef::from_raw(match class {
                FaultClass::NullPointer => 0x1000,
                FaultClass::StackOverflow => 0x2000,
            }))
        }

        fn take_pending_exception(&self) -> ExceptionRef {
            self.pending.take().expect("no pending exception to take")
        }

        fn capture_call_stack(&self, root: &SyntheticFrame) -> CapturedStack {
            self.captured_roots.borrow_mut().push(*root);
            CapturedStack::from_raw(0xBEEF)
        }

        fn set_long_field(&self, exception: ExceptionRef, field: FieldHandle, value: u64) {
            self.stored_fields.borrow_mut().push((exception, field, value));
        }

        fn raise(&self, exception: ExceptionRef) -> ! {
            panic::panic_any(Raised(exception));
        }
    }

    fn init(env: &MockEnv) {
        init_signals(env).unwrap();
    }

    /// Runs `handle_fault` with `env` bound, returning the raised exception
    /// or `None` when the handler declined the fault.
    fn run_handler(
        env: &MockEnv,
        fault_addr: Option<usize>,
        regs: TrapRegisters,
    ) -> Option<ExceptionRef> {
        init(env);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            tls::set(env, || handle_fault(fault_addr, regs))
        }));
        match result {
            Ok(()) => None,
            Err(payload) => match payload.downcast::<Raised>() {
                Ok(raised) => Some(raised.0),
                Err(payload) => panic::resume_unwind(payload),
            },
        }
    }

    fn regs(pc: usize, fp: usize) -> TrapRegisters {
        TrapRegisters { pc, fp }
    }

    #[test]
    fn classification_table() {
        let stack = StackRegion {
            base: 0x100_0000,
            guard_size: 0x1_0000,
        };
        assert_eq!(
            classify_fault(None, stack),
            FaultTest::Fault(FaultClass::NullPointer)
        );
        assert_eq!(
            classify_fault(Some(0x0FFF_FF00), stack),
            FaultTest::Fault(FaultClass::StackOverflow)
        );
        assert_eq!(classify_fault(Some(0x200_0000), stack), FaultTest::Unhandled);
        // First address past the guard in either direction is out.
        assert_eq!(classify_fault(Some(0x100_0000), stack), FaultTest::Unhandled);
        assert_eq!(
            classify_fault(Some(0x0FEF_FFFF), stack),
            FaultTest::Unhandled
        );
    }

    #[test]
    fn null_fault_raises_null_pointer_with_synthetic_root() {
        let env = MockEnv::new();
        let raised = run_handler(&env, None, regs(0xDEAD_0010, 0x7FFF_0000)).unwrap();
        assert_eq!(raised, ExceptionRef::from_raw(0x1000));

        // The snapshot's innermost frame carries the interrupted pc and fp.
        let roots = env.captured_roots.borrow();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].return_address, 0xDEAD_0010);
        assert_eq!(roots[0].prev, 0x7FFF_0000);

        // The snapshot handle landed in the reserved field of the raised
        // exception.
        let stored = env.stored_fields.borrow();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0], (raised, FieldHandle::from_raw(FIELD), 0xBEEF));
    }

    #[test]
    fn guard_fault_raises_stack_overflow() {
        let env = MockEnv::new();
        let raised = run_handler(&env, Some(0x0FFF_FF00), regs(0x1234, 0x5678)).unwrap();
        assert_eq!(raised, ExceptionRef::from_raw(0x2000));
    }

    #[test]
    fn out_of_range_fault_is_declined() {
        let env = MockEnv::new();
        assert!(run_handler(&env, Some(0x200_0000), regs(0x1234, 0x5678)).is_none());
        assert!(env.captured_roots.borrow().is_empty());
        assert!(env.stored_fields.borrow().is_empty());
    }

    #[test]
    fn native_frame_fault_is_declined_regardless_of_address() {
        let mut env = MockEnv::new();
        env.native_frame = true;
        assert!(run_handler(&env, None, regs(0x1234, 0x5678)).is_none());
        assert!(run_handler(&env, Some(0x0FFF_FF00), regs(0x1234, 0x5678)).is_none());
        assert_eq!(env.allocated.get(), 0);
    }

    #[test]
    fn unbound_thread_fault_is_declined() {
        let env = MockEnv::new();
        init(&env);
        // No tls binding at all: the handler must return without touching
        // the environment.
        let result = panic::catch_unwind(|| {
            handle_fault(None, TrapRegisters { pc: 0x1234, fp: 0x5678 })
        });
        assert!(result.is_ok());
        assert_eq!(env.allocated.get(), 0);
    }

    #[test]
    fn allocation_failure_substitutes_pending_exception() {
        let mut env = MockEnv::new();
        env.allocation_fails = true;
        env.pending.set(Some(ExceptionRef::from_raw(0x3000)));
        let raised = run_handler(&env, None, regs(0x1234, 0x5678)).unwrap();
        assert_eq!(raised, ExceptionRef::from_raw(0x3000));

        // The substituted exception still gets a snapshot attached.
        let stored = env.stored_fields.borrow();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].0, raised);
    }

    #[test]
    fn bindings_nest_and_restore() {
        let outer = MockEnv::new();
        let mut inner = MockEnv::new();
        inner.native_frame = true;

        tls::set(&outer, || {
            tls::with(|env| assert!(env.is_some_and(|env| !env.is_native_frame())));
            tls::set(&inner, || {
                tls::with(|env| assert!(env.is_some_and(|env| env.is_native_frame())));
            });
            tls::with(|env| assert!(env.is_some_and(|env| !env.is_native_frame())));
        });
        tls::with(|env| assert!(env.is_none()));
    }
}
