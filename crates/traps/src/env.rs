//! The seam between the fault handlers and the rest of the runtime.
//!
//! The fault handler runs asynchronously on whichever thread faulted and must
//! only touch a narrow slice of runtime state. That slice is expressed here
//! as the [`RuntimeEnv`] trait plus a few opaque handles, so the handler
//! never reaches into allocator or metadata internals directly. The runtime
//! core implements [`RuntimeEnv`] once per thread and binds it around managed
//! calls with [`catch_faults`](crate::catch_faults).

use crate::traphandlers::{FaultClass, SyntheticFrame};

/// A thread's stack lower bound and guard-region size.
///
/// Established at thread creation and read-only while the thread executes
/// managed code; the handler only ever performs address-range membership
/// tests against it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StackRegion {
    /// Lowest usable address of the thread's stack.
    pub base: usize,
    /// Size in bytes of the inaccessible guard region just below `base`.
    pub guard_size: usize,
}

impl StackRegion {
    /// Whether `addr` falls within the guard region `[base - guard_size, base)`.
    pub fn guard_contains(&self, addr: usize) -> bool {
        match self.base.checked_sub(self.guard_size) {
            Some(lo) => addr >= lo && addr < self.base,
            None => false,
        }
    }
}

/// An opaque reference to a managed exception object.
///
/// Only the runtime core can interpret the raw value; this crate just
/// threads it from allocation to the raise entry point.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExceptionRef(usize);

impl ExceptionRef {
    /// Wraps a raw object reference produced by the runtime core.
    pub fn from_raw(raw: usize) -> ExceptionRef {
        ExceptionRef(raw)
    }

    /// Returns the raw object reference.
    pub fn as_raw(&self) -> usize {
        self.0
    }
}

/// An opaque, resolved reference to an instance field.
///
/// The only field this crate ever resolves is the reserved stack-state slot
/// on the root exception type; see [`init_signals`](crate::init_signals).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FieldHandle(usize);

impl FieldHandle {
    /// Wraps a raw field reference produced by field resolution.
    pub fn from_raw(raw: usize) -> FieldHandle {
        FieldHandle(raw)
    }

    /// Returns the raw field reference.
    pub fn as_raw(&self) -> usize {
        self.0
    }
}

/// An opaque handle to a captured call-stack snapshot.
///
/// Produced by [`RuntimeEnv::capture_call_stack`] and stored verbatim into
/// the exception's reserved 64-bit field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CapturedStack(u64);

impl CapturedStack {
    /// Wraps a raw snapshot handle produced by the runtime core.
    pub fn from_raw(raw: u64) -> CapturedStack {
        CapturedStack(raw)
    }

    /// Returns the raw snapshot handle.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Services the fault handler consumes from the runtime core.
///
/// All methods take `&self`: the handler interrupts the owning thread at an
/// arbitrary program point, so any mutation behind these calls must go
/// through the runtime core's own interior-mutability discipline.
pub trait RuntimeEnv {
    /// The current thread's stack bounds, used for overflow classification.
    fn stack_region(&self) -> StackRegion;

    /// Whether the thread's current top-of-stack frame belongs to
    /// runtime-native code rather than managed code.
    ///
    /// Faults inside the runtime's own machinery are never reinterpreted as
    /// managed exceptions; doing so risks corrupting runtime invariants or
    /// recursing into the handler.
    fn is_native_frame(&self) -> bool;

    /// Resolves the reserved field on the root exception type used to stash
    /// captured call-stack state.
    ///
    /// Returns `None` when the runtime's metadata doesn't match its own
    /// exception type definitions, which is fatal to startup.
    fn stack_state_field(&self) -> Option<FieldHandle>;

    /// Allocates an instance of the exception type mapped from `class`.
    ///
    /// Returns `None` when allocation fails; the allocator is then required
    /// to have left an exception pending on this environment.
    fn allocate_exception(&self, class: FaultClass) -> Option<ExceptionRef>;

    /// Clears and returns the exception currently pending on this
    /// environment.
    ///
    /// Only called after a failed [`allocate_exception`] call, whose contract
    /// guarantees a pending exception exists.
    ///
    /// [`allocate_exception`]: RuntimeEnv::allocate_exception
    fn take_pending_exception(&self) -> ExceptionRef;

    /// Captures a call-stack snapshot rooted at `root`.
    ///
    /// The root is synthetic because no real frame linkage exists at the
    /// fault point; `root` carries the interrupted pc and frame pointer
    /// recovered from the machine context.
    fn capture_call_stack(&self, root: &SyntheticFrame) -> CapturedStack;

    /// Stores a 64-bit value into `field` of `exception`.
    fn set_long_field(&self, exception: ExceptionRef, field: FieldHandle, value: u64);

    /// Delivers `exception` through the runtime's exception-raise entry
    /// point.
    ///
    /// This call does not return by normal means: it transfers control
    /// elsewhere in the interrupted thread.
    fn raise(&self, exception: ExceptionRef) -> !;
}

#[cfg(test)]
mod tests {
    use super::StackRegion;

    #[test]
    fn guard_range_membership() {
        let region = StackRegion {
            base: 0x100_0000,
            guard_size: 0x1_0000,
        };
        assert!(region.guard_contains(0x0FFF_FF00));
        assert!(region.guard_contains(0x100_0000 - 1));
        assert!(region.guard_contains(0x100_0000 - 0x1_0000));
        assert!(!region.guard_contains(0x100_0000));
        assert!(!region.guard_contains(0x100_0000 - 0x1_0000 - 1));
        assert!(!region.guard_contains(0));
    }

    #[test]
    fn undersized_base_never_contains() {
        let region = StackRegion {
            base: 0x100,
            guard_size: 0x1000,
        };
        assert!(!region.guard_contains(0x80));
        assert!(!region.guard_contains(0));
    }
}
