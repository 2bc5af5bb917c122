//! Hardware fault handling for the Lyra runtime.
//!
//! Compiled managed code performs no explicit null checks and no explicit
//! stack-limit checks. Instead, this crate installs OS fault-signal handlers
//! and reinterprets the resulting hardware traps: a fault with no faulting
//! address becomes a managed null-pointer exception, a fault inside the
//! current thread's stack guard region becomes a managed stack-overflow
//! exception, and every other fault is re-delivered to the OS with its
//! default disposition so the process terminates with standard diagnostics.
//!
//! The expected call sequence from the runtime core is:
//!
//! 1. [`init_signals`] once at startup, to resolve the reserved field that
//!    receives captured call-stack state;
//! 2. [`install_handlers`] on each runtime thread at setup;
//! 3. [`catch_faults`] around entries into managed code, binding the
//!    thread's [`RuntimeEnv`] for the handler;
//! 4. [`restore_signal_mask`] whenever the thread's mask may have drifted;
//! 5. [`teardown_signals`] at shutdown.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod env;
mod sys;
mod traphandlers;

pub use crate::env::{CapturedStack, ExceptionRef, FieldHandle, RuntimeEnv, StackRegion};
pub use crate::traphandlers::{
    catch_faults, init_signals, install_handlers, restore_signal_mask, teardown_signals,
    FaultClass, SetupError, SyntheticFrame,
};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
