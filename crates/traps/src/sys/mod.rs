//! OS-related abstractions required by the fault handlers.
//!
//! Everything specific to an operating system family lives below this
//! module. Support is enumerated per platform rather than generalized: a
//! target with no implementation here is a build-time error, never a runtime
//! fallback, because the fault path cannot degrade gracefully on a platform
//! whose machine context it does not understand.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else {
        compile_error!(
            "the fault-handling runtime is being compiled for a platform \
             that it does not support"
        );
    }
}
