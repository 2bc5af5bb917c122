//! Signal-delivered fault handling on Unix.
//!
//! This module owns every interaction with the OS signal machinery:
//! registering the fault handlers, capturing and restoring the per-thread
//! blocked-signal mask, translating `siginfo_t`/`ucontext_t` into the
//! uniform values the portable handler logic consumes, and the fallback
//! path that hands an unclassified fault back to the OS.

use crate::traphandlers::{self, SetupError, TrapRegisters};
use std::cell::Cell;
use std::io;
use std::mem::{self, MaybeUninit};
use std::ptr;

thread_local! {
    /// The blocked-signal mask captured by this thread's `install_handlers`
    /// call, reapplied verbatim by `restore_signal_mask`.
    static SIGNAL_MASK: Cell<Option<libc::sigset_t>> = Cell::new(None);
}

/// Registers the fault-signal handlers and snapshots the calling thread's
/// blocked-signal mask.
pub fn install_handlers() -> Result<(), SetupError> {
    // SIGSEGV covers illegal accesses on every supported platform. On
    // Darwin a null dereference is reported as SIGBUS instead, so the
    // handler is registered for both there.
    let signals: &[(libc::c_int, &'static str)] = if cfg!(target_os = "macos") {
        &[(libc::SIGSEGV, "SIGSEGV"), (libc::SIGBUS, "SIGBUS")]
    } else {
        &[(libc::SIGSEGV, "SIGSEGV")]
    };
    install_signals(signals)?;
    capture_signal_mask()
}

/// Installs `trap_handler` for each signal in `signals`, restoring every
/// disposition changed by this call if any registration fails.
fn install_signals(signals: &[(libc::c_int, &'static str)]) -> Result<(), SetupError> {
    let mut installed: Vec<(libc::c_int, libc::sigaction)> = Vec::with_capacity(signals.len());

    for &(signal, name) in signals {
        unsafe {
            let mut handler: libc::sigaction = mem::zeroed();
            // SA_SIGINFO gives the handler the faulting address and the
            // machine context of the interrupted thread.
            //
            // SA_ONSTACK asks for delivery on the alternate signal stack so
            // the handler can run after the main stack is exhausted. The
            // request has been unreliable on at least one platform
            // historically, so nothing here depends on it taking effect;
            // the compiler's prologue stack probe is what guarantees
            // headroom for the handler on an overflow.
            handler.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            handler.sa_sigaction = trap_handler as usize;
            libc::sigemptyset(&mut handler.sa_mask);

            let mut previous = MaybeUninit::<libc::sigaction>::uninit();
            if libc::sigaction(signal, &handler, previous.as_mut_ptr()) != 0 {
                let err = io::Error::last_os_error();
                uninstall_signals(&installed);
                return Err(SetupError::Registration { signal: name, source: err });
            }
            installed.push((signal, previous.assume_init()));
        }
    }

    log::trace!("fault handlers installed for {} signal(s)", signals.len());
    Ok(())
}

/// Restores the dispositions saved by a partially completed
/// `install_signals` call.
fn uninstall_signals(installed: &[(libc::c_int, libc::sigaction)]) {
    for &(signal, ref previous) in installed {
        unsafe {
            // Best-effort: the original registration succeeded, so undoing
            // it is not expected to fail.
            libc::sigaction(signal, previous, ptr::null_mut());
        }
    }
}

/// Captures the calling thread's currently blocked-signal set.
fn capture_signal_mask() -> Result<(), SetupError> {
    unsafe {
        let mut mask = MaybeUninit::<libc::sigset_t>::uninit();
        let err = libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), mask.as_mut_ptr());
        if err != 0 {
            return Err(SetupError::MaskCapture(io::Error::from_raw_os_error(err)));
        }
        SIGNAL_MASK.with(|cell| cell.set(Some(mask.assume_init())));
    }
    Ok(())
}

/// Reapplies the thread's saved blocked-signal mask, if one was captured.
pub fn restore_signal_mask() {
    restore_signal_mask_with(|mask| {
        let err = unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, mask, ptr::null_mut()) };
        if err != 0 {
            return Err(io::Error::from_raw_os_error(err));
        }
        Ok(())
    })
}

/// Mask restoration with an injectable applier. Restoration is best-effort
/// by contract: a failure from `apply` is logged and swallowed, never
/// surfaced to the caller.
fn restore_signal_mask_with(apply: impl FnOnce(&libc::sigset_t) -> io::Result<()>) {
    let mask = SIGNAL_MASK.with(|cell| cell.get());
    if let Some(mask) = mask {
        if let Err(err) = apply(&mask) {
            log::warn!("failed to restore the thread signal mask: {err}");
        }
    }
}

/// The signal-delivered entry point for hardware faults.
///
/// Either the fault is classified and a managed exception is raised (a
/// non-local transfer of control on the interrupted thread), or the signal's
/// disposition is reset to the OS default and the signal is re-delivered,
/// which terminates the process with standard OS diagnostics. Re-delivery
/// cannot loop: the custom disposition is gone by the time the signal
/// arrives again.
unsafe extern "C" fn trap_handler(
    signum: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let fault_addr = fault_address(siginfo);
    let regs = get_trap_registers(context);

    // Returns only when the runtime declines the fault.
    traphandlers::handle_fault(fault_addr, regs);

    let mut previous: libc::sigaction = mem::zeroed();
    previous.sa_sigaction = libc::SIG_DFL;
    libc::sigemptyset(&mut previous.sa_mask);
    libc::sigaction(signum, &previous, ptr::null_mut());
    libc::kill(0, signum);
}

/// Extracts the faulting address from the fault metadata.
///
/// A null address is reported as absent: it means the hardware observed a
/// dereference through null, and there is no meaningful range to test it
/// against.
unsafe fn fault_address(siginfo: *mut libc::siginfo_t) -> Option<usize> {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            let addr = (*siginfo).si_addr();
        } else {
            let addr = (*siginfo).si_addr;
        }
    }
    if addr.is_null() {
        None
    } else {
        Some(addr as usize)
    }
}

/// Translates an OS-delivered machine context into the interrupted program
/// counter and frame pointer.
///
/// Exactly one arm exists per supported (OS family x CPU architecture)
/// pair; new targets are added by enumeration, not by a runtime fallback.
unsafe fn get_trap_registers(cx: *mut libc::c_void) -> TrapRegisters {
    cfg_if::cfg_if! {
        if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
            let cx = &*(cx as *const libc::ucontext_t);
            TrapRegisters {
                pc: cx.uc_mcontext.gregs[libc::REG_RIP as usize] as usize,
                fp: cx.uc_mcontext.gregs[libc::REG_RBP as usize] as usize,
            }
        } else if #[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "aarch64"))] {
            let cx = &*(cx as *const libc::ucontext_t);
            TrapRegisters {
                pc: cx.uc_mcontext.pc as usize,
                fp: cx.uc_mcontext.regs[29] as usize,
            }
        } else if #[cfg(all(target_os = "macos", target_arch = "x86_64"))] {
            let cx = &*(cx as *const libc::ucontext_t);
            TrapRegisters {
                pc: (*cx.uc_mcontext).__ss.__rip as usize,
                fp: (*cx.uc_mcontext).__ss.__rbp as usize,
            }
        } else if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
            let cx = &*(cx as *const libc::ucontext_t);
            TrapRegisters {
                pc: (*cx.uc_mcontext).__ss.__pc as usize,
                fp: (*cx.uc_mcontext).__ss.__fp as usize,
            }
        } else {
            compile_error!("unsupported platform");
        }
    }
}
