// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::crash_info::{FaultContext, RawFault, StructuredFaultInfo};
use crate::registry::{Disposition, FaultHandler, HandlerRecord, HandlerRegistry, HookKind};
use crate::shared::configuration::CrashguardConfiguration;
use crate::{signal_from_signum, terminate};
use libc::{
    c_void, mmap, sigaltstack, siginfo_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ,
    PROT_WRITE, SIGSTKSZ,
};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr};
use tracing::debug;

/// Registry name of the signal dispositions that were active before the crashguard's.
pub const PREVIOUS_SIGACTION: &str = "previous-sigaction";

// Linux seems to have the most, supporting up to 64 inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
const MAX_SIGNALS: usize = 65;
static mut HANDLERS: [Option<(signal::Signal, SigAction)>; MAX_SIGNALS] = [None; MAX_SIGNALS];
static INIT_STARTED: AtomicBool = AtomicBool::new(false);
static INIT_FINISHED: AtomicBool = AtomicBool::new(false);
static SIGNAL_REGISTRY: AtomicPtr<HandlerRegistry> = AtomicPtr::new(ptr::null_mut());

/// Registers UNIX signal handlers that run the structured-fault chain of `registry`.
/// This function uses a flag to ensure the initilization only happens once.
/// It is safe (but probably undesirable) to call this function more than once: an error is returned
/// if that happens.
///
/// If any configured signal had a disposition other than `SIG_DFL`, the old dispositions are
/// installed as the tail of the chain, so they run after the crashguard's report.
/// PRECONDITIONS:
///     None
/// SAFETY:
///     Crash-capture setup functions are not guaranteed to be reentrant.
///     No other crashguard setup functions should be called concurrently.
/// ATOMICITY:
///     Setting the handlers is not an atomic operation. A signal delivered before this function
///     finishes finds no chain yet and gets the default disposition.
pub(crate) fn register_crash_handlers(
    config: &CrashguardConfiguration,
    registry: &'static HandlerRegistry,
) -> anyhow::Result<()> {
    // Guarantee that the handlers is only mutated once.
    anyhow::ensure!(
        INIT_STARTED
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok(),
        "Attempted to double register crash handlers"
    );

    // Validate signal numbers will fit in the array.
    for signum in config.signals() {
        anyhow::ensure!(*signum >= 0 && *signum < MAX_SIGNALS as i32);
    }

    SIGNAL_REGISTRY.store(ptr::from_ref(registry).cast_mut(), SeqCst);

    if config.create_alt_stack() {
        // Safety: This function has no documented preconditions.
        unsafe { create_alt_stack(config.stack_guarantee())? };
    }

    let mut errors = vec![];
    let mut any_previous = false;

    for signum in config.signals() {
        let index = *signum as usize;
        // Safety: This function has no documented preconditions.
        match unsafe { register_signal_handler(*signum, config) } {
            Ok(handler) => {
                any_previous |= !matches!(handler.1.handler(), SigHandler::SigDfl);
                // SAFETY:
                // There are only two functions that reference `HANDLERS`.
                // At this point, `INIT_STARTED` is `true` and `INIT_FINISHED` is false.
                // This function is guarded not to go unless `INIT_STARTED` is false.
                // The other function is guarded not to go unless `INIT_FINISHED` is true, which
                // only happens at the end of this function.
                unsafe { HANDLERS[index] = Some(handler) }
            }
            Err(e) => errors.push(format!("Unable to register signal for {signum}: {e:?}")),
        };
    }
    INIT_FINISHED.store(true, SeqCst);

    if any_previous {
        registry.install(
            HookKind::StructuredFault,
            PREVIOUS_SIGACTION,
            PreviousSigActions,
        );
    }
    debug!(
        signals = ?config.signals(),
        chained = any_previous,
        "registered signal handlers"
    );
    anyhow::ensure!(
        errors.is_empty(),
        "Errors registering signal handlers {errors:?}"
    );
    Ok(())
}

extern "C" fn handle_posix_sigaction(signum: i32, sig_info: *mut siginfo_t, ucontext: *mut c_void) {
    let info = structured_fault_info(signum, sig_info, ucontext);
    // SAFETY: the registry pointer is either null or a `&'static HandlerRegistry`.
    let registry = unsafe { SIGNAL_REGISTRY.load(SeqCst).cast_const().as_ref() };
    let disposition = registry
        .and_then(|registry| registry.invoke(&FaultContext::StructuredFault(info)))
        .unwrap_or(Disposition::Handled);
    match disposition {
        Disposition::Handled | Disposition::ContinueSearch => restore_default_and_raise(signum),
        // Whoever ran last decided the program may continue.
        Disposition::Continue | Disposition::Retry | Disposition::OutOfMemory => (),
    }
}

fn structured_fault_info(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) -> StructuredFaultInfo {
    let (si_code, address) = if sig_info.is_null() {
        (None, None)
    } else {
        // https://man7.org/linux/man-pages/man2/sigaction.2.html
        // SIGILL, SIGFPE, SIGSEGV, SIGBUS, and SIGTRAP fill in si_addr with the address of the fault.
        // SAFETY: the kernel hands us a valid siginfo for the duration of the handler.
        let address = match signum {
            libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP => {
                Some(unsafe { (*sig_info).si_addr() as usize })
            }
            _ => None,
        };
        (Some(unsafe { (*sig_info).si_code }), address)
    };
    StructuredFaultInfo {
        code: signum as u32,
        si_code,
        address,
        raw: RawFault::Signal {
            signum,
            siginfo: sig_info,
            ucontext,
        },
    }
}

/// In the case of a default handler, we want to invoke it so that the core-dump can be
/// generated. Restoring the handler then re-raising the signal accomplishes that.
fn restore_default_and_raise(signum: i32) {
    let Ok(signal) = signal::Signal::try_from(signum) else {
        terminate()
    };
    let default = SigAction::new(
        SigHandler::SigDfl,
        SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe { signal::sigaction(signal, &default) }.unwrap_or_else(|_| terminate());
    // Signals are only delivered once.
    // In the case where we were invoked because of a crash, returning
    // is technically UB but in practice re-invokes the crashing instr
    // and re-raises the signal. In the case where we were invoked by
    // `raise(SIGSEGV)` we need to re-raise the signal, or the default
    // handler will never receive it.
    unsafe { libc::raise(signum) };
}

/// The dispositions that were active before ours, as one link of the structured-fault chain.
struct PreviousSigActions;

impl FaultHandler for PreviousSigActions {
    fn handle(&self, ctx: &FaultContext<'_>, next: Option<&'static HandlerRecord>) -> Disposition {
        if let FaultContext::StructuredFault(StructuredFaultInfo {
            raw:
                RawFault::Signal {
                    signum,
                    siginfo,
                    ucontext,
                },
            ..
        }) = ctx
        {
            // SAFETY: the payload comes straight from the kernel via `handle_posix_sigaction`.
            return unsafe { chain_signal_handler(*signum, *siginfo, *ucontext) };
        }
        next.map_or(Disposition::Handled, |record| record.invoke(ctx))
    }
}

/// Once we've handled the signal, chain to any previous handlers.
/// SAFETY: This was created by [register_crash_handlers].  There is a tiny
/// instant of time between when the handlers are registered, and the
/// `HANDLERS` are set.  This should be very short, but is hard to fully
/// eliminate given the existing POSIX APIs.
/// If we run into an unexpected condition we just `_exit` to quit the program without re-raising
/// `SIGABRT`.
unsafe fn chain_signal_handler(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) -> Disposition {
    if !INIT_FINISHED.load(SeqCst) || signum < 0 || signum >= MAX_SIGNALS as i32 {
        terminate()
    }
    // SAFETY: All accesses to `HANDLERS` are guarded by `INIT_STARTED` and `INIT_FINISHED`.
    // Since `INIT_FINISHED` was guaranteed to be true, we know that no code will ever mutate the
    // static, and hence its safe to read.
    let Some((_, sigaction)) = (unsafe { HANDLERS[signum as usize] }) else {
        return Disposition::Handled;
    };
    // How we chain depends on what kind of handler we're chaining to.
    // https://www.gnu.org/software/libc/manual/html_node/Signal-Handling.html
    // https://man7.org/linux/man-pages/man2/sigaction.2.html
    match sigaction.handler() {
        SigHandler::SigDfl => Disposition::Handled,
        SigHandler::SigIgn => Disposition::Continue,
        SigHandler::Handler(f) => {
            f(signum);
            Disposition::Continue
        }
        SigHandler::SigAction(f) => {
            f(signum, sig_info, ucontext);
            Disposition::Continue
        }
    }
}

/// Allocates a signal altstack of at least `size` bytes, and puts a guard page at the end.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
///
/// The altstack belongs to the calling thread only.
unsafe fn create_alt_stack(size: usize) -> anyhow::Result<()> {
    let page_size = page_size::get();
    let size = std::cmp::max(SIGSTKSZ, size).next_multiple_of(page_size);
    let stackp = mmap(
        ptr::null_mut(),
        size + page_size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANON,
        -1,
        0,
    );
    anyhow::ensure!(
        stackp != MAP_FAILED,
        "failed to allocate an alternative stack"
    );
    let guard_result = libc::mprotect(stackp, page_size, PROT_NONE);
    anyhow::ensure!(
        guard_result == 0,
        "failed to set up alternative stack guard page"
    );
    let stackp = stackp.add(page_size);

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: size,
    };
    let rval = sigaltstack(&stack, ptr::null_mut());
    anyhow::ensure!(rval == 0, "sigaltstack failed {rval}");
    Ok(())
}

unsafe fn register_signal_handler(
    signum: i32,
    config: &CrashguardConfiguration,
) -> anyhow::Result<(signal::Signal, SigAction)> {
    let signal_type = signal_from_signum(signum)?;

    // Some runtimes install an altstack of their own and check the stack pointer in their chained
    // handler, in which case the altstack must be used without creating it. Creating one without
    // using it is rejected by the configuration.
    let extra_saflags = if config.use_alt_stack() {
        SaFlags::SA_ONSTACK
    } else {
        SaFlags::empty()
    };

    let sig_action = SigAction::new(
        SigHandler::SigAction(handle_posix_sigaction),
        SaFlags::SA_NODEFER | extra_saflags,
        signal::SigSet::empty(),
    );

    let old_handler = signal::sigaction(signal_type, &sig_action)?;
    Ok((signal_type, old_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_max_signals() {
        assert!(MAX_SIGNALS as libc::c_int > libc::SIGRTMAX());
    }

    #[test]
    fn test_structured_fault_info_without_siginfo() {
        let info = structured_fault_info(libc::SIGSEGV, ptr::null_mut(), ptr::null_mut());
        assert_eq!(info.code, libc::SIGSEGV as u32);
        assert!(info.si_code.is_none());
        assert!(info.address.is_none());
        assert!(matches!(info.raw, RawFault::Signal { signum, .. } if signum == libc::SIGSEGV));
    }

    #[test]
    fn test_structured_fault_info_reads_siginfo() {
        // SAFETY: siginfo_t is plain old data.
        let mut sig_info: siginfo_t = unsafe { std::mem::zeroed() };
        sig_info.si_signo = libc::SIGABRT;
        sig_info.si_code = 7;
        let info = structured_fault_info(libc::SIGABRT, &mut sig_info, ptr::null_mut());
        assert_eq!(info.si_code, Some(7));
        // SIGABRT does not carry a fault address.
        assert!(info.address.is_none());
    }
}
