// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Platform constants and process primitives used while handling a fault.

/// Maximum number of frames to collect in a backtrace.
///
/// This limit prevents runaway frame walking in case of stack corruption.
pub const MAX_BACKTRACE_FRAMES: usize = 100;

/// Ends the process immediately with `EXIT_FAILURE`. No destructors, atexit handlers or buffered
/// output flushes run.
#[cfg(unix)]
pub fn terminate() -> ! {
    // SAFETY: `_exit` has no preconditions and is async-signal-safe.
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

#[cfg(not(unix))]
pub fn terminate() -> ! {
    std::process::exit(libc::EXIT_FAILURE)
}

/// Returns a numeric identifier for the current OS thread.
#[cfg(target_os = "linux")]
pub fn current_thread_id() -> u64 {
    // SAFETY: syscall(SYS_gettid) has no preconditions for current thread.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(target_os = "macos")]
pub fn current_thread_id() -> u64 {
    let mut tid: u64 = 0;
    // SAFETY: a zero pthread_t means the calling thread and `tid` is a valid out pointer.
    unsafe { libc::pthread_threadid_np(0, &mut tid) };
    tid
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "macos"))))]
pub fn current_thread_id() -> u64 {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(windows)]
pub fn current_thread_id() -> u64 {
    // SAFETY: GetCurrentThreadId has no preconditions.
    unsafe { windows::Win32::System::Threading::GetCurrentThreadId() as u64 }
}

/// Reserves stack room on the calling thread so a fault raised by stack exhaustion can still be
/// reported. The Unix counterpart is the altstack created by the signal handler manager.
#[cfg(windows)]
pub fn reserve_stack_guarantee(bytes: usize) -> anyhow::Result<()> {
    let mut size = u32::try_from(bytes)?;
    // SAFETY: `size` is a valid in/out pointer for the duration of the call.
    unsafe { windows::Win32::System::Threading::SetThreadStackGuarantee(&mut size)? };
    Ok(())
}
