// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Human-readable name for the code carried by a structured fault.
#[cfg(unix)]
pub fn fault_code_name(code: u32) -> &'static str {
    i32::try_from(code)
        .ok()
        .and_then(|signum| nix::sys::signal::Signal::try_from(signum).ok())
        .map_or("UNKNOWN", |signal| signal.as_str())
}

#[cfg(windows)]
pub fn fault_code_name(code: u32) -> &'static str {
    match code {
        0xC0000005 => "EXCEPTION_ACCESS_VIOLATION",
        0xC0000006 => "EXCEPTION_IN_PAGE_ERROR",
        0xC000001D => "EXCEPTION_ILLEGAL_INSTRUCTION",
        0xC0000094 => "EXCEPTION_INT_DIVIDE_BY_ZERO",
        0xC00000FD => "EXCEPTION_STACK_OVERFLOW",
        0xC0000409 => "STATUS_STACK_BUFFER_OVERRUN",
        0x80000003 => "EXCEPTION_BREAKPOINT",
        _ => "UNKNOWN",
    }
}

/// Signals intercepted when the configuration names none.
pub fn default_signals() -> Vec<i32> {
    #[cfg(unix)]
    {
        vec![
            libc::SIGSEGV,
            libc::SIGBUS,
            libc::SIGILL,
            libc::SIGFPE,
            libc::SIGABRT,
        ]
    }
    #[cfg(not(unix))]
    {
        vec![]
    }
}

#[cfg(unix)]
pub use unix::*;

#[cfg(unix)]
mod unix {
    /// Converts a signum into a Signal, rejecting numbers the platform doesn't know.
    pub fn signal_from_signum(value: libc::c_int) -> anyhow::Result<nix::sys::signal::Signal> {
        nix::sys::signal::Signal::try_from(value)
            .map_err(|_| anyhow::anyhow!("Unexpected signal number {value}"))
    }

}
