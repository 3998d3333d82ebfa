// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The data a hook receives about the condition it intercepted.

mod sig_info;
mod stacktrace;

pub use sig_info::*;
pub use stacktrace::*;

use crate::lifecycle::LifecyclePhase;
use crate::registry::HookKind;
use std::panic::PanicHookInfo;

/// Read-only description of one intercepted condition. Lives for a single hook invocation.
#[derive(Debug, Clone, Copy)]
pub enum FaultContext<'a> {
    UncaughtError(UncaughtErrorInfo<'a>),
    AbstractDispatchMisuse(DispatchMisuseInfo<'a>),
    InvalidArgument(InvalidArgumentInfo<'a>),
    AllocationFailure(AllocationFailureInfo),
    StructuredFault(StructuredFaultInfo),
}

impl FaultContext<'_> {
    pub fn kind(&self) -> HookKind {
        match self {
            FaultContext::UncaughtError(_) => HookKind::UncaughtError,
            FaultContext::AbstractDispatchMisuse(_) => HookKind::AbstractDispatchMisuse,
            FaultContext::InvalidArgument(_) => HookKind::InvalidArgument,
            FaultContext::AllocationFailure(_) => HookKind::AllocationFailure,
            FaultContext::StructuredFault(_) => HookKind::StructuredFault,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation<'a> {
    pub file: &'a str,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UncaughtErrorInfo<'a> {
    pub message: Option<&'a str>,
    pub location: Option<SourceLocation<'a>>,
    /// Present when the error is a panic; the previous panic hook needs it.
    pub panic: Option<&'a PanicHookInfo<'a>>,
}

impl<'a> UncaughtErrorInfo<'a> {
    pub fn from_panic(info: &'a PanicHookInfo<'a>) -> Self {
        let payload = info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str));
        let location = info.location().map(|l| SourceLocation {
            file: l.file(),
            line: l.line(),
            column: l.column(),
        });
        Self {
            message,
            location,
            panic: Some(info),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchMisuseInfo<'a> {
    pub type_name: Option<&'a str>,
    pub capability: Option<&'a str>,
    pub phase: Option<LifecyclePhase>,
}

/// Every field is optional: release builds of a caller may not carry the context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidArgumentInfo<'a> {
    pub expression: Option<&'a str>,
    pub function: Option<&'a str>,
    pub file: Option<&'a str>,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationFailureInfo {
    pub size: usize,
    pub align: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct StructuredFaultInfo {
    /// The signal number on Unix, the exception code on Windows.
    pub code: u32,
    pub si_code: Option<i32>,
    pub address: Option<usize>,
    pub raw: RawFault,
}

/// The platform payload, kept so the previous platform handler can be called with it.
#[derive(Debug, Clone, Copy)]
pub enum RawFault {
    None,
    #[cfg(unix)]
    Signal {
        signum: libc::c_int,
        siginfo: *mut libc::siginfo_t,
        ucontext: *mut libc::c_void,
    },
    #[cfg(windows)]
    Exception {
        pointers: *const windows::Win32::System::Diagnostics::Debug::EXCEPTION_POINTERS,
    },
}
