// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::crash_info::{FaultContext, RawFault, StructuredFaultInfo};
use crate::registry::{Disposition, FaultHandler, HandlerRecord, HandlerRegistry, HookKind};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr};
use tracing::debug;
use windows::Win32::System::Diagnostics::Debug::{SetUnhandledExceptionFilter, EXCEPTION_POINTERS};

/// Registry name of the unhandled exception filter that was active before the crashguard's.
pub const PREVIOUS_EXCEPTION_FILTER: &str = "previous-exception-filter";

// Filter return values, from excpt.h.
const EXCEPTION_EXECUTE_HANDLER: i32 = 1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;
const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;

type ExceptionFilter = unsafe extern "system" fn(*const EXCEPTION_POINTERS) -> i32;

static INIT_STARTED: AtomicBool = AtomicBool::new(false);
static FILTER_REGISTRY: AtomicPtr<HandlerRegistry> = AtomicPtr::new(ptr::null_mut());

/// Installs the process-wide unhandled exception filter, which runs the structured-fault chain of
/// `registry`. A filter that was set before becomes the tail of that chain.
pub(crate) fn register_exception_filter(registry: &'static HandlerRegistry) -> anyhow::Result<()> {
    anyhow::ensure!(
        INIT_STARTED
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok(),
        "Attempted to double register the exception filter"
    );
    FILTER_REGISTRY.store(ptr::from_ref(registry).cast_mut(), SeqCst);
    // SAFETY: `exception_filter` matches the expected signature and lives for the whole process.
    let previous = unsafe { SetUnhandledExceptionFilter(Some(exception_filter)) };
    if let Some(previous) = previous {
        registry.install(
            HookKind::StructuredFault,
            PREVIOUS_EXCEPTION_FILTER,
            PreviousFilter(previous),
        );
    }
    debug!(chained = previous.is_some(), "registered exception filter");
    Ok(())
}

unsafe extern "system" fn exception_filter(pointers: *const EXCEPTION_POINTERS) -> i32 {
    let (code, address) = match pointers.as_ref().and_then(|p| p.ExceptionRecord.as_ref()) {
        Some(record) => (
            record.ExceptionCode.0 as u32,
            Some(record.ExceptionAddress as usize),
        ),
        None => (0, None),
    };
    let ctx = FaultContext::StructuredFault(StructuredFaultInfo {
        code,
        si_code: None,
        address,
        raw: RawFault::Exception { pointers },
    });
    let registry = FILTER_REGISTRY.load(SeqCst).cast_const().as_ref();
    match registry.and_then(|registry| registry.invoke(&ctx)) {
        Some(Disposition::Continue) => EXCEPTION_CONTINUE_EXECUTION,
        Some(Disposition::ContinueSearch) => EXCEPTION_CONTINUE_SEARCH,
        _ => EXCEPTION_EXECUTE_HANDLER,
    }
}

struct PreviousFilter(ExceptionFilter);

impl FaultHandler for PreviousFilter {
    fn handle(&self, ctx: &FaultContext<'_>, next: Option<&'static HandlerRecord>) -> Disposition {
        if let FaultContext::StructuredFault(StructuredFaultInfo {
            raw: RawFault::Exception { pointers },
            ..
        }) = ctx
        {
            // SAFETY: the pointers come straight from the OS via `exception_filter`.
            return match unsafe { (self.0)(*pointers) } {
                EXCEPTION_CONTINUE_EXECUTION => Disposition::Continue,
                EXCEPTION_CONTINUE_SEARCH => Disposition::ContinueSearch,
                _ => Disposition::Handled,
            };
        }
        next.map_or(Disposition::Handled, |record| record.invoke(ctx))
    }
}
