// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::crash_info::{FaultContext, UncaughtErrorInfo};
use crate::registry::{Disposition, FaultHandler, HandlerRecord, HandlerRegistry, HookKind};
use std::panic::{self, PanicHookInfo};

/// Registry name of the panic hook that was active before the crashguard's.
pub const PREVIOUS_PANIC_HOOK: &str = "previous-panic-hook";

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync>;

/// The panic hook that was set before ours, kept as the tail of the uncaught-error chain.
struct PreviousPanicHook(PanicHook);

impl FaultHandler for PreviousPanicHook {
    fn handle(&self, ctx: &FaultContext<'_>, next: Option<&'static HandlerRecord>) -> Disposition {
        if let FaultContext::UncaughtError(UncaughtErrorInfo {
            panic: Some(info), ..
        }) = ctx
        {
            (self.0)(info);
        }
        next.map_or(Disposition::Continue, |record| record.invoke(ctx))
    }
}

/// Replaces the process panic hook with one that runs the uncaught-error chain of `registry`.
///
/// The hook that was set before becomes the tail of that chain.
/// PRECONDITIONS:
///     None
/// SAFETY:
///     Crash-capture setup functions are not guaranteed to be reentrant.
///     No other crashguard setup functions should be called concurrently.
/// ATOMICITY:
///     `take_hook` and `set_hook` are two separate steps. A panic on another thread between them
///     goes to the default hook.
pub(crate) fn register_panic_hook(registry: &'static HandlerRegistry) {
    let previous = panic::take_hook();
    registry.install(
        HookKind::UncaughtError,
        PREVIOUS_PANIC_HOOK,
        PreviousPanicHook(previous),
    );
    panic::set_hook(Box::new(move |panic_info| {
        let ctx = FaultContext::UncaughtError(UncaughtErrorInfo::from_panic(panic_info));
        // Returning lets the panic unwind (or abort) as it would have without us.
        let _ = registry.invoke(&ctx);
    }));
}
