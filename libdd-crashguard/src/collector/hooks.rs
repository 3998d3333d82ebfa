// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::crash_handler::Crashguard;
use super::platform::terminate;
use crate::crash_info::FaultContext;
use crate::registry::{Disposition, FaultHandler, HandlerRecord, HookKind};
use crate::shared::constants::{DD_CRASHGUARD_CHAIN, DD_CRASHGUARD_LAST_RESORT};

/// The crashguard's own link in every chain: report, then delegate to whatever was installed
/// before, or fall back to the last resort for the kind.
pub(crate) struct ReportingHook {
    guard: &'static Crashguard,
}

impl ReportingHook {
    pub(crate) fn new(guard: &'static Crashguard) -> Self {
        Self { guard }
    }
}

impl FaultHandler for ReportingHook {
    fn handle(&self, ctx: &FaultContext<'_>, next: Option<&'static HandlerRecord>) -> Disposition {
        self.guard.report(ctx);
        match next {
            Some(previous) => {
                self.guard.write_marker(DD_CRASHGUARD_CHAIN, previous.name());
                previous.invoke(ctx)
            }
            None => {
                self.guard
                    .write_marker(DD_CRASHGUARD_LAST_RESORT, ctx.kind().as_str());
                last_resort(ctx.kind())
            }
        }
    }
}

/// What happens to a condition nobody else handles.
///
/// Uncaught errors, dispatch misuse and invalid arguments end the process. Allocation failures
/// hand the out-of-memory result back to the requester. Structured faults are returned to the
/// platform as handled so it performs its default termination.
pub fn last_resort(kind: HookKind) -> Disposition {
    match kind {
        HookKind::UncaughtError | HookKind::AbstractDispatchMisuse | HookKind::InvalidArgument => {
            terminate()
        }
        HookKind::AllocationFailure => Disposition::OutOfMemory,
        HookKind::StructuredFault => Disposition::Handled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_fatal_last_resorts() {
        assert_eq!(
            last_resort(HookKind::AllocationFailure),
            Disposition::OutOfMemory
        );
        assert_eq!(last_resort(HookKind::StructuredFault), Disposition::Handled);
    }
}
