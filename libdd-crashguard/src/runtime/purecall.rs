// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collector::terminate;
use crate::crash_info::{DispatchMisuseInfo, FaultContext};
use crate::registry::{registry, Disposition, HandlerRecord, HandlerRegistry, HookKind};
use std::borrow::Cow;

/// Installs `handler` for abstract-dispatch misuse and returns the handler it displaced.
pub fn set_purecall_handler<F>(
    name: impl Into<Cow<'static, str>>,
    handler: F,
) -> Option<&'static HandlerRecord>
where
    F: Fn(&FaultContext<'_>, Option<&'static HandlerRecord>) -> Disposition
        + Send
        + Sync
        + 'static,
{
    registry().install_fn(HookKind::AbstractDispatchMisuse, name, handler)
}

/// Raises an abstract-dispatch misuse. Returns once the installed handlers return; terminates the
/// process when none is installed.
pub fn purecall(info: DispatchMisuseInfo<'_>) {
    purecall_in(registry(), info)
}

pub fn purecall_in(registry: &HandlerRegistry, info: DispatchMisuseInfo<'_>) {
    if registry
        .invoke(&FaultContext::AbstractDispatchMisuse(info))
        .is_none()
    {
        terminate()
    }
}
