// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collector::terminate;
use crate::crash_info::{FaultContext, InvalidArgumentInfo};
use crate::registry::{registry, Disposition, HandlerRecord, HandlerRegistry, HookKind};
use std::borrow::Cow;

/// Installs `handler` for invalid arguments and returns the handler it displaced.
pub fn set_invalid_parameter_handler<F>(
    name: impl Into<Cow<'static, str>>,
    handler: F,
) -> Option<&'static HandlerRecord>
where
    F: Fn(&FaultContext<'_>, Option<&'static HandlerRecord>) -> Disposition
        + Send
        + Sync
        + 'static,
{
    registry().install_fn(HookKind::InvalidArgument, name, handler)
}

/// Raises an invalid-argument condition. Returns once the installed handlers return, so the
/// caller can fail the call; terminates the process when none is installed.
pub fn invalid_parameter(info: InvalidArgumentInfo<'_>) {
    invalid_parameter_in(registry(), info)
}

/// Raises an invalid-argument condition without any context.
pub fn invalid_parameter_noinfo() {
    invalid_parameter(InvalidArgumentInfo::default())
}

pub fn invalid_parameter_in(registry: &HandlerRegistry, info: InvalidArgumentInfo<'_>) {
    if registry
        .invoke(&FaultContext::InvalidArgument(info))
        .is_none()
    {
        terminate()
    }
}

/// Checks an argument contract. On failure the invalid-argument chain runs with the failed
/// expression, the enclosing function (when given) and the call site, then the macro evaluates to
/// `Err(ArgumentError::Invalid { .. })`.
///
/// ```no_run
/// use libdd_crashguard::{check_arg, ArgumentError};
///
/// fn halve(n: Option<u32>) -> Result<u32, ArgumentError> {
///     check_arg!(n.is_some(), "halve")?;
///     Ok(n.unwrap_or_default() / 2)
/// }
/// ```
#[macro_export]
macro_rules! check_arg {
    (@check $cond:expr, $function:expr) => {
        if $cond {
            ::core::result::Result::Ok(())
        } else {
            $crate::runtime::invalid_parameter($crate::InvalidArgumentInfo {
                expression: ::core::option::Option::Some(::core::stringify!($cond)),
                function: $function,
                file: ::core::option::Option::Some(::core::file!()),
                line: ::core::option::Option::Some(::core::line!()),
            });
            ::core::result::Result::Err($crate::ArgumentError::Invalid {
                expression: ::core::stringify!($cond),
            })
        }
    };
    ($cond:expr $(,)?) => {
        $crate::check_arg!(@check $cond, ::core::option::Option::None)
    };
    ($cond:expr, $function:expr $(,)?) => {
        $crate::check_arg!(@check $cond, ::core::option::Option::Some($function))
    };
}
