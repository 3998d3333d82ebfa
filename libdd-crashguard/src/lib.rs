// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process crash capture.
//!
//! The crashguard intercepts five kinds of fatal condition:
//! 1. Uncaught errors (panics), via the process panic hook.
//! 2. Abstract-dispatch misuse: a [`Dispatch`] capability called while its owner is still
//!    constructing or already destructing, or before it is bound.
//! 3. Invalid arguments, raised by [`check_arg!`] when a library call's contract is violated.
//! 4. Allocation failures, seen by the [`GuardedAllocator`] global allocator wrapper.
//! 5. Structured faults: `SIGSEGV` and friends on Unix, unhandled SEH exceptions on Windows.
//!
//! Each kind has a chain of handlers in the [`registry`]. Installing a hook pushes a new record on
//! top of the chain and hands back the record it displaced. When the condition fires, the newest
//! record runs first. The crashguard's own hook writes a diagnostic report to the configured sink
//! (fault details, process and thread, timestamp, and a stack trace resolved in-process), then
//! calls the record it displaced, so whatever the application had installed before keeps working.
//! With nothing left to chain to, the kind's last resort applies: panics, misuse and invalid
//! arguments end the process; allocation failures hand back the out-of-memory result; structured
//! faults fall through to the platform's default handling.
//!
//! The signal handler runs in a constrained environment. Symbol resolution there uses
//! `backtrace`'s unsynchronized API, which is not async-signal-safe; stack trace collection can be
//! downgraded with `DD_CRASHGUARD_STACKTRACE_COLLECTION`.

mod collector;
pub mod contract;
mod crash_info;
pub mod lifecycle;
pub mod registry;
pub mod runtime;
mod shared;

pub use collector::*;
pub use contract::{checked_copy, checked_parse_port, ArgumentError};
pub use crash_info::*;
pub use lifecycle::{Capability, Dispatch, LifecycleError, LifecyclePhase};
pub use registry::{
    registry, Disposition, FaultHandler, FnHandler, HandlerRecord, HandlerRegistry, HookKind,
};
pub use runtime::{GuardedAllocator, MAX_ALLOC_RETRIES};
pub use shared::configuration::*;
pub use shared::constants::*;
