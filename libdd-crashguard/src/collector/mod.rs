// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod atom_guard;
mod crash_handler;
mod emitters;
#[cfg(windows)]
mod exception_filter;
mod hooks;
mod panic_hook;
mod platform;
#[cfg(unix)]
mod signal_handler_manager;
mod sink;
mod stack_capture;
mod symbol_resolver;

pub use crash_handler::{init, Crashguard, CrashguardError};
pub use emitters::{report_failed_line, DiagnosticReporter, ReportError};
#[cfg(windows)]
pub use exception_filter::PREVIOUS_EXCEPTION_FILTER;
pub use hooks::last_resort;
pub use panic_hook::PREVIOUS_PANIC_HOOK;
pub use platform::{current_thread_id, terminate, MAX_BACKTRACE_FRAMES};
#[cfg(windows)]
pub use platform::reserve_stack_guarantee;
#[cfg(unix)]
pub use signal_handler_manager::PREVIOUS_SIGACTION;
pub use sink::{DiagnosticSink, SinkWriter};
pub use stack_capture::{capture, capture_stack_trace, capture_unsynchronized, RawStack};
pub use symbol_resolver::{SymbolResolver, SymbolSession};
