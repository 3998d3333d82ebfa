// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Markers and defaults used by the diagnostic reporter.
//!
//! Reports are line oriented. The markers delimit the sections of a report so that a human (or a
//! test harness grepping a log) can tell where one report ends and the next one begins when
//! several threads fault at the same time and their output interleaves.

/// Marks the beginning of a crash report.
pub const DD_CRASHGUARD_BEGIN_REPORT: &str = "DD_CRASHGUARD_BEGIN_REPORT";
/// Marks the end of a crash report.
pub const DD_CRASHGUARD_END_REPORT: &str = "DD_CRASHGUARD_END_REPORT";

/// Marks the beginning of the stack trace section. Each line in this section is one frame,
/// most recent frame first.
pub const DD_CRASHGUARD_BEGIN_STACKTRACE: &str = "DD_CRASHGUARD_BEGIN_STACKTRACE";
/// Marks the end of the stack trace section.
pub const DD_CRASHGUARD_END_STACKTRACE: &str = "DD_CRASHGUARD_END_STACKTRACE";

/// Written, followed by the fault kind, when the report itself could not be written.
pub const DD_CRASHGUARD_REPORT_FAILED: &str = "DD_CRASHGUARD_REPORT_FAILED";

/// Written, followed by the handler name, right before control is handed to the previous handler.
pub const DD_CRASHGUARD_CHAIN: &str = "DD_CRASHGUARD_CHAIN";
/// Written, followed by the fault kind, when there is no previous handler to chain to.
pub const DD_CRASHGUARD_LAST_RESORT: &str = "DD_CRASHGUARD_LAST_RESORT";

/// Environment variable used to downgrade stack trace collection without a rebuild.
/// Accepted values: `disabled`, `without_symbols`, `enabled`.
pub const DD_CRASHGUARD_STACKTRACE_COLLECTION_ENV: &str = "DD_CRASHGUARD_STACKTRACE_COLLECTION";

/// Default number of frames collected per report.
pub const DD_CRASHGUARD_DEFAULT_MAX_FRAMES: usize = 100;

/// Default amount of stack reserved for fault handling (altstack size / thread stack guarantee).
pub const DD_CRASHGUARD_DEFAULT_STACK_GUARANTEE: usize = 64 * 1024;

/// Name under which the crashguard's own reporting hooks appear in the handler registry.
pub const DD_CRASHGUARD_HANDLER_NAME: &str = "libdd-crashguard";
