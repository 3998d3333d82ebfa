// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Validation helpers for crashguard tests.
//! This module provides reusable validation functions and a fluent API for asserting
//! report properties on the text a test process wrote to its sink.

use crate::test_types::{
    FaultType, TestMode, ALLOCATION_RECOVERED_MARKER, PRIOR_HANDLER_MARKER, PRIOR_HANDLER_NAME,
    UNMAPPED_ADDRESS,
};
use anyhow::{Context, Result};
use libdd_crashguard::{
    DD_CRASHGUARD_BEGIN_REPORT, DD_CRASHGUARD_BEGIN_STACKTRACE, DD_CRASHGUARD_CHAIN,
    DD_CRASHGUARD_END_REPORT, DD_CRASHGUARD_END_STACKTRACE, DD_CRASHGUARD_LAST_RESORT,
    PREVIOUS_PANIC_HOOK,
};
use std::{fs, path::Path};

/// Reads a file the test process wrote, failing with the path in the message.
pub fn read_output(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("reading test output at {path:?}"))?;
    String::from_utf8(bytes).with_context(|| format!("test output at {path:?} is not utf-8"))
}

/// The reports found in a sink's text, each from its begin marker to its end marker inclusive.
pub fn split_reports(output: &str) -> Vec<&str> {
    let mut reports = vec![];
    let mut rest = output;
    while let Some(begin) = rest.find(DD_CRASHGUARD_BEGIN_REPORT) {
        let from_begin = &rest[begin..];
        let Some(end) = from_begin.find(DD_CRASHGUARD_END_REPORT) else {
            break;
        };
        let end = end + DD_CRASHGUARD_END_REPORT.len();
        reports.push(&from_begin[..end]);
        rest = &from_begin[end..];
    }
    reports
}

/// Frame lines of the stack section of one report.
pub fn stack_frames(report: &str) -> Result<Vec<&str>> {
    let begin = report
        .find(DD_CRASHGUARD_BEGIN_STACKTRACE)
        .context("report has no stack trace section")?;
    let end = report
        .find(DD_CRASHGUARD_END_STACKTRACE)
        .context("stack trace section is not terminated")?;
    anyhow::ensure!(begin < end, "stack trace markers out of order");
    Ok(report[begin..end]
        .lines()
        .filter(|l| l.starts_with("Frame "))
        .collect())
}

/// A fluent API for validating the sink output of one test run.
///
/// # Example
/// ```ignore
/// ReportValidator::new(&stderr)
///     .validate_report_count(1)?
///     .validate_kind(FaultType::NullDeref)?
///     .validate_stack_frames()?;
/// ```
pub struct ReportValidator<'a> {
    output: &'a str,
    reports: Vec<&'a str>,
}

impl<'a> ReportValidator<'a> {
    pub fn new(output: &'a str) -> Self {
        Self {
            output,
            reports: split_reports(output),
        }
    }

    pub fn validate_report_count(self, expected: usize) -> Result<Self> {
        anyhow::ensure!(
            self.reports.len() == expected,
            "Expected {expected} reports, found {}:\n{}",
            self.reports.len(),
            self.output
        );
        Ok(self)
    }

    /// Every report names the fault kind on its second line.
    pub fn validate_kind(self, fault: FaultType) -> Result<Self> {
        let expected = format!("Fault: {}", fault.kind_text());
        for report in &self.reports {
            anyhow::ensure!(
                report.lines().nth(1) == Some(expected.as_str()),
                "Expected {expected:?} in report:\n{report}"
            );
        }
        Ok(self)
    }

    /// Every report carries a non-empty stack trace whose frames are numbered from zero.
    pub fn validate_stack_frames(self) -> Result<Self> {
        for report in &self.reports {
            let frames = stack_frames(report)?;
            anyhow::ensure!(!frames.is_empty(), "Empty stack trace in report:\n{report}");
            for (i, frame) in frames.iter().enumerate() {
                anyhow::ensure!(
                    frame.starts_with(&format!("Frame {i}: ")),
                    "Unexpected frame line {frame:?}"
                );
                anyhow::ensure!(frame.contains(" - 0x"), "Frame without address {frame:?}");
            }
        }
        Ok(self)
    }

    pub fn validate_line(self, line: &str) -> Result<Self> {
        anyhow::ensure!(
            self.output.lines().any(|l| l == line),
            "Expected line {line:?} in:\n{}",
            self.output
        );
        Ok(self)
    }

    /// `marker` appears after the end of the last report.
    pub fn validate_after_reports(self, marker: &str) -> Result<Self> {
        let last_end = self
            .output
            .rfind(DD_CRASHGUARD_END_REPORT)
            .context("no report in output")?;
        let found = self
            .output
            .rfind(marker)
            .with_context(|| format!("Expected {marker:?} in:\n{}", self.output))?;
        anyhow::ensure!(
            found > last_end,
            "{marker:?} written before the report ended:\n{}",
            self.output
        );
        Ok(self)
    }

    pub fn validate_absent(self, marker: &str) -> Result<Self> {
        anyhow::ensure!(
            !self.output.contains(marker),
            "Unexpected {marker:?} in:\n{}",
            self.output
        );
        Ok(self)
    }
}

/// Validates stderr (the report sink) and stdout (where prior handlers write) of a finished run.
pub fn validate_outputs(fault: FaultType, mode: TestMode, stderr: &str, stdout: &str) -> Result<()> {
    let prior_line = format!("{PRIOR_HANDLER_MARKER} {}", fault.kind_text());
    let last_resort = format!("{DD_CRASHGUARD_LAST_RESORT} {}", fault.kind_text());

    let validator = ReportValidator::new(stderr)
        .validate_report_count(fault.expected_reports(mode))?
        .validate_kind(fault)?
        .validate_stack_frames()?;

    match (fault, mode) {
        (FaultType::DispatchMisuse, TestMode::DoubleFire) => {
            validator
                .validate_line("Phase: constructing")?
                .validate_line("Phase: destructing")?
                .validate_after_reports(&format!("{DD_CRASHGUARD_CHAIN} {PRIOR_HANDLER_NAME}"))?;
            anyhow::ensure!(
                stdout.lines().filter(|l| *l == prior_line).count() == 2,
                "Expected the prior handler to run twice, stdout:\n{stdout}"
            );
        }
        (FaultType::UncaughtError, _) => {
            // The hook that was active before ours always exists: the default one, or the prior
            // handler's.
            validator
                .validate_after_reports(&format!("{DD_CRASHGUARD_CHAIN} {PREVIOUS_PANIC_HOOK}"))?
                .validate_line("Message: bin test panic")?;
            check_prior_ran(mode, stdout, &prior_line)?;
        }
        (FaultType::NullDeref | FaultType::RaiseSigAbrt, TestMode::Chained) => {
            validator.validate_after_reports(&format!(
                "{DD_CRASHGUARD_CHAIN} {}",
                previous_platform_handler()
            ))?;
            check_prior_ran(mode, stdout, &prior_line)?;
        }
        (FaultType::NullDeref | FaultType::RaiseSigAbrt, _) => {
            // The Rust runtime installs its own SIGSEGV and SIGBUS handlers, so the previous
            // dispositions may be chained to even without a prior handler.
            anyhow::ensure!(
                stderr.contains(&last_resort) || stderr.contains(DD_CRASHGUARD_CHAIN),
                "Expected the report to be followed by chaining or the last resort:\n{stderr}"
            );
            check_prior_ran(mode, stdout, &prior_line)?;
        }
        (_, TestMode::Chained) => {
            validator
                .validate_after_reports(&format!("{DD_CRASHGUARD_CHAIN} {PRIOR_HANDLER_NAME}"))?
                .validate_absent(DD_CRASHGUARD_LAST_RESORT)?;
            check_prior_ran(mode, stdout, &prior_line)?;
        }
        (_, _) => {
            validator
                .validate_after_reports(&last_resort)?
                .validate_absent(DD_CRASHGUARD_CHAIN)?;
            check_prior_ran(mode, stdout, &prior_line)?;
        }
    }

    if fault == FaultType::NullDeref {
        // A hardware fault, not the panic a null check would raise.
        ReportValidator::new(stderr)
            .validate_line(&format!("Address: {UNMAPPED_ADDRESS:#x}"))?
            .validate_absent("Fault: uncaught error")?;
    }

    if fault == FaultType::AllocationFailure {
        anyhow::ensure!(
            stdout.lines().any(|l| l == ALLOCATION_RECOVERED_MARKER),
            "Expected the process to survive the allocation failure, stdout:\n{stdout}"
        );
    }
    Ok(())
}

fn check_prior_ran(mode: TestMode, stdout: &str, prior_line: &str) -> Result<()> {
    let ran = stdout.lines().any(|l| l == prior_line);
    anyhow::ensure!(
        ran == (mode == TestMode::Chained),
        "Prior handler ran: {ran}, mode: {mode}, stdout:\n{stdout}"
    );
    Ok(())
}

#[cfg(unix)]
fn previous_platform_handler() -> &'static str {
    libdd_crashguard::PREVIOUS_SIGACTION
}

#[cfg(windows)]
fn previous_platform_handler() -> &'static str {
    libdd_crashguard::PREVIOUS_EXCEPTION_FILTER
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_REPORTS: &str = "\
DD_CRASHGUARD_BEGIN_REPORT
Fault: abstract dispatch misuse
Phase: constructing
DD_CRASHGUARD_BEGIN_STACKTRACE
Frame 0: main - 0x1000
DD_CRASHGUARD_END_STACKTRACE
DD_CRASHGUARD_END_REPORT
DD_CRASHGUARD_CHAIN bin-test-prior
DD_CRASHGUARD_BEGIN_REPORT
Fault: abstract dispatch misuse
Phase: destructing
DD_CRASHGUARD_BEGIN_STACKTRACE
Frame 0: Unknown - 0x2000
Frame 1: main - 0x1000
DD_CRASHGUARD_END_STACKTRACE
DD_CRASHGUARD_END_REPORT
DD_CRASHGUARD_CHAIN bin-test-prior
";

    #[test]
    fn test_split_reports() {
        let reports = split_reports(TWO_REPORTS);
        assert_eq!(reports.len(), 2);
        assert_eq!(stack_frames(reports[1]).unwrap().len(), 2);
        assert!(split_reports("DD_CRASHGUARD_BEGIN_REPORT\nFault: x\n").is_empty());
    }

    #[test]
    fn test_validate_double_fire_output() {
        let stdout = "PRIOR_HANDLER_RAN abstract dispatch misuse\n".repeat(2);
        validate_outputs(
            FaultType::DispatchMisuse,
            TestMode::DoubleFire,
            TWO_REPORTS,
            &stdout,
        )
        .unwrap();
        assert!(validate_outputs(
            FaultType::DispatchMisuse,
            TestMode::DoubleFire,
            TWO_REPORTS,
            ""
        )
        .is_err());
    }

    #[test]
    fn test_marker_before_report_end_is_rejected() {
        let output = "DD_CRASHGUARD_CHAIN x\nDD_CRASHGUARD_BEGIN_REPORT\nDD_CRASHGUARD_END_REPORT\n";
        assert!(ReportValidator::new(output)
            .validate_after_reports("DD_CRASHGUARD_CHAIN x")
            .is_err());
    }

    #[test]
    fn test_unmapped_write_must_be_a_hardware_fault() {
        let segv = "\
DD_CRASHGUARD_BEGIN_REPORT
Fault: structured fault
Code: 0xb (SIGSEGV)
Si code: 1
Address: 0x8
DD_CRASHGUARD_BEGIN_STACKTRACE
Frame 0: deref_ptr - 0x1000
DD_CRASHGUARD_END_STACKTRACE
DD_CRASHGUARD_END_REPORT
DD_CRASHGUARD_LAST_RESORT structured fault
";
        validate_outputs(FaultType::NullDeref, TestMode::Unchained, segv, "").unwrap();

        // What a debug build's null check produces instead of a SIGSEGV.
        let panicked = "\
DD_CRASHGUARD_BEGIN_REPORT
Fault: uncaught error
Message: null pointer dereference occurred
DD_CRASHGUARD_BEGIN_STACKTRACE
Frame 0: deref_ptr - 0x1000
DD_CRASHGUARD_END_STACKTRACE
DD_CRASHGUARD_END_REPORT
DD_CRASHGUARD_CHAIN previous-panic-hook
";
        assert!(validate_outputs(FaultType::NullDeref, TestMode::Unchained, panicked, "").is_err());
    }
}
