// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::stack_capture::{self, RawStack};
use super::symbol_resolver::SymbolResolver;
use crate::crash_info::{fault_code_name, CapturedFrame, FaultContext};
use crate::registry::HookKind;
use crate::shared::constants::*;
use crate::{CrashguardConfiguration, StacktraceCollection};
use std::fmt;
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to write to output: {0}")]
    WriteError(#[from] std::io::Error),
}

/// Formats one report per intercepted condition.
///
/// Every optional field of the context is checked before it is printed; a missing field is
/// written as `unknown`.
#[derive(Debug, Clone, Copy)]
pub struct DiagnosticReporter {
    demangle: bool,
    max_frames: usize,
    resolve_frames: StacktraceCollection,
}

impl DiagnosticReporter {
    pub fn new(config: &CrashguardConfiguration) -> Self {
        Self {
            demangle: config.demangle_names(),
            max_frames: config.max_frames(),
            resolve_frames: config.resolve_frames(),
        }
    }

    /// Captures the calling thread's stack, starting where the condition entered the handler chain,
    /// and writes a complete report for `ctx`.
    pub fn report(&self, w: &mut impl Write, ctx: &FaultContext<'_>) -> Result<(), ReportError> {
        let stack = match self.resolve_frames {
            StacktraceCollection::Disabled => RawStack::new(),
            _ => stack_capture::capture_fault_stack(self.max_frames),
        };
        self.emit_report(w, ctx, &stack, &SymbolResolver::new(self.demangle))
    }

    /// Same as [`Self::report`], for use inside a signal handler.
    ///
    /// # Safety
    ///   Stack walking and symbol resolution skip the backtrace crate's lock. See
    ///   [`stack_capture::capture_fault_stack_unsynchronized`] and
    ///   [`SymbolResolver::new_unsynchronized`].
    pub unsafe fn report_unsynchronized(
        &self,
        w: &mut impl Write,
        ctx: &FaultContext<'_>,
    ) -> Result<(), ReportError> {
        let stack = match self.resolve_frames {
            StacktraceCollection::Disabled => RawStack::new(),
            _ => stack_capture::capture_fault_stack_unsynchronized(self.max_frames),
        };
        self.emit_report(
            w,
            ctx,
            &stack,
            &SymbolResolver::new_unsynchronized(self.demangle),
        )
    }

    /// Writes a report for an already captured stack.
    pub fn emit_report(
        &self,
        w: &mut impl Write,
        ctx: &FaultContext<'_>,
        stack: &RawStack,
        resolver: &SymbolResolver,
    ) -> Result<(), ReportError> {
        writeln!(w, "{DD_CRASHGUARD_BEGIN_REPORT}")?;
        writeln!(w, "Fault: {}", ctx.kind())?;
        emit_details(w, ctx)?;
        emit_procinfo(w)?;
        emit_timestamp(w)?;
        self.emit_stacktrace(w, stack, resolver)?;
        writeln!(w, "{DD_CRASHGUARD_END_REPORT}")?;
        w.flush()?;
        Ok(())
    }

    fn emit_stacktrace(
        &self,
        w: &mut impl Write,
        stack: &RawStack,
        resolver: &SymbolResolver,
    ) -> Result<(), ReportError> {
        writeln!(w, "{DD_CRASHGUARD_BEGIN_STACKTRACE}")?;
        match self.resolve_frames {
            StacktraceCollection::Disabled => writeln!(w, "Stack trace collection disabled")?,
            StacktraceCollection::WithoutSymbols => {
                for (i, ip) in stack.as_slice().iter().enumerate() {
                    writeln!(w, "{}", CapturedFrame::unresolved(*ip).display(i))?;
                }
            }
            StacktraceCollection::EnabledWithInprocessSymbols => {
                let session = resolver.session();
                for (i, ip) in stack.as_slice().iter().enumerate() {
                    let frame = match &session {
                        Some(session) => session.resolve(*ip),
                        None => CapturedFrame::unresolved(*ip),
                    };
                    writeln!(w, "{}", frame.display(i))?;
                    // Flush eagerly so each frame is out even if resolving the next one crashes.
                    w.flush()?;
                }
            }
        }
        writeln!(w, "{DD_CRASHGUARD_END_STACKTRACE}")?;
        w.flush()?;
        Ok(())
    }
}

struct OrUnknown<T>(Option<T>);

impl<T: fmt::Display> fmt::Display for OrUnknown<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(value) => value.fmt(f),
            None => f.write_str("unknown"),
        }
    }
}

struct Hex(usize);

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

fn emit_details(w: &mut impl Write, ctx: &FaultContext<'_>) -> Result<(), ReportError> {
    match ctx {
        FaultContext::UncaughtError(info) => {
            writeln!(w, "Message: {}", OrUnknown(info.message))?;
            match info.location {
                Some(l) => writeln!(w, "Location: {}:{}:{}", l.file, l.line, l.column)?,
                None => writeln!(w, "Location: unknown")?,
            }
        }
        FaultContext::AbstractDispatchMisuse(info) => {
            writeln!(w, "Type: {}", OrUnknown(info.type_name))?;
            writeln!(w, "Capability: {}", OrUnknown(info.capability))?;
            writeln!(w, "Phase: {}", OrUnknown(info.phase))?;
        }
        FaultContext::InvalidArgument(info) => {
            writeln!(w, "Expression: {}", OrUnknown(info.expression))?;
            writeln!(w, "Function: {}", OrUnknown(info.function))?;
            writeln!(w, "File: {}", OrUnknown(info.file))?;
            writeln!(w, "Line: {}", OrUnknown(info.line))?;
        }
        FaultContext::AllocationFailure(info) => {
            writeln!(
                w,
                "Requested: {} bytes, align {}",
                info.size, info.align
            )?;
        }
        FaultContext::StructuredFault(info) => {
            writeln!(
                w,
                "Code: {:#x} ({})",
                info.code,
                fault_code_name(info.code)
            )?;
            if let Some(si_code) = info.si_code {
                writeln!(w, "Si code: {si_code}")?;
            }
            writeln!(w, "Address: {}", OrUnknown(info.address.map(Hex)))?;
        }
    }
    Ok(())
}

fn emit_procinfo(w: &mut impl Write) -> Result<(), ReportError> {
    writeln!(
        w,
        "Process: {}, thread {}",
        std::process::id(),
        super::platform::current_thread_id()
    )?;
    Ok(())
}

fn emit_timestamp(w: &mut impl Write) -> Result<(), ReportError> {
    let now = chrono::Utc::now();
    writeln!(
        w,
        "Timestamp: {}",
        now.format("%Y-%m-%dT%H:%M:%S%.3fZ")
    )?;
    Ok(())
}

/// The fixed line written with a single raw write when a report could not be written.
pub fn report_failed_line(kind: HookKind) -> &'static str {
    match kind {
        HookKind::UncaughtError => "DD_CRASHGUARD_REPORT_FAILED uncaught error\n",
        HookKind::AbstractDispatchMisuse => {
            "DD_CRASHGUARD_REPORT_FAILED abstract dispatch misuse\n"
        }
        HookKind::InvalidArgument => "DD_CRASHGUARD_REPORT_FAILED invalid argument\n",
        HookKind::AllocationFailure => "DD_CRASHGUARD_REPORT_FAILED allocation failure\n",
        HookKind::StructuredFault => "DD_CRASHGUARD_REPORT_FAILED structured fault\n",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_info::{
        AllocationFailureInfo, DispatchMisuseInfo, InvalidArgumentInfo, RawFault, SourceLocation,
        StructuredFaultInfo, UncaughtErrorInfo,
    };
    use crate::lifecycle::LifecyclePhase;
    use crate::SinkConfig;

    fn reporter(resolve_frames: StacktraceCollection) -> DiagnosticReporter {
        let config = CrashguardConfiguration::new(
            false,
            false,
            true,
            None,
            resolve_frames,
            vec![],
            SinkConfig::Stderr,
            None,
        )
        .unwrap();
        DiagnosticReporter::new(&config)
    }

    fn report_to_string(reporter: &DiagnosticReporter, ctx: &FaultContext<'_>) -> String {
        let mut buf = Vec::new();
        reporter.report(&mut buf, ctx).unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn stack_section(report: &str) -> Vec<&str> {
        report
            .lines()
            .skip_while(|l| *l != DD_CRASHGUARD_BEGIN_STACKTRACE)
            .skip(1)
            .take_while(|l| *l != DD_CRASHGUARD_END_STACKTRACE)
            .collect()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_report_layout() {
        let ctx = FaultContext::UncaughtError(UncaughtErrorInfo {
            message: Some("boom"),
            location: Some(SourceLocation {
                file: "src/main.rs",
                line: 7,
                column: 5,
            }),
            panic: None,
        });
        let report = report_to_string(
            &reporter(StacktraceCollection::EnabledWithInprocessSymbols),
            &ctx,
        );
        let lines: Vec<_> = report.lines().collect();
        assert_eq!(lines[0], DD_CRASHGUARD_BEGIN_REPORT);
        assert_eq!(lines[1], "Fault: uncaught error");
        assert_eq!(lines[2], "Message: boom");
        assert_eq!(lines[3], "Location: src/main.rs:7:5");
        assert!(lines[4].starts_with(&format!("Process: {}, thread ", std::process::id())));
        assert!(lines[5].starts_with("Timestamp: "));
        assert!(lines[5].ends_with('Z'));
        assert_eq!(lines[6], DD_CRASHGUARD_BEGIN_STACKTRACE);
        assert_eq!(*lines.last().unwrap(), DD_CRASHGUARD_END_REPORT);

        let frames = stack_section(&report);
        assert!(!frames.is_empty());
        assert!(frames.len() <= crate::MAX_BACKTRACE_FRAMES);
        for (i, frame) in frames.iter().enumerate() {
            assert!(frame.starts_with(&format!("Frame {i}: ")), "{frame}");
            assert!(frame.contains(" - 0x"), "{frame}");
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_invalid_argument_with_nothing_known() {
        let ctx = FaultContext::InvalidArgument(InvalidArgumentInfo::default());
        let report = report_to_string(&reporter(StacktraceCollection::WithoutSymbols), &ctx);
        assert!(report.contains("Fault: invalid argument\n"));
        assert!(report.contains("Expression: unknown\n"));
        assert!(report.contains("Function: unknown\n"));
        assert!(report.contains("File: unknown\n"));
        assert!(report.contains("Line: unknown\n"));
        let frames = stack_section(&report);
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| f.contains(": Unknown - 0x")));
    }

    #[test]
    fn test_disabled_collection() {
        let ctx = FaultContext::AbstractDispatchMisuse(DispatchMisuseInfo {
            type_name: Some("Widget"),
            capability: Some("render"),
            phase: Some(LifecyclePhase::Destructing),
        });
        let report = report_to_string(&reporter(StacktraceCollection::Disabled), &ctx);
        assert!(report.contains("Fault: abstract dispatch misuse\n"));
        assert!(report.contains("Type: Widget\nCapability: render\nPhase: destructing\n"));
        assert_eq!(stack_section(&report), ["Stack trace collection disabled"]);
    }

    #[test]
    fn test_structured_fault_and_allocation_details() {
        let reporter = reporter(StacktraceCollection::Disabled);
        let ctx = FaultContext::StructuredFault(StructuredFaultInfo {
            code: 11,
            si_code: Some(1),
            address: Some(0x10),
            raw: RawFault::None,
        });
        let report = report_to_string(&reporter, &ctx);
        assert!(report.contains("Fault: structured fault\n"));
        assert!(report.contains("Code: 0xb ("));
        assert!(report.contains("Si code: 1\n"));
        assert!(report.contains("Address: 0x10\n"));

        let ctx = FaultContext::StructuredFault(StructuredFaultInfo {
            code: 11,
            si_code: None,
            address: None,
            raw: RawFault::None,
        });
        let report = report_to_string(&reporter, &ctx);
        assert!(report.contains("Address: unknown\n"));
        assert!(!report.contains("Si code"));

        let ctx = FaultContext::AllocationFailure(AllocationFailureInfo {
            size: 4096,
            align: 16,
        });
        let report = report_to_string(&reporter, &ctx);
        assert!(report.contains("Fault: allocation failure\nRequested: 4096 bytes, align 16\n"));
    }

    #[test]
    fn test_write_errors_are_reported() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("closed"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let ctx = FaultContext::InvalidArgument(InvalidArgumentInfo::default());
        let result = reporter(StacktraceCollection::Disabled).report(&mut Broken, &ctx);
        assert!(matches!(result, Err(ReportError::WriteError(_))));
    }

    #[test]
    fn test_report_failed_lines() {
        for kind in HookKind::all() {
            let line = report_failed_line(kind);
            assert_eq!(
                line,
                format!("{DD_CRASHGUARD_REPORT_FAILED} {}\n", kind.as_str())
            );
        }
    }
}
