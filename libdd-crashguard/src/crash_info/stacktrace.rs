// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;
use symbolic_common::Name;
use symbolic_demangle::{Demangle, DemangleOptions};

/// Printed in place of a symbol name the resolver could not find.
pub const UNKNOWN_SYMBOL: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedFrame {
    pub ip: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_address: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl CapturedFrame {
    pub fn unresolved(ip: usize) -> Self {
        Self {
            ip,
            symbol_name: None,
            symbol_address: None,
            file: None,
            line: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.symbol_name.is_some()
    }

    /// One report line: `Frame <index>: <symbol> - 0x<address>`, plus ` (<file>:<line>)` when the
    /// location is known. The address is the symbol start when resolved and the raw ip otherwise.
    pub fn display(&self, index: usize) -> FrameLine<'_> {
        FrameLine { frame: self, index }
    }
}

pub struct FrameLine<'a> {
    frame: &'a CapturedFrame,
    index: usize,
}

impl fmt::Display for FrameLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frame = self.frame;
        match &frame.symbol_name {
            Some(name) => write!(
                f,
                "Frame {}: {name} - {:#x}",
                self.index,
                frame.symbol_address.unwrap_or(frame.ip)
            )?,
            None => write!(f, "Frame {}: {UNKNOWN_SYMBOL} - {:#x}", self.index, frame.ip)?,
        }
        if let (Some(file), Some(line)) = (&frame.file, frame.line) {
            write!(f, " ({file}:{line})")?;
        }
        Ok(())
    }
}

/// Ordered frames, most recent first, never longer than [`crate::MAX_BACKTRACE_FRAMES`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTrace {
    frames: Vec<CapturedFrame>,
}

impl StackTrace {
    pub fn empty() -> Self {
        Self { frames: vec![] }
    }

    pub fn from_frames(mut frames: Vec<CapturedFrame>) -> Self {
        frames.truncate(crate::MAX_BACKTRACE_FRAMES);
        Self { frames }
    }

    pub fn frames(&self) -> &[CapturedFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Returns the demangled form of `name`, or `None` when it is not a mangled symbol.
pub fn demangle(name: &str) -> Option<String> {
    match Name::from(name).demangle(DemangleOptions::name_only()) {
        Some(demangled) if demangled != name => Some(demangled),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demangle_rust() {
        assert_eq!(
            demangle("_ZN3std2rt10lang_start17h7a87e81ecc4a9d6cE").as_deref(),
            Some("std::rt::lang_start")
        );
    }

    #[test]
    fn test_demangle_cpp() {
        assert_eq!(demangle("_ZN3Foo3barEv").as_deref(), Some("Foo::bar"));
    }

    #[test]
    fn test_demangle_msvc() {
        assert_eq!(demangle("?bar@Foo@@QEAAXXZ").as_deref(), Some("Foo::bar"));
    }

    #[test]
    fn test_demangle_unmangled() {
        assert_eq!(demangle("main"), None);
        assert_eq!(demangle("invalid_mangled_name"), None);
        assert_eq!(demangle(""), None);
    }

    #[test]
    fn test_frame_lines() {
        let unknown = CapturedFrame::unresolved(0x1234);
        assert_eq!(unknown.display(3).to_string(), "Frame 3: Unknown - 0x1234");

        let resolved = CapturedFrame {
            ip: 0x1240,
            symbol_name: Some("crashguard::demo".to_string()),
            symbol_address: Some(0x1200),
            file: Some("src/demo.rs".to_string()),
            line: Some(42),
        };
        assert!(resolved.is_resolved());
        assert_eq!(
            resolved.display(0).to_string(),
            "Frame 0: crashguard::demo - 0x1200 (src/demo.rs:42)"
        );
    }

    #[test]
    fn test_from_frames_is_bounded() {
        let frames = (0..crate::MAX_BACKTRACE_FRAMES + 20)
            .map(CapturedFrame::unresolved)
            .collect();
        let trace = StackTrace::from_frames(frames);
        assert_eq!(trace.len(), crate::MAX_BACKTRACE_FRAMES);
        assert_eq!(trace.frames()[0].ip, 0);
        assert!(StackTrace::empty().is_empty());
    }
}
