// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// How the test binary arranges the handlers around the crashguard's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestMode {
    /// Nothing is installed before the crashguard.
    Unchained,
    /// A handler that writes [`PRIOR_HANDLER_MARKER`] to stdout is installed before the
    /// crashguard, which must run it after its report.
    Chained,
    /// Constructs and destroys an object whose capability is never bound, with a prior handler
    /// that lets both misuses resume. Only valid with [`FaultType::DispatchMisuse`].
    DoubleFire,
}

/// Written to stdout, followed by the fault kind, by the handlers the test binary installs
/// before the crashguard.
pub const PRIOR_HANDLER_MARKER: &str = "PRIOR_HANDLER_RAN";

/// Registry name of the handlers the test binary installs before the crashguard.
pub const PRIOR_HANDLER_NAME: &str = "bin-test-prior";

/// Written to stdout when the binary survives an allocation failure.
pub const ALLOCATION_RECOVERED_MARKER: &str = "ALLOCATION_FAILURE_RECOVERED";

/// Written to by the structured fault. Non-null so that debug builds fault in hardware instead of
/// panicking on a null check.
pub const UNMAPPED_ADDRESS: usize = 0x8;

impl TestMode {
    /// Returns the string representation used in command-line arguments.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unchained => "unchained",
            Self::Chained => "chained",
            Self::DoubleFire => "double_fire",
        }
    }

    /// Returns all available test modes.
    pub const fn all() -> &'static [Self] {
        &[Self::Unchained, Self::Chained, Self::DoubleFire]
    }

    pub const fn supports(self, fault: FaultType) -> bool {
        !matches!(self, Self::DoubleFire) || matches!(fault, FaultType::DispatchMisuse)
    }
}

impl std::fmt::Display for TestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unchained" => Ok(Self::Unchained),
            "chained" => Ok(Self::Chained),
            "double_fire" => Ok(Self::DoubleFire),
            _ => Err(format!("Unknown test mode: {}", s)),
        }
    }
}

/// The fault the test binary provokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultType {
    /// A panic escaping `main`
    UncaughtError,
    /// A capability called on a live object that never bound it
    DispatchMisuse,
    /// A contract-checked call with a missing destination
    InvalidArgument,
    /// A reservation the test allocator always refuses
    AllocationFailure,
    /// Write into the unmapped zero page (SIGSEGV)
    NullDeref,
    /// Raise SIGABRT
    RaiseSigAbrt,
}

impl FaultType {
    /// Returns the string representation used in command-line arguments.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UncaughtError => "uncaught_error",
            Self::DispatchMisuse => "dispatch_misuse",
            Self::InvalidArgument => "invalid_argument",
            Self::AllocationFailure => "allocation_failure",
            Self::NullDeref => "null_deref",
            Self::RaiseSigAbrt => "raise_sigabrt",
        }
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::UncaughtError,
            Self::DispatchMisuse,
            Self::InvalidArgument,
            Self::AllocationFailure,
            Self::NullDeref,
            Self::RaiseSigAbrt,
        ]
    }

    /// The text on the `Fault:` line of the report.
    pub const fn kind_text(self) -> &'static str {
        match self {
            Self::UncaughtError => "uncaught error",
            Self::DispatchMisuse => "abstract dispatch misuse",
            Self::InvalidArgument => "invalid argument",
            Self::AllocationFailure => "allocation failure",
            Self::NullDeref | Self::RaiseSigAbrt => "structured fault",
        }
    }

    /// Exit code the process should end with, or `None` when it should be killed by
    /// [`Self::signal_number`].
    pub const fn expected_exit_code(self, mode: TestMode) -> Option<i32> {
        match (self, mode) {
            (Self::AllocationFailure, _) | (Self::DispatchMisuse, TestMode::DoubleFire) => Some(0),
            // The exit code Rust uses for a panic escaping main.
            (Self::UncaughtError, _) => Some(101),
            (Self::DispatchMisuse | Self::InvalidArgument, _) => Some(1),
            (Self::NullDeref | Self::RaiseSigAbrt, _) => None,
        }
    }

    /// Returns the expected signal number for this fault type (Unix only).
    #[cfg(unix)]
    pub const fn signal_number(self) -> Option<i32> {
        match self {
            Self::NullDeref => Some(libc::SIGSEGV),
            Self::RaiseSigAbrt => Some(libc::SIGABRT),
            _ => None,
        }
    }

    /// Number of reports the stderr of one run should hold.
    pub const fn expected_reports(self, mode: TestMode) -> usize {
        match (self, mode) {
            (Self::DispatchMisuse, TestMode::DoubleFire) => 2,
            _ => 1,
        }
    }
}

impl std::fmt::Display for FaultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FaultType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uncaught_error" => Ok(Self::UncaughtError),
            "dispatch_misuse" => Ok(Self::DispatchMisuse),
            "invalid_argument" => Ok(Self::InvalidArgument),
            "allocation_failure" => Ok(Self::AllocationFailure),
            "null_deref" => Ok(Self::NullDeref),
            "raise_sigabrt" => Ok(Self::RaiseSigAbrt),
            _ => Err(format!("Unknown fault type: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("chained".parse::<TestMode>(), Ok(TestMode::Chained));
        assert_eq!("double_fire".parse::<TestMode>(), Ok(TestMode::DoubleFire));
        assert!("sigpipe".parse::<TestMode>().is_err());
    }

    #[test]
    fn test_fault_type_parsing() {
        assert_eq!("null_deref".parse::<FaultType>(), Ok(FaultType::NullDeref));
        assert!("kill_sigbus".parse::<FaultType>().is_err());
    }

    #[test]
    fn test_double_fire_is_misuse_only() {
        for fault in FaultType::all() {
            assert_eq!(
                TestMode::DoubleFire.supports(*fault),
                *fault == FaultType::DispatchMisuse
            );
            assert!(TestMode::Chained.supports(*fault));
        }
    }

    #[test]
    fn test_expected_outcomes() {
        assert_eq!(
            FaultType::AllocationFailure.expected_exit_code(TestMode::Unchained),
            Some(0)
        );
        assert_eq!(
            FaultType::DispatchMisuse.expected_exit_code(TestMode::Chained),
            Some(1)
        );
        assert_eq!(
            FaultType::DispatchMisuse.expected_exit_code(TestMode::DoubleFire),
            Some(0)
        );
        assert_eq!(FaultType::NullDeref.expected_exit_code(TestMode::Unchained), None);
        assert_eq!(FaultType::DispatchMisuse.expected_reports(TestMode::DoubleFire), 2);

        #[cfg(unix)]
        {
            assert_eq!(FaultType::NullDeref.signal_number(), Some(11));
            assert_eq!(FaultType::RaiseSigAbrt.signal_number(), Some(6));
        }
    }
}
