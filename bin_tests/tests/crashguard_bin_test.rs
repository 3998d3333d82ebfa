// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use bin_tests::test_runner::{run_crash_test, CrashTestConfig};
use bin_tests::test_types::{FaultType, TestMode};
use bin_tests::BuildProfile;

macro_rules! crash_tests {
    ($($name:ident: $fault:ident, $mode:ident;)*) => {
        $(
            #[test]
            #[cfg_attr(miri, ignore)]
            fn $name() {
                run_crash_test(&CrashTestConfig::new(
                    BuildProfile::Debug,
                    TestMode::$mode,
                    FaultType::$fault,
                ))
                .unwrap();
            }
        )*
    };
}

crash_tests! {
    test_uncaught_error_unchained: UncaughtError, Unchained;
    test_uncaught_error_chained: UncaughtError, Chained;
    test_dispatch_misuse_unchained: DispatchMisuse, Unchained;
    test_dispatch_misuse_chained: DispatchMisuse, Chained;
    test_dispatch_misuse_double_fire: DispatchMisuse, DoubleFire;
    test_invalid_argument_unchained: InvalidArgument, Unchained;
    test_invalid_argument_chained: InvalidArgument, Chained;
    test_allocation_failure_unchained: AllocationFailure, Unchained;
    test_allocation_failure_chained: AllocationFailure, Chained;
    test_null_deref_unchained: NullDeref, Unchained;
    test_null_deref_chained: NullDeref, Chained;
    test_raise_sigabrt_unchained: RaiseSigAbrt, Unchained;
    test_raise_sigabrt_chained: RaiseSigAbrt, Chained;
}

#[test]
#[ignore] // This test is slow, only run it if explicitly opted in
fn test_all_faults_release() {
    for fault in FaultType::all() {
        for mode in TestMode::all().iter().filter(|m| m.supports(*fault)) {
            run_crash_test(&CrashTestConfig::new(BuildProfile::Release, *mode, *fault))
                .unwrap_or_else(|e| panic!("{fault} {mode}: {e:?}"));
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_stacktrace_collection_disabled_by_env() {
    let config = CrashTestConfig::new(
        BuildProfile::Debug,
        TestMode::Unchained,
        FaultType::InvalidArgument,
    )
    .with_env("DD_CRASHGUARD_STACKTRACE_COLLECTION", "disabled");
    let outputs = bin_tests::test_runner::run_bin_test(&config).unwrap();
    assert_eq!(outputs.status.code(), Some(1));
    // The stack section is still delimited but holds no frames.
    assert!(outputs.stderr.contains(
        "DD_CRASHGUARD_BEGIN_STACKTRACE\nStack trace collection disabled\nDD_CRASHGUARD_END_STACKTRACE\n"
    ));
    assert!(bin_tests::validation::stack_frames(&outputs.stderr)
        .unwrap()
        .is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_stacktrace_without_symbols() {
    let outputs = run_crash_test(
        &CrashTestConfig::new(
            BuildProfile::Debug,
            TestMode::Unchained,
            FaultType::DispatchMisuse,
        )
        .with_env("DD_CRASHGUARD_STACKTRACE_COLLECTION", "without_symbols"),
    )
    .unwrap();
    let frames = bin_tests::validation::stack_frames(&outputs.stderr).unwrap();
    assert!(frames.iter().all(|f| f.contains(": Unknown - 0x")), "{frames:?}");
}
