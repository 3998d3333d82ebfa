// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Generic test runner infrastructure for crashguard tests.
//! Spawns the test binary for one `(FaultType, TestMode)` pair with its stdout and stderr
//! redirected to files, then validates the exit status and both outputs.

use crate::{
    artifacts::crashguard_bin_test,
    build_artifacts,
    test_types::{FaultType, TestMode},
    validation::{read_output, validate_outputs},
    BuildProfile,
};
use anyhow::{Context, Result};
use std::{
    fs::File,
    path::{Path, PathBuf},
    process,
};

/// Configuration for a crashguard test.
#[derive(Debug, Clone)]
pub struct CrashTestConfig<'a> {
    /// Build profile for the test binary
    pub profile: BuildProfile,
    /// Handler arrangement
    pub mode: TestMode,
    /// Fault to provoke
    pub fault: FaultType,
    /// Additional environment variables to set
    pub env_vars: Vec<(&'a str, &'a str)>,
}

impl<'a> CrashTestConfig<'a> {
    pub fn new(profile: BuildProfile, mode: TestMode, fault: FaultType) -> Self {
        Self {
            profile,
            mode,
            fault,
            env_vars: vec![],
        }
    }

    /// Adds an environment variable to the test configuration.
    pub fn with_env(mut self, key: &'a str, value: &'a str) -> Self {
        self.env_vars.push((key, value));
        self
    }
}

/// Scratch files of one run.
pub struct TestFixtures {
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    #[allow(dead_code)]
    tmpdir: tempfile::TempDir,
}

impl TestFixtures {
    pub fn new() -> Result<Self> {
        let tmpdir = tempfile::TempDir::new().context("Failed to create temporary directory")?;
        let dirpath = tmpdir.path();

        Ok(Self {
            stdout_path: extend_path(dirpath, "out.stdout"),
            stderr_path: extend_path(dirpath, "out.stderr"),
            tmpdir,
        })
    }
}

fn extend_path(dir: &Path, file: &str) -> PathBuf {
    let mut path = dir.to_path_buf();
    path.push(file);
    path
}

/// What a finished run left behind.
#[derive(Debug)]
pub struct TestOutputs {
    pub status: process::ExitStatus,
    pub stderr: String,
    pub stdout: String,
}

/// Builds the test binary, runs it once for `config` and returns what it wrote.
pub fn run_bin_test(config: &CrashTestConfig) -> Result<TestOutputs> {
    anyhow::ensure!(
        config.mode.supports(config.fault),
        "{} does not apply to {}",
        config.mode,
        config.fault
    );
    let bin = crashguard_bin_test(config.profile);
    let artifacts = build_artifacts(&[&bin])?;
    let fixtures = TestFixtures::new()?;

    let mut cmd = process::Command::new(&artifacts[&bin]);
    cmd.arg(config.fault.as_str())
        .arg(config.mode.as_str())
        .stdin(process::Stdio::null())
        .stdout(File::create(&fixtures.stdout_path)?)
        .stderr(File::create(&fixtures.stderr_path)?);
    for (key, val) in &config.env_vars {
        cmd.env(key, val);
    }

    let mut p = cmd.spawn().context("Failed to spawn test process")?;
    let status = crate::timeit!("exit after fault", { p.wait()? });

    Ok(TestOutputs {
        status,
        stderr: read_output(&fixtures.stderr_path)?,
        stdout: read_output(&fixtures.stdout_path)?,
    })
}

/// Runs the test binary for `config` and validates the exit status and outputs.
pub fn run_crash_test(config: &CrashTestConfig) -> Result<TestOutputs> {
    let outputs = run_bin_test(config)?;
    assert_exit_status(outputs.status, config.fault, config.mode)
        .with_context(|| format!("stderr:\n{}", outputs.stderr))?;
    validate_outputs(config.fault, config.mode, &outputs.stderr, &outputs.stdout)?;
    Ok(outputs)
}

/// Validates the process exit status matches expectations for the fault and mode.
fn assert_exit_status(status: process::ExitStatus, fault: FaultType, mode: TestMode) -> Result<()> {
    match fault.expected_exit_code(mode) {
        Some(code) => anyhow::ensure!(
            status.code() == Some(code),
            "Exit status mismatch for {fault:?} in {mode}: expected code {code}, got {status:?}"
        ),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                anyhow::ensure!(
                    status.signal() == fault.signal_number(),
                    "Exit status mismatch for {fault:?} in {mode}: expected signal {:?}, got {status:?}",
                    fault.signal_number()
                );
            }
            #[cfg(not(unix))]
            anyhow::ensure!(!status.success(), "{fault:?} in {mode} exited successfully");
        }
    }
    Ok(())
}
