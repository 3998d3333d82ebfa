// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::shared::constants;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Stacktrace collection occurs in the context of a crashing process.
/// If the stack is sufficiently corrupted, it is possible (but unlikely),
/// for stack trace collection itself to crash.
/// We recommend fully enabling stacktrace collection, but the
/// `DD_CRASHGUARD_STACKTRACE_COLLECTION` environment variable allows downgrading the collector.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StacktraceCollection {
    /// No stack trace section is collected.
    Disabled,
    /// Raw instruction pointers only.
    WithoutSymbols,
    /// Resolves every frame in-process using `backtrace::resolve` (or its unsynchronized variant
    /// when running inside a signal handler).
    EnabledWithInprocessSymbols,
}

impl FromStr for StacktraceCollection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "none" => Ok(Self::Disabled),
            "without_symbols" | "raw" => Ok(Self::WithoutSymbols),
            "enabled" | "enabled_with_inprocess_symbols" => Ok(Self::EnabledWithInprocessSymbols),
            other => anyhow::bail!("Unknown stacktrace collection mode: {other}"),
        }
    }
}

/// Where reports are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SinkConfig {
    #[default]
    Stderr,
    Stdout,
    /// Opened once, in append mode, when the crashguard is initialized.
    File { path: String },
}

/// Deserialization goes through [`CrashguardConfiguration::new`], so a configuration read from
/// JSON is validated the same way as one built in code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawConfiguration")]
pub struct CrashguardConfiguration {
    create_alt_stack: bool,
    // Whether to demangle symbol names in stack traces
    demangle_names: bool,
    max_frames: usize,
    resolve_frames: StacktraceCollection,
    signals: Vec<i32>,
    sink: SinkConfig,
    stack_guarantee: usize,
    use_alt_stack: bool,
}

#[derive(Deserialize)]
struct RawConfiguration {
    create_alt_stack: bool,
    demangle_names: bool,
    max_frames: Option<usize>,
    resolve_frames: StacktraceCollection,
    #[serde(default)]
    signals: Vec<i32>,
    #[serde(default)]
    sink: SinkConfig,
    stack_guarantee: Option<usize>,
    use_alt_stack: bool,
}

impl TryFrom<RawConfiguration> for CrashguardConfiguration {
    type Error = anyhow::Error;

    fn try_from(raw: RawConfiguration) -> anyhow::Result<Self> {
        Self::new(
            raw.create_alt_stack,
            raw.use_alt_stack,
            raw.demangle_names,
            raw.max_frames,
            raw.resolve_frames,
            raw.signals,
            raw.sink,
            raw.stack_guarantee,
        )
    }
}

impl CrashguardConfiguration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        create_alt_stack: bool,
        use_alt_stack: bool,
        demangle_names: bool,
        max_frames: Option<usize>,
        resolve_frames: StacktraceCollection,
        mut signals: Vec<i32>,
        sink: SinkConfig,
        stack_guarantee: Option<usize>,
    ) -> anyhow::Result<Self> {
        // Requesting to create, but not use, the altstack is considered paradoxical.
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        let max_frames = max_frames.unwrap_or(constants::DD_CRASHGUARD_DEFAULT_MAX_FRAMES);
        anyhow::ensure!(
            (1..=crate::MAX_BACKTRACE_FRAMES).contains(&max_frames),
            "max_frames must be between 1 and {}, got {max_frames}",
            crate::MAX_BACKTRACE_FRAMES
        );
        let stack_guarantee =
            stack_guarantee.unwrap_or(constants::DD_CRASHGUARD_DEFAULT_STACK_GUARANTEE);
        anyhow::ensure!(stack_guarantee > 0, "stack_guarantee must not be zero");
        if let SinkConfig::File { path } = &sink {
            anyhow::ensure!(!path.is_empty(), "Sink file path must not be empty");
        }

        if signals.is_empty() {
            signals = crate::default_signals();
        } else {
            // Ensure we don't have double elements in the signals list.
            let before_len = signals.len();
            signals.sort();
            signals.dedup();
            anyhow::ensure!(
                before_len == signals.len(),
                "Signals contained duplicate elements"
            );
            // Ensure that all signal values translate to a valid signum
            #[cfg(unix)]
            signals
                .iter()
                .try_for_each(|x| crate::signal_from_signum(*x).map(|_| ()))?;
        }

        Ok(Self {
            create_alt_stack,
            demangle_names,
            max_frames,
            resolve_frames,
            signals,
            sink,
            stack_guarantee,
            use_alt_stack,
        })
    }

    /// Applies overrides read from the environment. Unset variables leave the configuration
    /// untouched; malformed values are an error rather than being silently ignored.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(value) = std::env::var(constants::DD_CRASHGUARD_STACKTRACE_COLLECTION_ENV) {
            self.resolve_frames = value.parse()?;
        }
        Ok(())
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn demangle_names(&self) -> bool {
        self.demangle_names
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn resolve_frames(&self) -> StacktraceCollection {
        self.resolve_frames
    }

    pub fn signals(&self) -> &Vec<i32> {
        &self.signals
    }

    pub fn sink(&self) -> &SinkConfig {
        &self.sink
    }

    pub fn stack_guarantee(&self) -> usize {
        self.stack_guarantee
    }

    pub fn set_create_alt_stack(&mut self, create_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !create_alt_stack || self.use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.create_alt_stack = create_alt_stack;
        Ok(())
    }

    pub fn set_use_alt_stack(&mut self, use_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.use_alt_stack = use_alt_stack;
        Ok(())
    }

    pub fn set_resolve_frames(&mut self, resolve_frames: StacktraceCollection) {
        self.resolve_frames = resolve_frames;
    }

    pub fn set_sink(&mut self, sink: SinkConfig) {
        self.sink = sink;
    }
}

impl Default for CrashguardConfiguration {
    fn default() -> Self {
        Self {
            create_alt_stack: true,
            demangle_names: true,
            max_frames: constants::DD_CRASHGUARD_DEFAULT_MAX_FRAMES,
            resolve_frames: StacktraceCollection::EnabledWithInprocessSymbols,
            signals: crate::default_signals(),
            sink: SinkConfig::Stderr,
            stack_guarantee: constants::DD_CRASHGUARD_DEFAULT_STACK_GUARANTEE,
            use_alt_stack: true,
        }
    }
}
