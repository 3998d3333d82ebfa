// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::atom_guard::AtomGuard;
use super::emitters::{report_failed_line, DiagnosticReporter};
use super::hooks::ReportingHook;
use super::sink::DiagnosticSink;
use crate::crash_info::FaultContext;
use crate::registry::{self, HandlerRecord, HandlerRegistry, HookKind};
use crate::shared::configuration::CrashguardConfiguration;
use crate::shared::constants::*;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::OnceLock;
use tracing::{debug, info};

static CRASHGUARD: OnceLock<Crashguard> = OnceLock::new();

thread_local! {
    // Set while this thread writes a report of the given kind.
    static REPORTING: [AtomicBool; HookKind::COUNT] = const {
        [
            AtomicBool::new(false),
            AtomicBool::new(false),
            AtomicBool::new(false),
            AtomicBool::new(false),
            AtomicBool::new(false),
        ]
    };
}

#[derive(Debug, thiserror::Error)]
pub enum CrashguardError {
    #[error("Crashguard is already initialized")]
    AlreadyInitialized,
    #[error("Crashguard is not initialized")]
    NotInitialized,
    #[error("The {0} hook is already installed")]
    AlreadyInstalled(HookKind),
}

/// Process-wide crash-capture state: configuration, the open sink and the registry the hooks
/// chain through. Obtained once from [`init`]; every hook holds a `&'static` to it.
#[derive(Debug)]
pub struct Crashguard {
    config: CrashguardConfiguration,
    installed: [AtomicBool; HookKind::COUNT],
    registry: &'static HandlerRegistry,
    reporter: DiagnosticReporter,
    sink: DiagnosticSink,
}

/// Creates the process-wide [`Crashguard`]. Environment overrides are applied to `config` first.
///
/// PRECONDITIONS:
///     None
/// SAFETY:
///     Crash-capture setup functions are not guaranteed to be reentrant.
///     No other crashguard setup functions should be called concurrently.
/// ATOMICITY:
///     Initialization happens at most once; later calls fail with
///     [`CrashguardError::AlreadyInitialized`].
pub fn init(mut config: CrashguardConfiguration) -> anyhow::Result<&'static Crashguard> {
    config.apply_env_overrides()?;
    let guard = Crashguard::new(config, registry::registry())?;
    CRASHGUARD
        .set(guard)
        .map_err(|_| CrashguardError::AlreadyInitialized)?;
    let guard = CRASHGUARD.get().ok_or(CrashguardError::NotInitialized)?;

    #[cfg(windows)]
    super::platform::reserve_stack_guarantee(guard.config.stack_guarantee())?;

    info!(
        resolve_frames = ?guard.config.resolve_frames(),
        max_frames = guard.config.max_frames(),
        sink = ?guard.config.sink(),
        "crashguard initialized"
    );
    Ok(guard)
}

impl Crashguard {
    /// Builds a guard bound to `registry`. [`init`] is the normal entry point; a guard built here
    /// must be leaked before its hooks can be installed.
    pub fn new(
        config: CrashguardConfiguration,
        registry: &'static HandlerRegistry,
    ) -> anyhow::Result<Self> {
        let sink = DiagnosticSink::open(config.sink())?;
        Ok(Self {
            installed: Default::default(),
            registry,
            reporter: DiagnosticReporter::new(&config),
            sink,
            config,
        })
    }

    pub fn get() -> Option<&'static Crashguard> {
        CRASHGUARD.get()
    }

    pub fn config(&self) -> &CrashguardConfiguration {
        &self.config
    }

    pub fn registry(&self) -> &'static HandlerRegistry {
        self.registry
    }

    pub fn reporter(&self) -> &DiagnosticReporter {
        &self.reporter
    }

    /// Registers the panic hook; panics are reported as uncaught errors and then handed to the
    /// previous panic hook.
    pub fn install_uncaught_error_hook(
        &'static self,
    ) -> anyhow::Result<Option<&'static HandlerRecord>> {
        self.claim(HookKind::UncaughtError)?;
        super::panic_hook::register_panic_hook(self.registry);
        Ok(self.install_reporting_hook(HookKind::UncaughtError))
    }

    pub fn install_abstract_dispatch_misuse_hook(
        &'static self,
    ) -> anyhow::Result<Option<&'static HandlerRecord>> {
        self.claim(HookKind::AbstractDispatchMisuse)?;
        Ok(self.install_reporting_hook(HookKind::AbstractDispatchMisuse))
    }

    pub fn install_invalid_argument_hook(
        &'static self,
    ) -> anyhow::Result<Option<&'static HandlerRecord>> {
        self.claim(HookKind::InvalidArgument)?;
        Ok(self.install_reporting_hook(HookKind::InvalidArgument))
    }

    /// Only allocations served by a [`crate::GuardedAllocator`] reach this hook.
    pub fn install_allocation_failure_hook(
        &'static self,
    ) -> anyhow::Result<Option<&'static HandlerRecord>> {
        self.claim(HookKind::AllocationFailure)?;
        Ok(self.install_reporting_hook(HookKind::AllocationFailure))
    }

    /// Registers the platform fault handlers: `sigaction` for the configured signals on Unix,
    /// the unhandled exception filter on Windows.
    pub fn install_structured_fault_filter(
        &'static self,
    ) -> anyhow::Result<Option<&'static HandlerRecord>> {
        self.claim(HookKind::StructuredFault)?;
        #[cfg(unix)]
        super::signal_handler_manager::register_crash_handlers(&self.config, self.registry)?;
        #[cfg(windows)]
        super::exception_filter::register_exception_filter(self.registry)?;
        Ok(self.install_reporting_hook(HookKind::StructuredFault))
    }

    /// Installs every hook, stopping at the first failure.
    pub fn install_all(&'static self) -> anyhow::Result<()> {
        self.install_uncaught_error_hook()?;
        self.install_abstract_dispatch_misuse_hook()?;
        self.install_invalid_argument_hook()?;
        self.install_allocation_failure_hook()?;
        self.install_structured_fault_filter()?;
        Ok(())
    }

    pub fn is_installed(&self, kind: HookKind) -> bool {
        self.installed[kind.index()].load(SeqCst)
    }

    /// Writes a report for `ctx` to the sink.
    ///
    /// A condition raised on a thread that is already writing a report of the same kind is not
    /// reported again. Other threads report independently. If the report cannot be written, a
    /// fixed fallback line is written instead.
    pub fn report(&self, ctx: &FaultContext<'_>) {
        let kind = ctx.kind();
        let accessed = REPORTING.try_with(|reporting| {
            if let Ok(_guard) = AtomGuard::new(&reporting[kind.index()]) {
                self.write_report(ctx);
            }
        });
        // Thread-local storage is gone during thread teardown; report without the guard.
        if accessed.is_err() {
            self.write_report(ctx);
        }
    }

    fn write_report(&self, ctx: &FaultContext<'_>) {
        let kind = ctx.kind();
        let mut w = self.sink.writer();
        let result = if kind == HookKind::StructuredFault {
            // SAFETY: structured faults are reported from the signal handler; the process is about
            // to be handed back to the platform.
            unsafe { self.reporter.report_unsynchronized(&mut w, ctx) }
        } else {
            self.reporter.report(&mut w, ctx)
        };
        if result.is_err() {
            self.sink.write_raw(report_failed_line(kind).as_bytes());
        }
    }

    pub(crate) fn write_marker(&self, marker: &str, detail: &str) {
        let _ = writeln!(self.sink.writer(), "{marker} {detail}");
    }

    fn claim(&self, kind: HookKind) -> Result<(), CrashguardError> {
        self.installed[kind.index()]
            .compare_exchange(false, true, SeqCst, SeqCst)
            .map(|_| ())
            .map_err(|_| CrashguardError::AlreadyInstalled(kind))
    }

    fn install_reporting_hook(&'static self, kind: HookKind) -> Option<&'static HandlerRecord> {
        let previous = self.registry.install(
            kind,
            DD_CRASHGUARD_HANDLER_NAME,
            ReportingHook::new(self),
        );
        debug!(
            %kind,
            previous = previous.map(HandlerRecord::name),
            "installed reporting hook"
        );
        previous
    }
}
