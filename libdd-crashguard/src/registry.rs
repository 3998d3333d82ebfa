// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide chains of fault handlers, one chain per [`HookKind`].
//!
//! Each chain is a newest-first linked list of leaked [`HandlerRecord`]s. Installing a handler
//! pushes a record whose `next` pointer is the previous head, and returns that previous head.
//! Records are never freed, so a `&'static HandlerRecord` obtained from the registry stays valid
//! for the life of the process, including from inside signal handlers.

use crate::crash_info::FaultContext;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::SeqCst;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookKind {
    UncaughtError,
    AbstractDispatchMisuse,
    InvalidArgument,
    AllocationFailure,
    StructuredFault,
}

impl HookKind {
    pub const COUNT: usize = 5;

    pub const fn all() -> [HookKind; Self::COUNT] {
        [
            HookKind::UncaughtError,
            HookKind::AbstractDispatchMisuse,
            HookKind::InvalidArgument,
            HookKind::AllocationFailure,
            HookKind::StructuredFault,
        ]
    }

    pub const fn index(self) -> usize {
        match self {
            HookKind::UncaughtError => 0,
            HookKind::AbstractDispatchMisuse => 1,
            HookKind::InvalidArgument => 2,
            HookKind::AllocationFailure => 3,
            HookKind::StructuredFault => 4,
        }
    }

    /// The identifying text written on the `Fault:` line of a report.
    pub const fn as_str(self) -> &'static str {
        match self {
            HookKind::UncaughtError => "uncaught error",
            HookKind::AbstractDispatchMisuse => "abstract dispatch misuse",
            HookKind::InvalidArgument => "invalid argument",
            HookKind::AllocationFailure => "allocation failure",
            HookKind::StructuredFault => "structured fault",
        }
    }

    /// Whether the last resort for this kind ends the process.
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            HookKind::UncaughtError | HookKind::AbstractDispatchMisuse | HookKind::InvalidArgument
        )
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the faulting code path should do once a chain of handlers has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Return to the faulting code. For panics this means unwinding proceeds.
    Continue,
    /// Let the platform look for another handler (Windows `EXCEPTION_CONTINUE_SEARCH`).
    ContinueSearch,
    /// The fault was dealt with; the platform performs its default termination.
    Handled,
    /// Allocation only: try the request again.
    Retry,
    /// Allocation only: hand the standard out-of-memory result back to the requester.
    OutOfMemory,
}

/// The invoke contract shared by every record in a chain.
///
/// `next` is the record that was installed before this one. A handler that wants the older
/// behaviour to run calls [`HandlerRecord::invoke`] on it.
pub trait FaultHandler: Send + Sync {
    fn handle(&self, ctx: &FaultContext<'_>, next: Option<&'static HandlerRecord>) -> Disposition;
}

/// Adapts a closure into a [`FaultHandler`]. Built by [`HandlerRegistry::install_fn`].
pub struct FnHandler<F>(F);

impl<F> FaultHandler for FnHandler<F>
where
    F: Fn(&FaultContext<'_>, Option<&'static HandlerRecord>) -> Disposition + Send + Sync,
{
    fn handle(&self, ctx: &FaultContext<'_>, next: Option<&'static HandlerRecord>) -> Disposition {
        (self.0)(ctx, next)
    }
}

pub struct HandlerRecord {
    name: Cow<'static, str>,
    handler: Box<dyn FaultHandler>,
    next: Option<&'static HandlerRecord>,
}

impl HandlerRecord {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn next(&self) -> Option<&'static HandlerRecord> {
        self.next
    }

    pub fn invoke(&self, ctx: &FaultContext<'_>) -> Disposition {
        self.handler.handle(ctx, self.next)
    }
}

impl fmt::Debug for HandlerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRecord")
            .field("name", &self.name)
            .field("next", &self.next.map(|n| n.name()))
            .finish()
    }
}

#[derive(Debug)]
pub struct HandlerRegistry {
    heads: [AtomicPtr<HandlerRecord>; HookKind::COUNT],
}

static REGISTRY: HandlerRegistry = HandlerRegistry::new();

/// The registry consulted by the platform hooks and the runtime slots.
pub fn registry() -> &'static HandlerRegistry {
    &REGISTRY
}

impl HandlerRegistry {
    pub const fn new() -> Self {
        Self {
            heads: [
                AtomicPtr::new(ptr::null_mut()),
                AtomicPtr::new(ptr::null_mut()),
                AtomicPtr::new(ptr::null_mut()),
                AtomicPtr::new(ptr::null_mut()),
                AtomicPtr::new(ptr::null_mut()),
            ],
        }
    }

    /// Pushes `handler` onto the chain for `kind` and returns the record it displaced.
    ///
    /// ATOMICITY:
    ///     The push is a single compare-exchange on the head, so the returned record is exactly
    ///     the one that the new record chains to, even if installs race.
    pub fn install<H>(
        &self,
        kind: HookKind,
        name: impl Into<Cow<'static, str>>,
        handler: H,
    ) -> Option<&'static HandlerRecord>
    where
        H: FaultHandler + 'static,
    {
        let head = &self.heads[kind.index()];
        let mut record = Box::new(HandlerRecord {
            name: name.into(),
            handler: Box::new(handler),
            next: None,
        });
        loop {
            let current = head.load(SeqCst);
            // SAFETY: non-null heads always come from `Box::into_raw` below and are never freed.
            record.next = unsafe { current.as_ref() };
            let raw = Box::into_raw(record);
            match head.compare_exchange(current, raw, SeqCst, SeqCst) {
                Ok(_) => return record_ref(current),
                // SAFETY: the exchange failed, so `raw` was never published.
                Err(_) => record = unsafe { Box::from_raw(raw) },
            }
        }
    }

    pub fn install_fn<F>(
        &self,
        kind: HookKind,
        name: impl Into<Cow<'static, str>>,
        f: F,
    ) -> Option<&'static HandlerRecord>
    where
        F: Fn(&FaultContext<'_>, Option<&'static HandlerRecord>) -> Disposition
            + Send
            + Sync
            + 'static,
    {
        self.install(kind, name, FnHandler(f))
    }

    /// The most recently installed record for `kind`.
    pub fn head(&self, kind: HookKind) -> Option<&'static HandlerRecord> {
        record_ref(self.heads[kind.index()].load(SeqCst))
    }

    /// Runs the chain for the kind of `ctx`. `None` means nothing is installed.
    ///
    /// Never inlined: captured fault stacks are cut at this frame.
    #[inline(never)]
    pub fn invoke(&self, ctx: &FaultContext<'_>) -> Option<Disposition> {
        self.head(ctx.kind()).map(|record| record.invoke(ctx))
    }

    /// Iterates the chain for `kind`, newest first.
    pub fn chain(&self, kind: HookKind) -> impl Iterator<Item = &'static HandlerRecord> {
        std::iter::successors(self.head(kind), |record| record.next())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn record_ref(ptr: *mut HandlerRecord) -> Option<&'static HandlerRecord> {
    // SAFETY: records are leaked on install and live for the rest of the process.
    unsafe { ptr.cast_const().as_ref() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_info::InvalidArgumentInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn invalid_argument() -> FaultContext<'static> {
        FaultContext::InvalidArgument(InvalidArgumentInfo::default())
    }

    #[test]
    fn test_install_returns_previous_head() {
        static REGISTRY: HandlerRegistry = HandlerRegistry::new();
        assert!(REGISTRY.head(HookKind::InvalidArgument).is_none());

        let prev = REGISTRY.install_fn(HookKind::InvalidArgument, "first", |_, _| {
            Disposition::Continue
        });
        assert!(prev.is_none());

        let prev = REGISTRY.install_fn(HookKind::InvalidArgument, "second", |_, _| {
            Disposition::Continue
        });
        assert_eq!(prev.map(|r| r.name()), Some("first"));

        let names: Vec<_> = REGISTRY
            .chain(HookKind::InvalidArgument)
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, ["second", "first"]);
        // Other kinds are untouched.
        assert!(REGISTRY.head(HookKind::StructuredFault).is_none());
    }

    #[test]
    fn test_newest_handler_runs_first_and_chains() {
        static REGISTRY: HandlerRegistry = HandlerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        REGISTRY.install_fn(HookKind::InvalidArgument, "older", move |_, next| {
            o.lock().unwrap().push("older");
            assert!(next.is_none());
            Disposition::Continue
        });
        let o = order.clone();
        REGISTRY.install_fn(HookKind::InvalidArgument, "newer", move |ctx, next| {
            o.lock().unwrap().push("newer");
            next.map_or(Disposition::Handled, |n| n.invoke(ctx))
        });

        assert_eq!(
            REGISTRY.invoke(&invalid_argument()),
            Some(Disposition::Continue)
        );
        assert_eq!(*order.lock().unwrap(), ["newer", "older"]);
    }

    #[test]
    fn test_invoke_without_handlers() {
        let registry = HandlerRegistry::new();
        assert_eq!(registry.invoke(&invalid_argument()), None);
    }

    #[test]
    fn test_concurrent_installs_keep_every_record() {
        static REGISTRY: HandlerRegistry = HandlerRegistry::new();
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for i in 0..8 {
                s.spawn(move || {
                    REGISTRY.install_fn(
                        HookKind::AllocationFailure,
                        format!("handler-{i}"),
                        |ctx, next| {
                            CALLS.fetch_add(1, Ordering::SeqCst);
                            next.map_or(Disposition::OutOfMemory, |n| n.invoke(ctx))
                        },
                    );
                });
            }
        });

        assert_eq!(REGISTRY.chain(HookKind::AllocationFailure).count(), 8);
        let ctx = FaultContext::AllocationFailure(crate::crash_info::AllocationFailureInfo {
            size: 16,
            align: 8,
        });
        assert_eq!(REGISTRY.invoke(&ctx), Some(Disposition::OutOfMemory));
        assert_eq!(CALLS.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_kind_texts() {
        let texts: Vec<_> = HookKind::all().iter().map(|k| k.to_string()).collect();
        assert_eq!(
            texts,
            [
                "uncaught error",
                "abstract dispatch misuse",
                "invalid argument",
                "allocation failure",
                "structured fault"
            ]
        );
        for (i, kind) in HookKind::all().into_iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        assert!(!HookKind::AllocationFailure.is_fatal());
        assert!(!HookKind::StructuredFault.is_fatal());
    }
}
