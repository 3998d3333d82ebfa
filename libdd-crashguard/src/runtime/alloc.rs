// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Allocation failures become a hookable condition through [`GuardedAllocator`].
//!
//! Installed as the `#[global_allocator]`, it forwards every request to an inner allocator and,
//! when that returns null, runs the allocation-failure chain. The chain answers
//! [`Disposition::Retry`] to try again or anything else to hand null back to the requester, which
//! is the standard out-of-memory result: `try_reserve` style APIs see an error and infallible
//! ones go through `handle_alloc_error`.

use crate::crash_info::{AllocationFailureInfo, FaultContext};
use crate::registry::{registry, Disposition, HandlerRecord, HandlerRegistry, HookKind};
use std::alloc::{GlobalAlloc, Layout, System};
use std::borrow::Cow;
use std::cell::Cell;
use std::ptr;

/// Upper bound on `Retry` answers for a single request.
pub const MAX_ALLOC_RETRIES: usize = 8;

thread_local! {
    static IN_FAILURE_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Installs `handler` for allocation failures and returns the handler it displaced.
pub fn set_alloc_failure_handler<F>(
    name: impl Into<Cow<'static, str>>,
    handler: F,
) -> Option<&'static HandlerRecord>
where
    F: Fn(&FaultContext<'_>, Option<&'static HandlerRecord>) -> Disposition
        + Send
        + Sync
        + 'static,
{
    registry().install_fn(HookKind::AllocationFailure, name, handler)
}

/// Runs the allocation-failure chain for `layout`.
///
/// A failure raised while the chain is already running on this thread, or a chain with nothing
/// installed, yields [`Disposition::OutOfMemory`] without calling anything.
pub fn on_allocation_failure(layout: Layout) -> Disposition {
    on_allocation_failure_in(registry(), layout)
}

pub fn on_allocation_failure_in(registry: &HandlerRegistry, layout: Layout) -> Disposition {
    // `try_with` fails once the thread's locals are torn down; treat that as re-entrant.
    let entered = IN_FAILURE_HOOK
        .try_with(|flag| !flag.replace(true))
        .unwrap_or(false);
    if !entered {
        return Disposition::OutOfMemory;
    }
    let ctx = FaultContext::AllocationFailure(AllocationFailureInfo {
        size: layout.size(),
        align: layout.align(),
    });
    let disposition = registry
        .invoke(&ctx)
        .unwrap_or(Disposition::OutOfMemory);
    let _ = IN_FAILURE_HOOK.try_with(|flag| flag.set(false));
    disposition
}

pub struct GuardedAllocator<A = System> {
    inner: A,
    registry: Option<&'static HandlerRegistry>,
}

impl GuardedAllocator<System> {
    pub const fn system() -> Self {
        Self::new(System)
    }
}

impl<A> GuardedAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self {
            inner,
            registry: None,
        }
    }

    /// Reports failures to `registry` rather than the process-wide one.
    pub const fn with_registry(inner: A, registry: &'static HandlerRegistry) -> Self {
        Self {
            inner,
            registry: Some(registry),
        }
    }

    fn on_failure(&self, layout: Layout) -> Disposition {
        match self.registry {
            Some(registry) => on_allocation_failure_in(registry, layout),
            None => on_allocation_failure(layout),
        }
    }

    fn with_retries(&self, layout: Layout, mut attempt: impl FnMut() -> *mut u8) -> *mut u8 {
        for _ in 0..=MAX_ALLOC_RETRIES {
            let ptr = attempt();
            if !ptr.is_null() {
                return ptr;
            }
            if self.on_failure(layout) != Disposition::Retry {
                break;
            }
        }
        ptr::null_mut()
    }
}

// SAFETY: every request is forwarded unchanged to `inner`, which upholds the GlobalAlloc contract.
unsafe impl<A: GlobalAlloc> GlobalAlloc for GuardedAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with_retries(layout, || self.inner.alloc(layout))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.with_retries(layout, || self.inner.alloc_zeroed(layout))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: the caller guarantees `new_size` with `layout.align()` forms a valid layout.
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        self.with_retries(new_layout, || self.inner.realloc(ptr, layout, new_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Refuses everything larger than a page, and everything once `budget` runs out.
    struct Limited {
        budget: AtomicUsize,
    }

    unsafe impl GlobalAlloc for Limited {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            if layout.size() > 4096
                || self
                    .budget
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
                    .is_err()
            {
                return ptr::null_mut();
            }
            System.alloc(layout)
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            System.dealloc(ptr, layout)
        }
    }

    #[test]
    fn test_failure_without_handler_is_out_of_memory() {
        static REGISTRY: HandlerRegistry = HandlerRegistry::new();
        let alloc = GuardedAllocator::with_registry(
            Limited {
                budget: AtomicUsize::new(0),
            },
            &REGISTRY,
        );
        let layout = Layout::from_size_align(64, 8).unwrap();
        assert!(unsafe { alloc.alloc(layout) }.is_null());
    }

    #[test]
    fn test_handler_sees_request_and_can_retry() {
        static REGISTRY: HandlerRegistry = HandlerRegistry::new();
        static ALLOC: GuardedAllocator<Limited> = GuardedAllocator::with_registry(
            Limited {
                budget: AtomicUsize::new(0),
            },
            &REGISTRY,
        );
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        REGISTRY.install_fn(HookKind::AllocationFailure, "refill", |ctx, _| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            match ctx {
                FaultContext::AllocationFailure(info) if info.size <= 4096 => {
                    ALLOC.inner.budget.store(1, Ordering::SeqCst);
                    Disposition::Retry
                }
                _ => Disposition::OutOfMemory,
            }
        });

        let small = Layout::from_size_align(128, 16).unwrap();
        let ptr = unsafe { ALLOC.alloc(small) };
        assert!(!ptr.is_null());
        unsafe { ALLOC.dealloc(ptr, small) };
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        let large = Layout::from_size_align(1 << 20, 16).unwrap();
        assert!(unsafe { ALLOC.alloc(large) }.is_null());
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retries_are_bounded() {
        static REGISTRY: HandlerRegistry = HandlerRegistry::new();
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        REGISTRY.install_fn(HookKind::AllocationFailure, "always-retry", |_, _| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Disposition::Retry
        });
        let alloc = GuardedAllocator::with_registry(
            Limited {
                budget: AtomicUsize::new(0),
            },
            &REGISTRY,
        );
        let layout = Layout::from_size_align(8, 8).unwrap();
        assert!(unsafe { alloc.alloc(layout) }.is_null());
        assert_eq!(CALLS.load(Ordering::SeqCst), MAX_ALLOC_RETRIES + 1);
    }

    #[test]
    fn test_nested_failure_skips_the_chain() {
        static REGISTRY: HandlerRegistry = HandlerRegistry::new();
        static NESTED: AtomicUsize = AtomicUsize::new(0);
        REGISTRY.install_fn(HookKind::AllocationFailure, "nested", |_, _| {
            let layout = Layout::from_size_align(8, 8).unwrap();
            if on_allocation_failure_in(&REGISTRY, layout) == Disposition::OutOfMemory {
                NESTED.fetch_add(1, Ordering::SeqCst);
            }
            Disposition::OutOfMemory
        });
        let layout = Layout::from_size_align(8, 8).unwrap();
        assert_eq!(
            on_allocation_failure_in(&REGISTRY, layout),
            Disposition::OutOfMemory
        );
        assert_eq!(NESTED.load(Ordering::SeqCst), 1);
    }
}
