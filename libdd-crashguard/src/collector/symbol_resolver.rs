// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Best-effort in-process symbolization of raw instruction pointers.

use crate::crash_info::{demangle, CapturedFrame};
use std::cell::Cell;
use std::ffi::c_void;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};

thread_local! {
    static IN_SESSION: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolResolver {
    demangle: bool,
    synchronized: bool,
}

impl SymbolResolver {
    /// A resolver that takes the backtrace crate's global lock.
    pub fn new(demangle: bool) -> Self {
        Self {
            demangle,
            synchronized: true,
        }
    }

    /// A resolver for signal-handler context.
    ///
    /// # Safety
    ///   Symbol resolution on rust is not guaranteed to be signal safe and sometimes crashes.
    ///   Callers must accept that risk and must not race another resolver on the same data.
    pub unsafe fn new_unsynchronized(demangle: bool) -> Self {
        Self {
            demangle,
            synchronized: false,
        }
    }

    /// Acquires the symbol subsystem for the calling thread.
    ///
    /// Returns `None` if this thread is already inside a session, which only happens when a fault
    /// is raised while a previous report was being symbolized.
    pub fn session(&self) -> Option<SymbolSession<'_>> {
        let reentered = IN_SESSION.with(|flag| flag.replace(true));
        if reentered {
            return None;
        }
        Some(SymbolSession {
            resolver: self,
            _not_send: PhantomData,
        })
    }

    /// Resolves a single address inside its own session. A frame that cannot be resolved, for any
    /// reason, comes back unresolved.
    pub fn resolve(&self, ip: usize) -> CapturedFrame {
        match self.session() {
            Some(session) => session.resolve(ip),
            None => CapturedFrame::unresolved(ip),
        }
    }
}

/// Scoped access to the symbol subsystem. Cached symbol data is released when it drops.
pub struct SymbolSession<'a> {
    resolver: &'a SymbolResolver,
    _not_send: PhantomData<*const ()>,
}

impl SymbolSession<'_> {
    /// A panic raised while resolving yields an unresolved frame.
    ///
    /// Uncaught errors are reported from inside the panic hook, where a second panic aborts the
    /// process before it can be caught. On that path a panicking symbolizer ends the process
    /// instead of producing a partial report.
    pub fn resolve(&self, ip: usize) -> CapturedFrame {
        catch_unwind(AssertUnwindSafe(|| self.resolve_impl(ip)))
            .unwrap_or_else(|_| CapturedFrame::unresolved(ip))
    }

    fn resolve_impl(&self, ip: usize) -> CapturedFrame {
        let mut frame = CapturedFrame::unresolved(ip);
        let mut found = false;
        let mut on_symbol = |symbol: &backtrace::Symbol| {
            // Inlined frames produce several symbols for one address; the first is the innermost.
            if found {
                return;
            }
            found = true;
            frame.symbol_name = symbol.name().map(|name| {
                let raw = name.as_str();
                match raw.and_then(|raw| self.resolver.demangle.then(|| demangle(raw)).flatten()) {
                    Some(demangled) => demangled,
                    None => name.to_string(),
                }
            });
            frame.symbol_address = symbol.addr().map(|addr| addr as usize);
            frame.file = symbol.filename().map(|path| path.display().to_string());
            frame.line = symbol.lineno();
        };
        let addr = ip as *mut c_void;
        if self.resolver.synchronized {
            backtrace::resolve(addr, &mut on_symbol);
        } else {
            // SAFETY: the caller of `new_unsynchronized` accepted the signal-safety caveats.
            unsafe { backtrace::resolve_unsynchronized(addr, &mut on_symbol) };
        }
        frame
    }
}

impl Drop for SymbolSession<'_> {
    fn drop(&mut self) {
        if self.resolver.synchronized {
            backtrace::clear_symbol_cache();
        }
        IN_SESSION.with(|flag| flag.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn well_known_function() -> usize {
        std::hint::black_box(7)
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_resolve_is_idempotent() {
        let resolver = SymbolResolver::new(true);
        let ip = well_known_function as usize;
        let first = resolver.resolve(ip);
        let second = resolver.resolve(ip);
        assert_eq!(first.symbol_name, second.symbol_name);
        assert_eq!(first.symbol_address, second.symbol_address);
        assert_eq!(first.ip, ip);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_resolve_unknown_address() {
        let resolver = SymbolResolver::new(true);
        for _ in 0..2 {
            let frame = resolver.resolve(0x10);
            assert!(!frame.is_resolved());
            assert_eq!(frame.display(0).to_string(), "Frame 0: Unknown - 0x10");
        }
    }

    #[test]
    fn test_sessions_do_not_nest() {
        let resolver = SymbolResolver::new(false);
        let outer = resolver.session();
        assert!(outer.is_some());
        assert!(resolver.session().is_none());
        // A nested request degrades to an unresolved frame instead of re-entering.
        assert!(!resolver.resolve(0x1234).is_resolved());
        drop(outer);
        assert!(resolver.session().is_some());
    }
}
