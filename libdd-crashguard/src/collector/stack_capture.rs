// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Walks the calling thread's stack into a fixed-size buffer.
//!
//! Capturing never allocates: the instruction pointers land in an inline array, so it is usable
//! from an allocation-failure hook and, in its unsynchronized form, from a signal handler.

use super::platform::MAX_BACKTRACE_FRAMES;
use super::symbol_resolver::SymbolResolver;
use crate::crash_info::{CapturedFrame, StackTrace};
use crate::registry::HandlerRegistry;

/// Raw instruction pointers, most recent first.
#[derive(Clone)]
pub struct RawStack {
    ips: [usize; MAX_BACKTRACE_FRAMES],
    len: usize,
}

impl RawStack {
    pub const fn new() -> Self {
        Self {
            ips: [0; MAX_BACKTRACE_FRAMES],
            len: 0,
        }
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.ips[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push(&mut self, ip: usize, max_frames: usize) -> bool {
        if self.len >= max_frames {
            return false;
        }
        self.ips[self.len] = ip;
        self.len += 1;
        self.len < max_frames
    }

    /// Records one frame of a walk. While `entry` is set, frames are kept provisionally: reaching
    /// the function at `entry` discards them together with the entry frame itself.
    fn record(
        &mut self,
        frame: &backtrace::Frame,
        entry: &mut Option<usize>,
        max_frames: usize,
    ) -> bool {
        let ip = frame.ip() as usize;
        match *entry {
            Some(addr) if frame.symbol_address() as usize == addr => {
                *entry = None;
                self.len = 0;
                true
            }
            Some(_) => self.push(ip, MAX_BACKTRACE_FRAMES),
            None => self.push(ip, max_frames),
        }
    }

    fn truncate(&mut self, max_frames: usize) {
        self.len = self.len.min(max_frames);
    }
}

impl Default for RawStack {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RawStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.as_slice().iter().map(|ip| Ip(*ip)))
            .finish()
    }
}

struct Ip(usize);

impl std::fmt::Debug for Ip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Captures at most `max_frames` frames (clamped to [`MAX_BACKTRACE_FRAMES`]). Returns an empty
/// stack when walking is impossible or `max_frames` is zero.
pub fn capture(max_frames: usize) -> RawStack {
    walk(max_frames, None, |on_frame| backtrace::trace(on_frame))
}

/// Like [`capture`] but without taking the backtrace crate's global lock.
///
/// # Safety
///   Must only be used when no other thread can be walking the stack through the backtrace
///   crate at the same time in a way that matters, i.e. from a fault handler that is about to
///   hand the process over to the platform.
/// SIGNAL SAFETY:
///   Walking the stack on rust is not guaranteed to be signal safe.
///   https://github.com/rust-lang/backtrace-rs/issues/414
///   Collecting the `ip` of the frames seems safe in practice.
pub unsafe fn capture_unsynchronized(max_frames: usize) -> RawStack {
    // SAFETY: the caller upholds the contract above.
    walk(max_frames, None, |on_frame| unsafe {
        backtrace::trace_unsynchronized(on_frame)
    })
}

/// Captures the stack of the condition being handled: frames inside the handler chain, up to and
/// including [`HandlerRegistry::invoke`], are left out so the first frame is where the condition
/// entered the chain. Outside of a chain, or where the unwinder cannot tell which function a
/// frame belongs to, this is the same as [`capture`].
pub fn capture_fault_stack(max_frames: usize) -> RawStack {
    walk(max_frames, Some(chain_entry()), |on_frame| backtrace::trace(on_frame))
}

/// [`capture_fault_stack`] without the backtrace crate's lock.
///
/// # Safety
///   Same contract as [`capture_unsynchronized`].
pub unsafe fn capture_fault_stack_unsynchronized(max_frames: usize) -> RawStack {
    // SAFETY: the caller upholds the contract of `capture_unsynchronized`.
    walk(max_frames, Some(chain_entry()), |on_frame| unsafe {
        backtrace::trace_unsynchronized(on_frame)
    })
}

fn chain_entry() -> usize {
    HandlerRegistry::invoke as usize
}

fn walk(
    max_frames: usize,
    mut entry: Option<usize>,
    trace: impl FnOnce(&mut dyn FnMut(&backtrace::Frame) -> bool),
) -> RawStack {
    let max_frames = max_frames.min(MAX_BACKTRACE_FRAMES);
    let mut stack = RawStack::new();
    if max_frames == 0 {
        return stack;
    }
    trace(&mut |frame: &backtrace::Frame| stack.record(frame, &mut entry, max_frames));
    stack.truncate(max_frames);
    stack
}

/// Captures and, when a resolver is given, symbolizes the calling thread's stack.
pub fn capture_stack_trace(max_frames: usize, resolver: Option<&SymbolResolver>) -> StackTrace {
    let stack = capture(max_frames);
    let session = resolver.and_then(SymbolResolver::session);
    let frames = stack
        .as_slice()
        .iter()
        .map(|ip| match &session {
            Some(session) => session.resolve(*ip),
            None => CapturedFrame::unresolved(*ip),
        })
        .collect();
    StackTrace::from_frames(frames)
}
