// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, thiserror::Error)]
#[error("Reentrancy guard error: already in use")]
pub struct AtomGuardError;

/// Holds a flag for as long as it lives. A fault raised while a report is being written fails to
/// take the guard and skips straight to chaining.
pub struct AtomGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> AtomGuard<'a> {
    pub fn new(flag: &'a AtomicBool) -> Result<Self, AtomGuardError> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| AtomGuard { flag })
            .map_err(|_| AtomGuardError)
    }
}

impl Drop for AtomGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
