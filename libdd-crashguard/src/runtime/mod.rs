// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runtime slots for the conditions Rust has no platform hook for.
//!
//! Each slot is the registry chain of its kind: `set_*_handler` pushes onto the chain and returns
//! the handler it displaced, and the raising function runs the chain.

mod alloc;
mod invalid_parameter;
mod purecall;

pub use alloc::*;
pub use invalid_parameter::*;
pub use purecall::*;
