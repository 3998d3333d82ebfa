// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dispatch through a capability that is only valid while its owner is fully alive.
//!
//! An owner goes `Constructing -> Live -> Destructing`. Calling the capability in any other state
//! than `Live` with a bound implementation is an abstract-dispatch misuse: it is routed to the
//! purecall runtime slot, which reports it and then returns, or terminates when nothing is
//! installed.

use crate::crash_info::DispatchMisuseInfo;
use crate::registry::{self, HandlerRegistry};
use crate::runtime;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecyclePhase {
    Constructing,
    Live,
    Destructing,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecyclePhase::Constructing => "constructing",
            LifecyclePhase::Live => "live",
            LifecyclePhase::Destructing => "destructing",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability<C> {
    Unset,
    Bound(C),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("{type_name} cannot go from {from} to {to}")]
    InvalidTransition {
        type_name: &'static str,
        from: LifecyclePhase,
        to: LifecyclePhase,
    },
}

pub struct Dispatch<C> {
    type_name: &'static str,
    capability_name: &'static str,
    capability: Capability<C>,
    phase: LifecyclePhase,
    registry: &'static HandlerRegistry,
}

impl<C> Dispatch<C> {
    /// Starts in `Constructing` with nothing bound.
    pub fn new(type_name: &'static str, capability_name: &'static str) -> Self {
        Self {
            type_name,
            capability_name,
            capability: Capability::Unset,
            phase: LifecyclePhase::Constructing,
            registry: registry::registry(),
        }
    }

    /// Routes misuse to `registry` instead of the process-wide one.
    pub fn with_registry(mut self, registry: &'static HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.capability, Capability::Bound(_))
    }

    pub fn bind(&mut self, capability: C) -> Result<(), LifecycleError> {
        if self.phase == LifecyclePhase::Destructing {
            return Err(self.invalid(LifecyclePhase::Destructing));
        }
        self.capability = Capability::Bound(capability);
        Ok(())
    }

    pub fn go_live(&mut self) -> Result<(), LifecycleError> {
        if self.phase != LifecyclePhase::Constructing {
            return Err(self.invalid(LifecyclePhase::Live));
        }
        self.phase = LifecyclePhase::Live;
        Ok(())
    }

    /// Enters `Destructing` and drops the bound implementation. Idempotent.
    pub fn begin_destruction(&mut self) {
        self.phase = LifecyclePhase::Destructing;
        self.capability = Capability::Unset;
    }

    /// Calls `f` with the bound capability, or reports a misuse and returns `None`.
    pub fn invoke<R>(&self, f: impl FnOnce(&C) -> R) -> Option<R> {
        match (&self.capability, self.phase) {
            (Capability::Bound(c), LifecyclePhase::Live) => Some(f(c)),
            _ => {
                runtime::purecall_in(
                    self.registry,
                    DispatchMisuseInfo {
                        type_name: Some(self.type_name),
                        capability: Some(self.capability_name),
                        phase: Some(self.phase),
                    },
                );
                None
            }
        }
    }

    fn invalid(&self, to: LifecyclePhase) -> LifecycleError {
        LifecycleError::InvalidTransition {
            type_name: self.type_name,
            from: self.phase,
            to,
        }
    }
}

impl<C> fmt::Debug for Dispatch<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("type_name", &self.type_name)
            .field("capability", &self.capability_name)
            .field("phase", &self.phase)
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_info::FaultContext;
    use crate::registry::{Disposition, HookKind};
    use std::sync::Mutex;

    type Describe = fn() -> &'static str;

    /// Calls its capability from both its constructor and its destructor.
    struct Widget {
        dispatch: Dispatch<Describe>,
    }

    impl Widget {
        fn new(registry: &'static HandlerRegistry) -> Self {
            let mut dispatch: Dispatch<Describe> =
                Dispatch::new("Widget", "describe").with_registry(registry);
            dispatch.invoke(|describe| describe());
            dispatch.bind((|| "widget") as Describe).unwrap();
            dispatch.go_live().unwrap();
            Self { dispatch }
        }
    }

    impl Drop for Widget {
        fn drop(&mut self) {
            self.dispatch.begin_destruction();
            self.dispatch.invoke(|describe| describe());
        }
    }

    #[test]
    fn test_double_fire_reports_each_phase() {
        static REGISTRY: HandlerRegistry = HandlerRegistry::new();
        static SEEN: Mutex<Vec<(Option<String>, Option<LifecyclePhase>)>> = Mutex::new(Vec::new());
        REGISTRY.install_fn(HookKind::AbstractDispatchMisuse, "recorder", |ctx, _| {
            if let FaultContext::AbstractDispatchMisuse(info) = ctx {
                SEEN.lock()
                    .unwrap()
                    .push((info.type_name.map(str::to_string), info.phase));
            }
            Disposition::Continue
        });

        let widget = Widget::new(&REGISTRY);
        assert_eq!(widget.dispatch.invoke(|describe| describe()), Some("widget"));
        drop(widget);

        let seen = SEEN.lock().unwrap();
        assert_eq!(
            *seen,
            [
                (Some("Widget".to_string()), Some(LifecyclePhase::Constructing)),
                (Some("Widget".to_string()), Some(LifecyclePhase::Destructing)),
            ]
        );
    }

    #[test]
    fn test_transitions() {
        let mut dispatch: Dispatch<Describe> = Dispatch::new("Gadget", "describe");
        assert_eq!(dispatch.phase(), LifecyclePhase::Constructing);
        assert!(!dispatch.is_bound());
        dispatch.go_live().unwrap();
        assert_eq!(
            dispatch.go_live(),
            Err(LifecycleError::InvalidTransition {
                type_name: "Gadget",
                from: LifecyclePhase::Live,
                to: LifecyclePhase::Live,
            })
        );
        dispatch.bind(|| "gadget").unwrap();
        assert!(dispatch.is_bound());
        dispatch.begin_destruction();
        assert!(!dispatch.is_bound());
        assert!(dispatch.bind(|| "again").is_err());
        assert_eq!(
            dispatch.go_live().unwrap_err().to_string(),
            "Gadget cannot go from destructing to live"
        );
    }
}
