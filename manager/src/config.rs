// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Options
//!
//! Typed options accepted when starting a manager, installing a handler and opening a stream.
//!

use crate::UnitId;

use std::time::Duration;

/// Bound applied by [`EventManager::call`](crate::EventManager::call) when the manager was
/// started without an explicit call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for starting a manager.
///
/// ```ignore
/// let options = StartOptions::default()
///     .name("audit")
///     .call_timeout(Some(Duration::from_millis(500)));
/// ```
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Alias registered in the event system.
    pub name: Option<String>,
    /// Unit linked to the manager at start. The manager stops when this unit exits.
    pub link: Option<UnitId>,
    /// Bound for calls made without an explicit timeout. `None` waits forever.
    pub call_timeout: Option<Duration>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            name: None,
            link: None,
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
        }
    }
}

impl StartOptions {
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    pub fn link(mut self, unit: UnitId) -> Self {
        self.link = Some(unit);
        self
    }

    pub fn call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Options for installing a handler.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Watcher notified when the handler leaves the chain. The watcher is linked to the
    /// manager while the handler is installed.
    pub link: Option<UnitId>,
}

impl AddOptions {
    /// Options linking the handler to `unit`.
    pub fn linked(unit: UnitId) -> Self {
        Self { link: Some(unit) }
    }
}

/// Options for opening a stream subscription.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOptions {
    /// Bound for each pull. A pull that times out ends the subscription with an error.
    pub timeout: Option<Duration>,
    /// Lifetime of the subscription, counted from its creation.
    pub duration: Option<Duration>,
}

impl StreamOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}
