// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Identities
//!
//! The `id` module provides the keys used to address things inside an event system:
//!
//! - [`HandlerId`] names a handler slot inside one manager's chain.
//! - [`Reference`] names a stream subscription.
//! - [`UnitId`] names an addressable unit (a manager or a watcher) inside an
//!   [`EventSystem`](crate::EventSystem).
//!

use serde::{Deserialize, Serialize};

use std::fmt::{Error, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a handler slot.
///
/// A `HandlerId` is a `/`-separated sequence of segments, so related handlers can share a
/// common prefix (`"audit/file"`, `"audit/remote"`). Stream forwarders use the `stream`
/// prefix followed by the subscription reference (`"stream/17"`).
///
/// Identities are unique within one chain at any instant.
///
/// ```ignore
/// use manager::HandlerId;
///
/// let id = HandlerId::from("audit") / "file";
/// assert_eq!(id.to_string(), "audit/file");
/// assert!(HandlerId::from("audit") < id);
/// ```
#[derive(
    Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct HandlerId(Vec<String>);

impl HandlerId {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Identity of the forwarder created for the subscription `reference`.
    pub(crate) fn stream(reference: Reference) -> Self {
        HandlerId::from("stream") / reference.to_string().as_str()
    }
}

fn tokens(str: &str) -> Vec<String> {
    str.split('/')
        .filter(|x| !x.trim().is_empty())
        .map(|s| s.to_string())
        .collect()
}

impl From<&str> for HandlerId {
    fn from(str: &str) -> Self {
        HandlerId(tokens(str))
    }
}

impl From<String> for HandlerId {
    fn from(string: String) -> Self {
        HandlerId::from(string.as_str())
    }
}

impl From<&String> for HandlerId {
    fn from(string: &String) -> Self {
        HandlerId::from(string.as_str())
    }
}

impl From<&HandlerId> for HandlerId {
    fn from(id: &HandlerId) -> Self {
        id.clone()
    }
}

impl std::ops::Div<&str> for HandlerId {
    type Output = HandlerId;

    fn div(self, rhs: &str) -> Self::Output {
        let mut keys = self.0;
        keys.append(&mut tokens(rhs));
        HandlerId(keys)
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{}", self.0.join("/"))
    }
}

impl std::fmt::Debug for HandlerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{}", self.0.join("/"))
    }
}

static NEXT_REFERENCE: AtomicU64 = AtomicU64::new(1);

static NEXT_UNIT: AtomicU64 = AtomicU64::new(1);

/// Unique reference of a stream subscription.
#[derive(
    Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize,
    Deserialize,
)]
pub struct Reference(u64);

impl Reference {
    /// Allocates a fresh reference. References are never reused within a process.
    pub fn new() -> Self {
        Reference(NEXT_REFERENCE.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for Reference {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{}", self.0)
    }
}

/// Identity of an addressable unit (manager or watcher).
#[derive(
    Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize,
    Deserialize,
)]
pub struct UnitId(u64);

impl UnitId {
    pub(crate) fn next() -> Self {
        UnitId(NEXT_UNIT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "<{}>", self.0)
    }
}
