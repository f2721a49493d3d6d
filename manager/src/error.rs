// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Errors module
//!
//! This module defines the error type shared by the event manager, its handlers and the
//! surrounding system. Handlers return it from their callbacks; managers return it to callers.
//!

use crate::{HandlerId, handler::Operation};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::time::Duration;

/// Error type for the event manager.
///
/// The first four variants are the recoverable, caller-visible errors of the manager protocol.
/// The remaining variants describe handler faults, registry conflicts and transport problems.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// No handler with the given identity is installed.
    #[error("Handler {0} not found.")]
    NotFound(HandlerId),
    /// A handler with the given identity is already installed.
    #[error("Handler {0} already present.")]
    AlreadyPresent(HandlerId),
    /// The manager (or another unit) is not running.
    #[error("Event manager is not running.")]
    NoProc,
    /// The operation did not complete in time.
    #[error("Operation timed out after {0:?}.")]
    Timeout(Duration),
    /// The handler does not implement the requested callback.
    #[error("Handler {0} does not support {1}.")]
    Unsupported(HandlerId, Operation),
    /// The call message or its reply does not have the handler's types.
    #[error("Call to handler {0} has an unexpected message or reply type.")]
    BadCall(HandlerId),
    /// A callback was invoked on a handler that does not implement it. The chain reports it
    /// to callers as `Unsupported`.
    #[error("Callback {0} is not implemented.")]
    Unimplemented(Operation),
    /// A handler callback failed or panicked.
    #[error("Handler {0} failed: {1}")]
    Handler(HandlerId, String),
    /// A handler could not be initialized.
    #[error("Handler {0} failed to init: {1}")]
    Init(HandlerId, String),
    /// The name is already registered in the event system.
    #[error("Name {0} is already registered.")]
    NameTaken(String),
    /// Domain error raised by handler code.
    #[error("Error: {0}")]
    Functional(String),
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_display() {
        let error = Error::NotFound(HandlerId::from("logger"));
        assert_eq!(error.to_string(), "Handler logger not found.");
        let error = Error::Unsupported(HandlerId::from("logger"), Operation::Call);
        assert_eq!(error.to_string(), "Handler logger does not support call.");
        assert_eq!(
            Error::Timeout(Duration::from_millis(50)).to_string(),
            "Operation timed out after 50ms."
        );
        assert_eq!(
            Error::Unimplemented(Operation::Info).to_string(),
            "Callback info is not implemented."
        );
    }
}
