// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Core library for the Rush event framework.
//! Provides generic event managers: tasks that own an ordered chain of pluggable handlers
//! and deliver events, calls and info messages to them in order.

pub use manager::{
    AddOptions, Capabilities, DEFAULT_CALL_TIMEOUT, Error as ManagerError, Event,
    EventHandler, EventManager, EventSystem, ExitReason, ExitSignal, Flow,
    HandlerId, ManagerLifecycle, Operation, Payload, Reason, Reference,
    StartOptions, StreamOptions, Subscription, SystemEvent, SystemRef,
    SystemRunner, UnitId, Watcher,
};
