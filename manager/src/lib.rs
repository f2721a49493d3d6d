// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Rush Event Manager
//!
//! A generic event manager built on tokio. An event manager is a single task that owns an
//! ordered chain of pluggable handlers and delivers every event, call and info message to them
//! one at a time, in the order the messages reached it.
//!
//! ## Overview
//!
//! - **Handlers**: any type implementing [`EventHandler`] can be installed under a
//!   [`HandlerId`]. Handlers declare the [`Capabilities`] they support; events and info
//!   messages skip the handlers that do not accept them.
//! - **Fault isolation**: a handler whose callback fails or panics is terminated and removed.
//!   The manager and the other handlers carry on.
//! - **Hot swap**: [`EventManager::swap_handler`] replaces a handler at the same position and
//!   hands the state returned by the outgoing handler to the incoming one.
//! - **Links**: a [`Watcher`] linked to a handler receives an [`ExitSignal::HandlerExit`] when the
//!   handler leaves the chain; the handler is removed if the watcher exits first.
//! - **Streams**: [`EventManager::stream`] returns a [`Subscription`] yielding the events
//!   delivered from then on, optionally bounded in time.
//!
//! ## Getting Started
//!
//! ```ignore
//! use manager::{AddOptions, Capabilities, EventHandler, EventSystem, ExitReason, Flow, StartOptions};
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Default)]
//! struct Counter {
//!     seen: u64,
//! }
//!
//! #[async_trait]
//! impl EventHandler<u64> for Counter {
//!     type Call = ();
//!     type Reply = u64;
//!
//!     const CAPABILITIES: Capabilities = Capabilities::EVENTS.with(Capabilities::CALLS);
//!
//!     async fn handle_event(&mut self, event: &u64) -> Result<Flow, manager::Error> {
//!         self.seen += event;
//!         Ok(Flow::Continue)
//!     }
//!
//!     async fn handle_call(&mut self, _: ()) -> Result<(u64, Flow), manager::Error> {
//!         Ok((self.seen, Flow::Continue))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), manager::Error> {
//!     let (system, mut runner) = EventSystem::create(CancellationToken::new());
//!     tokio::spawn(async move { runner.run().await });
//!
//!     let manager = system.start::<u64>(StartOptions::default()).await?;
//!     manager.add_handler("counter", Counter::default(), AddOptions::default()).await?;
//!     manager.notify(2);
//!     manager.notify(3);
//!     assert_eq!(manager.call::<Counter>("counter", ()).await?, 5);
//!
//!     manager.stop(ExitReason::Normal).await
//! }
//! ```
//!

mod chain;
mod config;
mod error;
mod handler;
mod id;
mod mailbox;
mod manager;
mod runner;
mod stream;
mod system;

//
// Configuration
//

/// Default bound applied to [`EventManager::call`].
pub use config::DEFAULT_CALL_TIMEOUT;

/// Options for installing a handler, see [`EventManager::add_handler`].
pub use config::AddOptions;

/// Options for starting a manager, see [`SystemRef::start`].
pub use config::StartOptions;

/// Options for opening a stream subscription, see [`EventManager::stream`].
pub use config::StreamOptions;

//
// Error Handling
//

/// Error type of every manager operation.
pub use error::Error;

//
// Handlers
//

/// Set of operations a handler supports.
pub use handler::Capabilities;

/// Marker trait for the events a manager delivers.
pub use handler::Event;

/// Callback set of a pluggable handler.
///
/// See [`EventManager::add_handler`] for installing handlers.
pub use handler::EventHandler;

/// Whether a handler stays installed after a callback.
pub use handler::Flow;

/// Operation kinds a handler may support.
pub use handler::Operation;

/// Opaque value passed to and returned from handler callbacks.
pub use handler::Payload;

/// Why a handler is being terminated.
pub use handler::Reason;

//
// Identities
//

/// Identity of a handler inside a manager.
pub use id::HandlerId;

/// Unique reference of a stream subscription.
pub use id::Reference;

/// Identity of a manager or watcher inside an event system.
pub use id::UnitId;

//
// Managers
//

/// Handle to a running event manager.
///
/// Clones share the same mailbox. Every operation is applied by the manager in the order it
/// was received.
pub use manager::EventManager;

/// Lifecycle states of a manager.
pub use runner::ManagerLifecycle;

/// Pull side of a stream over a manager's events.
pub use stream::Subscription;

//
// System Management
//

/// Entry point creating an event system.
///
/// See [`SystemRef`] and [`SystemRunner`] for system management.
pub use system::EventSystem;

/// Why a manager or watcher exited.
pub use system::ExitReason;

/// Notifications delivered to linked and monitoring units.
pub use system::ExitSignal;

/// System-level events for coordination.
pub use system::SystemEvent;

/// Reference to the event system: starts, names, links and monitors managers.
pub use system::SystemRef;

/// System runner. Execute using `runner.run().await` in a dedicated task.
pub use system::SystemRunner;

/// Non-manager participant of the event system, receiving [`ExitSignal`]s.
pub use system::Watcher;
