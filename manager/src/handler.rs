// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Event handlers
//!
//! This module defines the callback set a handler plugs into an event manager with, and the
//! values exchanged with those callbacks.
//!
//! A handler is any type implementing [`EventHandler`]. The handler value is its own private
//! state: the manager owns it exclusively once installed, and only the manager's loop ever
//! touches it. Handlers implement a subset of the callbacks and declare which ones through
//! [`EventHandler::CAPABILITIES`]. The manager checks the declaration before invoking a
//! callback, so a handler that only observes events never sees calls or info messages.
//!

use crate::{Error, HandlerId, system::ExitReason};

use async_trait::async_trait;

use std::{
    any::Any,
    fmt::{Debug, Formatter},
    sync::Arc,
};

/// Trait implemented by all events a manager delivers.
///
/// Events are cloned once per stream subscription, and shared by reference with every handler
/// of the chain.
pub trait Event: Debug + Clone + Send + Sync + 'static {}

impl<T> Event for T where T: Debug + Clone + Send + Sync + 'static {}

/// Callback kinds a handler may support.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub enum Operation {
    /// `handle_event`, used by `notify` and `sync_notify`.
    Event,
    /// `handle_call`, used by `call`.
    Call,
    /// `handle_info`, used by `info`.
    Info,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Event => write!(f, "event"),
            Operation::Call => write!(f, "call"),
            Operation::Info => write!(f, "info"),
        }
    }
}

/// Set of callbacks a handler implements.
///
/// ```ignore
/// const CAPABILITIES: Capabilities = Capabilities::EVENTS.with(Capabilities::CALLS);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Self = Capabilities(0);
    pub const EVENTS: Self = Capabilities(1);
    pub const CALLS: Self = Capabilities(1 << 1);
    pub const INFO: Self = Capabilities(1 << 2);
    pub const ALL: Self = Capabilities(0b111);

    /// Union of two capability sets.
    pub const fn with(self, other: Self) -> Self {
        Capabilities(self.0 | other.0)
    }

    /// Returns true if the callback for `operation` is implemented.
    pub const fn supports(self, operation: Operation) -> bool {
        let bit = match operation {
            Operation::Event => Self::EVENTS.0,
            Operation::Call => Self::CALLS.0,
            Operation::Info => Self::INFO.0,
        };
        self.0 & bit != 0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.with(rhs)
    }
}

/// Outcome of an event, call or info callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Keep the handler installed.
    Continue,
    /// Remove the handler once the current dispatch is over.
    Remove,
}

/// Type-erased, cheaply cloneable value.
///
/// Payloads carry the arguments of `remove_handler` and `swap_handler`, info messages, and the
/// state handed from a swapped-out handler to its replacement.
#[derive(Clone)]
pub struct Payload(Arc<dyn Any + Send + Sync>);

impl Payload {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Payload(Arc::new(value))
    }

    /// Payload carrying `()`.
    pub fn empty() -> Self {
        Payload::new(())
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Recovers the shared value, or gives the payload back if `T` is not its type.
    pub fn downcast<T: Any + Send + Sync>(self) -> Result<Arc<T>, Payload> {
        self.0.downcast::<T>().map_err(Payload)
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::empty()
    }
}

impl Debug for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Payload(..)")
    }
}

/// Why a handler is being terminated.
#[derive(Debug, Clone)]
pub enum Reason {
    /// Removed by `remove_handler`, with the caller's arguments.
    Removed(Payload),
    /// The handler itself returned [`Flow::Remove`].
    Requested,
    /// Replaced by `swap_handler`.
    Swapped {
        /// Arguments given for the outgoing handler.
        args: Payload,
        /// Identity of the incoming handler.
        replacement: HandlerId,
    },
    /// A callback returned an error or panicked.
    Fault(Error),
    /// The stream subscription this forwarder serves ran out of time.
    Expired,
    /// The watcher the handler was linked to exited.
    WatcherExited(ExitReason),
    /// The manager is stopping.
    Stop(ExitReason),
}

impl Reason {
    pub fn is_fault(&self) -> bool {
        matches!(self, Reason::Fault(_))
    }

    /// Reason reported to a linked watcher when the handler goes away.
    pub(crate) fn exit_reason(&self) -> ExitReason {
        match self {
            Reason::Removed(_) | Reason::Requested | Reason::Expired => {
                ExitReason::Normal
            }
            Reason::Swapped { replacement, .. } => {
                ExitReason::Swapped(replacement.clone())
            }
            Reason::Fault(error) => ExitReason::Fault(error.clone()),
            Reason::WatcherExited(reason) | Reason::Stop(reason) => {
                reason.clone()
            }
        }
    }
}

/// Callback set of a handler installed in an [`EventManager`](crate::EventManager).
///
/// Every callback runs inside the manager's loop, one at a time. Returning an `Err` (or
/// panicking) from `handle_event`, `handle_call` or `handle_info` is a handler fault: the
/// handler is terminated with [`Reason::Fault`] and removed, while the manager and the other
/// handlers carry on.
///
/// Handlers declare no capability unless they say otherwise. A callback left to its default
/// body is not a fault: events and info messages pass the handler by, and calls fail with
/// [`Error::Unsupported`].
///
/// # Example
///
/// ```ignore
/// use manager::{Capabilities, Error, EventHandler, Flow};
/// use async_trait::async_trait;
///
/// #[derive(Default)]
/// struct Recorder {
///     seen: Vec<u32>,
/// }
///
/// #[async_trait]
/// impl EventHandler<u32> for Recorder {
///     type Call = ();
///     type Reply = Vec<u32>;
///
///     const CAPABILITIES: Capabilities = Capabilities::EVENTS.with(Capabilities::CALLS);
///
///     async fn handle_event(&mut self, event: &u32) -> Result<Flow, Error> {
///         self.seen.push(*event);
///         Ok(Flow::Continue)
///     }
///
///     async fn handle_call(&mut self, _msg: ()) -> Result<(Vec<u32>, Flow), Error> {
///         Ok((std::mem::take(&mut self.seen), Flow::Continue))
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler<E: Event>: Send + 'static {
    /// Messages accepted by `handle_call`.
    type Call: Send + 'static;

    /// Replies produced by `handle_call`.
    type Reply: Send + 'static;

    /// Callbacks this handler implements.
    const CAPABILITIES: Capabilities = Capabilities::NONE;

    /// Runs before the handler enters the chain. `transfer` is the value returned by the
    /// `terminate` of the handler this one replaces, when installed through a swap.
    ///
    /// An error rejects the installation.
    async fn init(&mut self, _transfer: Option<Payload>) -> Result<(), Error> {
        Ok(())
    }

    async fn handle_event(&mut self, _event: &E) -> Result<Flow, Error> {
        Err(Error::Unimplemented(Operation::Event))
    }

    async fn handle_call(
        &mut self,
        _msg: Self::Call,
    ) -> Result<(Self::Reply, Flow), Error> {
        Err(Error::Unimplemented(Operation::Call))
    }

    async fn handle_info(&mut self, _info: &Payload) -> Result<Flow, Error> {
        Err(Error::Unimplemented(Operation::Info))
    }

    /// Runs when the handler leaves the chain, whatever the reason. The returned value is
    /// handed to the replacement's `init` on a swap and ignored otherwise.
    async fn terminate(&mut self, _reason: &Reason) -> Option<Payload> {
        None
    }
}

/// Type-erased call message or reply.
pub(crate) type CallMessage = Box<dyn Any + Send>;

/// Boxed handler as stored in a chain slot.
pub(crate) type BoxedHandler<E> = Box<dyn ErasedHandler<E>>;

/// Object-safe view of an [`EventHandler`], used so that handlers with different call
/// protocols can share one chain.
#[async_trait]
pub(crate) trait ErasedHandler<E: Event>: Send {
    fn capabilities(&self) -> Capabilities;

    /// Returns true if `message` has the handler's call type.
    fn accepts(&self, message: &CallMessage) -> bool;

    async fn init(&mut self, transfer: Option<Payload>) -> Result<(), Error>;

    async fn handle_event(&mut self, event: &E) -> Result<Flow, Error>;

    async fn handle_call(
        &mut self,
        message: CallMessage,
    ) -> Result<(CallMessage, Flow), Error>;

    async fn handle_info(&mut self, info: &Payload) -> Result<Flow, Error>;

    async fn terminate(&mut self, reason: &Reason) -> Option<Payload>;
}

#[async_trait]
impl<E, H> ErasedHandler<E> for H
where
    E: Event,
    H: EventHandler<E>,
{
    fn capabilities(&self) -> Capabilities {
        <H as EventHandler<E>>::CAPABILITIES
    }

    fn accepts(&self, message: &CallMessage) -> bool {
        (**message).is::<<H as EventHandler<E>>::Call>()
    }

    async fn init(&mut self, transfer: Option<Payload>) -> Result<(), Error> {
        <H as EventHandler<E>>::init(self, transfer).await
    }

    async fn handle_event(&mut self, event: &E) -> Result<Flow, Error> {
        <H as EventHandler<E>>::handle_event(self, event).await
    }

    async fn handle_call(
        &mut self,
        message: CallMessage,
    ) -> Result<(CallMessage, Flow), Error> {
        let message = message.downcast::<<H as EventHandler<E>>::Call>().map_err(|_| {
            Error::Functional("Unexpected call message type".to_owned())
        })?;
        let (reply, flow) =
            <H as EventHandler<E>>::handle_call(self, *message).await?;
        Ok((Box::new(reply), flow))
    }

    async fn handle_info(&mut self, info: &Payload) -> Result<Flow, Error> {
        <H as EventHandler<E>>::handle_info(self, info).await
    }

    async fn terminate(&mut self, reason: &Reason) -> Option<Payload> {
        <H as EventHandler<E>>::terminate(self, reason).await
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    struct Counter {
        total: u32,
    }

    #[async_trait]
    impl EventHandler<u32> for Counter {
        type Call = u32;
        type Reply = u32;

        const CAPABILITIES: Capabilities =
            Capabilities::EVENTS.with(Capabilities::CALLS);

        async fn handle_event(&mut self, event: &u32) -> Result<Flow, Error> {
            self.total += event;
            Ok(Flow::Continue)
        }

        async fn handle_call(&mut self, msg: u32) -> Result<(u32, Flow), Error> {
            Ok((self.total * msg, Flow::Remove))
        }
    }

    struct Bare;

    #[async_trait]
    impl EventHandler<u32> for Bare {
        type Call = ();
        type Reply = ();
    }

    #[tokio::test]
    async fn test_default_callbacks() {
        assert_eq!(<Bare as EventHandler<u32>>::CAPABILITIES, Capabilities::NONE);
        let mut handler: BoxedHandler<u32> = Box::new(Bare);
        assert_eq!(
            handler.handle_event(&1).await,
            Err(Error::Unimplemented(Operation::Event))
        );
        assert_eq!(
            handler.handle_info(&Payload::empty()).await,
            Err(Error::Unimplemented(Operation::Info))
        );
        assert!(matches!(
            handler.handle_call(Box::new(())).await,
            Err(Error::Unimplemented(Operation::Call))
        ));
    }

    #[test]
    fn test_capabilities() {
        let caps = Capabilities::EVENTS | Capabilities::INFO;
        assert!(caps.supports(Operation::Event));
        assert!(caps.supports(Operation::Info));
        assert!(!caps.supports(Operation::Call));
        assert!(!Capabilities::NONE.supports(Operation::Event));
        assert_eq!(
            Capabilities::EVENTS.with(Capabilities::CALLS).with(Capabilities::INFO),
            Capabilities::ALL
        );
    }

    #[test]
    fn test_payload() {
        let payload = Payload::new(String::from("args"));
        assert!(payload.is::<String>());
        assert_eq!(payload.downcast_ref::<String>().map(String::as_str), Some("args"));
        assert!(payload.downcast_ref::<u32>().is_none());
        let payload = payload.downcast::<u32>().unwrap_err();
        assert_eq!(*payload.downcast::<String>().unwrap(), "args");
        assert!(Payload::default().is::<()>());
    }

    #[test]
    fn test_exit_reason() {
        assert_eq!(Reason::Requested.exit_reason(), ExitReason::Normal);
        let reason = Reason::Swapped {
            args: Payload::empty(),
            replacement: HandlerId::from("next"),
        };
        assert_eq!(reason.exit_reason(), ExitReason::Swapped(HandlerId::from("next")));
        let fault = Reason::Fault(Error::Functional("boom".to_owned()));
        assert!(fault.is_fault());
        assert_eq!(
            fault.exit_reason(),
            ExitReason::Fault(Error::Functional("boom".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_erased_handler() {
        let mut handler: BoxedHandler<u32> = Box::new(Counter { total: 0 });
        assert_eq!(handler.capabilities(), Capabilities::EVENTS | Capabilities::CALLS);
        assert_eq!(handler.handle_event(&5).await.unwrap(), Flow::Continue);

        let message: CallMessage = Box::new(2u32);
        assert!(handler.accepts(&message));
        let (reply, flow) = handler.handle_call(message).await.unwrap();
        assert_eq!(*reply.downcast::<u32>().unwrap(), 10);
        assert_eq!(flow, Flow::Remove);

        let wrong: CallMessage = Box::new("wrong");
        assert!(!handler.accepts(&wrong));
        assert!(handler.handle_info(&Payload::empty()).await.is_err());
    }
}
