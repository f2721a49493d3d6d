// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Event manager handle
//!
//! [`EventManager`] is the caller-side handle of a running manager. It is cheap to clone, and
//! every clone talks to the same mailbox: operations from all clones are applied in the order
//! they reach the manager.
//!

use crate::{
    Error, HandlerId, UnitId,
    config::{AddOptions, StreamOptions},
    handler::{CallMessage, Event, EventHandler, Payload, Reason},
    mailbox::{Command, MailboxHelper},
    stream::Subscription,
    system::{ExitReason, SignalSink},
};

use tracing::debug;

use std::{any::Any, time::Duration};

/// Handle to a running event manager.
///
/// # Example
///
/// ```ignore
/// let (system, _runner) = EventSystem::create(CancellationToken::new());
/// let manager = system.start::<u32>(StartOptions::default()).await?;
///
/// manager.add_handler("recorder", Recorder::default(), AddOptions::default()).await?;
/// manager.notify(1);
/// manager.sync_notify(2).await?;
/// let seen = manager.call::<Recorder>("recorder", ()).await?;
/// assert_eq!(seen, vec![1, 2]);
///
/// manager.stop(ExitReason::Normal).await?;
/// ```
pub struct EventManager<E: Event> {
    id: UnitId,

    sender: MailboxHelper<E>,

    /// Bound applied by `call`.
    call_timeout: Option<Duration>,
}

impl<E: Event> EventManager<E> {
    pub(crate) fn new(
        id: UnitId,
        sender: MailboxHelper<E>,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            sender,
            call_timeout,
        }
    }

    /// Identity of the manager in its event system.
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Queues `event` for every handler and returns at once. Delivery to a stopped manager is
    /// silently dropped.
    ///
    /// # Arguments
    ///
    /// * `event` - The event to deliver.
    ///
    pub fn notify(&self, event: E) {
        let _ = self.sender.tell(Command::Notify(event));
    }

    /// Delivers `event` to every handler and waits until all of them have seen it.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoProc` if the manager is not running or stops before the delivery.
    pub async fn sync_notify(&self, event: E) -> Result<(), Error> {
        self.sender
            .ask(|rsvp| Command::SyncNotify { event, rsvp })
            .await
    }

    /// Queues an info message for every info-capable handler and returns at once.
    pub fn info<T: Any + Send + Sync>(&self, info: T) {
        let _ = self.sender.tell(Command::Info(Payload::new(info)));
    }

    /// Sends `msg` to the handler `id` and waits for its reply, bounded by the manager's
    /// call timeout.
    ///
    /// # Arguments
    ///
    /// * `id` - The handler to call. `H` is its type; it fixes the message and reply types.
    /// * `msg` - The call message.
    ///
    /// # Returns
    ///
    /// Returns the handler's reply.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if no handler is installed under `id`.
    /// - `Error::Unsupported` if the handler does not accept calls.
    /// - `Error::BadCall` if the handler is not an `H`.
    /// - `Error::Handler` if the handler failed; it is removed.
    /// - `Error::Timeout` if no reply arrived in time.
    /// - `Error::NoProc` if the manager is not running.
    pub async fn call<H>(
        &self,
        id: impl Into<HandlerId>,
        msg: H::Call,
    ) -> Result<H::Reply, Error>
    where
        H: EventHandler<E>,
    {
        self.call_timeout::<H>(id, msg, self.call_timeout).await
    }

    /// Same as [`call`](Self::call) with an explicit bound. `None` waits forever.
    pub async fn call_timeout<H>(
        &self,
        id: impl Into<HandlerId>,
        msg: H::Call,
        timeout: Option<Duration>,
    ) -> Result<H::Reply, Error>
    where
        H: EventHandler<E>,
    {
        let id = id.into();
        let message: CallMessage = Box::new(msg);
        let target = id.clone();
        let request = self.sender.ask(|rsvp| Command::Call {
            id: target,
            message,
            rsvp,
        });
        let response = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, request)
                .await
                .map_err(|_| {
                    debug!("Call to handler {} timed out.", id);
                    Error::Timeout(timeout)
                })???,
            None => request.await??,
        };
        response
            .downcast::<H::Reply>()
            .map(|reply| *reply)
            .map_err(|_| Error::BadCall(id))
    }

    /// Installs `handler` under `id` at the end of the chain.
    ///
    /// # Arguments
    ///
    /// * `id` - Identity of the new handler.
    /// * `handler` - The handler; it is moved into the manager.
    /// * `options` - The watcher to link the handler to, if any.
    ///
    /// With `options.link`, the watcher is linked to the manager and receives an
    /// [`ExitSignal::HandlerExit`](crate::ExitSignal::HandlerExit) when the handler leaves
    /// the chain; the handler is removed if the watcher exits.
    ///
    /// # Errors
    ///
    /// - `Error::AlreadyPresent` if `id` is taken.
    /// - `Error::Init` if the handler's `init` failed.
    /// - `Error::NoProc` if the manager, or the watcher to link, is not running.
    pub async fn add_handler<H>(
        &self,
        id: impl Into<HandlerId>,
        handler: H,
        options: AddOptions,
    ) -> Result<(), Error>
    where
        H: EventHandler<E>,
    {
        let id = id.into();
        self.sender
            .ask(|rsvp| Command::Add {
                id,
                handler: Box::new(handler),
                link: options.link,
                rsvp,
            })
            .await?
    }

    /// Terminates the handler `id` with [`Reason::Removed`] carrying `args`, and removes it.
    ///
    /// # Arguments
    ///
    /// * `id` - The handler to remove. A [`Subscription`] may be given to end it.
    /// * `args` - Value handed to the handler's `terminate`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no handler is installed under `id`, and `Error::NoProc` if
    /// the manager is not running.
    pub async fn remove_handler(
        &self,
        id: impl Into<HandlerId>,
        args: Payload,
    ) -> Result<(), Error> {
        let id = id.into();
        self.sender
            .ask(|rsvp| Command::Remove { id, args, rsvp })
            .await?
    }

    /// Replaces handler `old` by `handler` installed under `id`, at the same position.
    ///
    /// `old` is terminated with [`Reason::Swapped`] carrying `old_args`; whatever its
    /// `terminate` returns is given to the `init` of `handler`. A link held by `old` does not
    /// carry over: `handler` is linked only if `options.link` says so.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if `old` is not installed.
    /// - `Error::AlreadyPresent` if `id` is taken by another handler.
    /// - `Error::Init` if `handler` failed to init; `old` is gone anyway.
    pub async fn swap_handler<H>(
        &self,
        old: impl Into<HandlerId>,
        old_args: Payload,
        id: impl Into<HandlerId>,
        handler: H,
        options: AddOptions,
    ) -> Result<(), Error>
    where
        H: EventHandler<E>,
    {
        let old = old.into();
        let id = id.into();
        self.sender
            .ask(|rsvp| Command::Swap {
                old,
                args: old_args,
                id,
                handler: Box::new(handler),
                link: options.link,
                rsvp,
            })
            .await?
    }

    /// Identities of the installed handlers, in dispatch order.
    pub async fn which_handlers(&self) -> Result<Vec<HandlerId>, Error> {
        self.sender.ask(|rsvp| Command::Which { rsvp }).await
    }

    /// Opens a stream subscription over the events delivered from now on.
    ///
    /// # Arguments
    ///
    /// * `options` - Pull timeout and lifetime of the subscription.
    ///
    /// # Returns
    ///
    /// Returns the subscription. Dropping it removes its forwarder.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoProc` if the manager is not running.
    pub async fn stream(
        &self,
        options: StreamOptions,
    ) -> Result<Subscription<E>, Error> {
        Subscription::open(self, options).await
    }

    /// Terminates every handler in order and stops the manager. Returns once the manager has
    /// left the event system.
    ///
    /// # Arguments
    ///
    /// * `reason` - The exit reason handed to handlers, links and monitors.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoProc` if the manager is not running.
    pub async fn stop(&self, reason: ExitReason) -> Result<(), Error> {
        self.sender
            .ask(|rsvp| Command::Stop {
                reason,
                rsvp: Some(rsvp),
            })
            .await
    }

    /// Sink the registry hands this manager's exit signals to.
    pub(crate) fn signal_sink(&self) -> SignalSink {
        self.sender.signal_sink()
    }

    /// Removes handler `id` if it is still installed, without waiting.
    pub(crate) fn detach(&self, id: HandlerId, reason: Reason) {
        let _ = self.sender.tell(Command::Detach { id, reason });
    }

    /// Returns true once the manager has stopped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Waits until the manager has stopped.
    pub async fn closed(&self) {
        self.sender.closed().await
    }
}

impl<E: Event> Clone for EventManager<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            sender: self.sender.clone(),
            call_timeout: self.call_timeout,
        }
    }
}

impl<E: Event> std::fmt::Debug for EventManager<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager").field("id", &self.id).finish()
    }
}
