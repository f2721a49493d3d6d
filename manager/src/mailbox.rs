// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Mailbox
//!
//! Every operation on a manager travels as a [`Command`] through one unbounded channel, which
//! is what gives the manager its FIFO guarantee across all message kinds.
//!

use crate::{
    Error, HandlerId, UnitId,
    handler::{BoxedHandler, CallMessage, Event, Payload, Reason},
    system::{ExitReason, ExitSignal, SignalSink},
};

use tokio::sync::{mpsc, oneshot};

use tracing::debug;

/// Reply channel of a request.
pub(crate) type Rsvp<T> = oneshot::Sender<T>;

/// Messages processed by the manager's loop.
pub(crate) enum Command<E: Event> {
    /// Deliver an event, nobody waits.
    Notify(E),
    /// Deliver an event and acknowledge once every handler has seen it.
    SyncNotify { event: E, rsvp: Rsvp<()> },
    /// Deliver an info message to the info-capable handlers.
    Info(Payload),
    /// Route a request to one handler.
    Call {
        id: HandlerId,
        message: CallMessage,
        rsvp: Rsvp<Result<CallMessage, Error>>,
    },
    /// Install a handler at the end of the chain.
    Add {
        id: HandlerId,
        handler: BoxedHandler<E>,
        link: Option<UnitId>,
        rsvp: Rsvp<Result<(), Error>>,
    },
    /// Remove a handler.
    Remove {
        id: HandlerId,
        args: Payload,
        rsvp: Rsvp<Result<(), Error>>,
    },
    /// Replace a handler in place.
    Swap {
        old: HandlerId,
        args: Payload,
        id: HandlerId,
        handler: BoxedHandler<E>,
        link: Option<UnitId>,
        rsvp: Rsvp<Result<(), Error>>,
    },
    /// Snapshot of the chain order.
    Which { rsvp: Rsvp<Vec<HandlerId>> },
    /// Remove a handler if it is still there. Nobody waits and absence is not an error.
    Detach { id: HandlerId, reason: Reason },
    /// Exit signal from the registry, ordered after the commands queued before it.
    Signal(ExitSignal),
    /// Terminate every handler and stop.
    Stop {
        reason: ExitReason,
        rsvp: Option<Rsvp<()>>,
    },
}

/// Mailbox receiver side, owned by the runner.
pub(crate) type MailboxReceiver<E> = mpsc::UnboundedReceiver<Command<E>>;

/// Mailbox sender side, shared by every handle to the manager.
pub(crate) type MailboxSender<E> = mpsc::UnboundedSender<Command<E>>;

/// Complete mailbox tuple.
pub(crate) type Mailbox<E> = (MailboxSender<E>, MailboxReceiver<E>);

/// Creates a new unbounded mailbox. Sending never blocks; backpressure is left to callers.
pub(crate) fn mailbox<E: Event>() -> Mailbox<E> {
    mpsc::unbounded_channel()
}

/// Typed sending helper over the mailbox sender.
pub(crate) struct MailboxHelper<E: Event> {
    sender: MailboxSender<E>,
}

impl<E: Event> MailboxHelper<E> {
    pub(crate) fn new(sender: MailboxSender<E>) -> Self {
        Self { sender }
    }

    /// Queues a command without waiting for it to be processed.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoProc` if the manager no longer accepts messages.
    pub(crate) fn tell(&self, command: Command<E>) -> Result<(), Error> {
        self.sender.send(command).map_err(|_| {
            debug!("Mailbox closed, command dropped.");
            Error::NoProc
        })
    }

    /// Queues a request built around a fresh reply channel and waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoProc` if the manager is gone or stops before replying.
    pub(crate) async fn ask<T, F>(&self, request: F) -> Result<T, Error>
    where
        F: FnOnce(Rsvp<T>) -> Command<E>,
    {
        let (rsvp, response) = oneshot::channel();
        self.tell(request(rsvp))?;
        response.await.map_err(|_| Error::NoProc)
    }

    /// Sink handing exit signals to the manager through its mailbox. The sink holds a weak
    /// sender, so the registry does not keep the mailbox open.
    pub(crate) fn signal_sink(&self) -> SignalSink {
        let sender = self.sender.downgrade();
        Box::new(move |signal: ExitSignal| {
            sender
                .upgrade()
                .map(|sender| sender.send(Command::Signal(signal)).is_ok())
                .unwrap_or(false)
        })
    }

    /// Waits until the manager drops its mailbox.
    pub(crate) async fn closed(&self) {
        self.sender.closed().await;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl<E: Event> Clone for MailboxHelper<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
