// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Handler chain
//!
//! The chain is the ordered collection of handler slots owned by one manager. Insertion order is
//! dispatch order. The chain is plain data owned by the manager's runner: it is only reached
//! from inside the runner loop, so it needs no locking.
//!
//! Every callback is polled under `catch_unwind`, so a panicking handler is reported as a
//! fault of that slot instead of tearing the loop down.
//!

use crate::{
    Error, HandlerId, UnitId,
    handler::{
        BoxedHandler, CallMessage, Event, Flow, Operation, Payload, Reason,
    },
};

use futures::FutureExt;
use tracing::{debug, error, warn};

use std::{any::Any, future::Future, panic::AssertUnwindSafe};

/// One installed handler: identity, callbacks and state, and link.
pub(crate) struct Slot<E: Event> {
    id: HandlerId,
    handler: BoxedHandler<E>,
    link: Option<UnitId>,
}

impl<E: Event> Slot<E> {
    pub(crate) fn new(
        id: HandlerId,
        handler: BoxedHandler<E>,
        link: Option<UnitId>,
    ) -> Self {
        Self { id, handler, link }
    }

    pub(crate) fn id(&self) -> &HandlerId {
        &self.id
    }

    pub(crate) fn link(&self) -> Option<UnitId> {
        self.link
    }

    fn supports(&self, operation: Operation) -> bool {
        self.handler.capabilities().supports(operation)
    }

    async fn init(&mut self, transfer: Option<Payload>) -> Result<(), Error> {
        match guarded(self.handler.init(transfer)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(Error::Init(self.id.clone(), error.to_string())),
            Err(panic) => Err(Error::Init(self.id.clone(), panic)),
        }
    }

    async fn handle_event(&mut self, event: &E) -> Result<Flow, Error> {
        let result = guarded(self.handler.handle_event(event)).await;
        self.fault(result)
    }

    async fn handle_info(&mut self, info: &Payload) -> Result<Flow, Error> {
        let result = guarded(self.handler.handle_info(info)).await;
        self.fault(result)
    }

    async fn handle_call(
        &mut self,
        message: CallMessage,
    ) -> Result<(CallMessage, Flow), Error> {
        let result = guarded(self.handler.handle_call(message)).await;
        self.fault(result)
    }

    /// Terminate is best effort: a panic is logged and swallowed.
    async fn terminate(&mut self, reason: &Reason) -> Option<Payload> {
        match guarded(self.handler.terminate(reason)).await {
            Ok(transfer) => transfer,
            Err(panic) => {
                warn!("Handler {} panicked on terminate: {}", self.id, panic);
                None
            }
        }
    }

    /// Maps a callback result to the slot's outcome. A callback without implementation
    /// becomes `Unsupported`, anything else that went wrong becomes a fault.
    fn fault<T>(&self, result: Result<Result<T, Error>, String>) -> Result<T, Error> {
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(Error::Unimplemented(operation))) => {
                debug!("Handler {} does not implement {}.", self.id, operation);
                Err(Error::Unsupported(self.id.clone(), operation))
            }
            Ok(Err(error)) => {
                error!("Handler {} failed: {}", self.id, error);
                Err(Error::Handler(self.id.clone(), error.to_string()))
            }
            Err(panic) => {
                error!("Handler {} panicked: {}", self.id, panic);
                Err(Error::Handler(self.id.clone(), panic))
            }
        }
    }
}

/// Polls a callback, turning a panic into its message.
async fn guarded<F, T>(future: F) -> Result<T, String>
where
    F: Future<Output = T>,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(panic_message)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A slot that left the chain.
#[derive(Debug)]
pub(crate) struct Detached {
    pub(crate) id: HandlerId,
    pub(crate) link: Option<UnitId>,
    pub(crate) reason: Reason,
    pub(crate) transfer: Option<Payload>,
}

/// Result of a call routed through the chain.
pub(crate) enum CallOutcome {
    /// The handler replied.
    Reply(CallMessage, Flow),
    /// The call never reached the handler. The slot is untouched.
    Rejected(Error),
    /// The handler failed. The slot must be removed with a fault reason.
    Fault(Error),
}

/// Result of a swap.
pub(crate) struct Swapped {
    /// The outgoing slot, already terminated.
    pub(crate) old: Detached,
    /// Whether the incoming slot made it into the chain.
    pub(crate) installed: Result<(), Error>,
}

/// Ordered collection of handler slots.
pub(crate) struct HandlerChain<E: Event> {
    slots: Vec<Slot<E>>,
}

impl<E: Event> HandlerChain<E> {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn contains(&self, id: &HandlerId) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: &HandlerId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.id() == id)
    }

    /// Identities in dispatch order.
    pub(crate) fn which(&self) -> Vec<HandlerId> {
        self.slots.iter().map(|slot| slot.id().clone()).collect()
    }

    /// Returns true if some slot is linked to `unit`.
    pub(crate) fn is_linked(&self, unit: UnitId) -> bool {
        self.slots.iter().any(|slot| slot.link() == Some(unit))
    }

    /// Identities of the slots linked to `unit`, in dispatch order.
    pub(crate) fn linked_to(&self, unit: UnitId) -> Vec<HandlerId> {
        self.slots
            .iter()
            .filter(|slot| slot.link() == Some(unit))
            .map(|slot| slot.id().clone())
            .collect()
    }

    /// Initializes `slot` and appends it. A slot whose init fails never enters the chain.
    pub(crate) async fn add(&mut self, mut slot: Slot<E>) -> Result<(), Error> {
        if self.contains(slot.id()) {
            return Err(Error::AlreadyPresent(slot.id().clone()));
        }
        slot.init(None).await?;
        debug!("Handler {} added.", slot.id());
        self.slots.push(slot);
        Ok(())
    }

    /// Terminates the slot `id` and drops it from the order.
    pub(crate) async fn remove(
        &mut self,
        id: &HandlerId,
        reason: Reason,
    ) -> Result<Detached, Error> {
        let position =
            self.position(id).ok_or_else(|| Error::NotFound(id.clone()))?;
        let slot = self.slots.remove(position);
        Ok(Self::detach(slot, reason).await)
    }

    /// Replaces slot `old` by `slot` at the same position.
    ///
    /// The outgoing slot is terminated first and its terminate result is handed to the init of
    /// the incoming slot. If that init fails, the position is left empty.
    ///
    /// # Arguments
    ///
    /// * `old` - The slot to replace.
    /// * `args` - Value carried by the outgoing slot's [`Reason::Swapped`].
    /// * `slot` - The incoming slot, not yet initialized.
    ///
    /// # Returns
    ///
    /// Returns the detached outgoing slot and whether the incoming one was installed.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if `old` is absent and `Error::AlreadyPresent` if another
    /// slot holds the incoming identity. The chain is untouched in both cases.
    pub(crate) async fn swap(
        &mut self,
        old: &HandlerId,
        args: Payload,
        mut slot: Slot<E>,
    ) -> Result<Swapped, Error> {
        let position =
            self.position(old).ok_or_else(|| Error::NotFound(old.clone()))?;
        if slot.id() != old && self.contains(slot.id()) {
            return Err(Error::AlreadyPresent(slot.id().clone()));
        }
        let outgoing = self.slots.remove(position);
        let reason = Reason::Swapped {
            args,
            replacement: slot.id().clone(),
        };
        let old = Self::detach(outgoing, reason).await;
        let installed = slot.init(old.transfer.clone()).await;
        if installed.is_ok() {
            debug!("Handler {} swapped for {}.", old.id, slot.id());
            self.slots.insert(position, slot);
        }
        Ok(Swapped { old, installed })
    }

    /// Delivers `event` to every event-capable slot in order, then removes the slots that asked
    /// for it or failed.
    pub(crate) async fn dispatch_event(&mut self, event: &E) -> Vec<Detached> {
        let mut leaving = Vec::new();
        for (position, slot) in self.slots.iter_mut().enumerate() {
            if !slot.supports(Operation::Event) {
                continue;
            }
            match slot.handle_event(event).await {
                Ok(Flow::Continue) | Err(Error::Unsupported(..)) => {}
                Ok(Flow::Remove) => leaving.push((position, Reason::Requested)),
                Err(error) => leaving.push((position, Reason::Fault(error))),
            }
        }
        self.sweep(leaving).await
    }

    /// Delivers `info` to every info-capable slot in order, with the same removal rules as
    /// events.
    pub(crate) async fn dispatch_info(&mut self, info: &Payload) -> Vec<Detached> {
        let mut leaving = Vec::new();
        for (position, slot) in self.slots.iter_mut().enumerate() {
            if !slot.supports(Operation::Info) {
                continue;
            }
            match slot.handle_info(info).await {
                Ok(Flow::Continue) | Err(Error::Unsupported(..)) => {}
                Ok(Flow::Remove) => leaving.push((position, Reason::Requested)),
                Err(error) => leaving.push((position, Reason::Fault(error))),
            }
        }
        self.sweep(leaving).await
    }

    /// Routes a call to slot `id`. Removal requested by the reply is left to the caller, so
    /// that the reply can be sent before the slot terminates.
    ///
    /// # Arguments
    ///
    /// * `id` - The slot to call.
    /// * `message` - The type-erased call message.
    ///
    /// # Returns
    ///
    /// Returns the reply, a rejection that left the slot untouched, or a fault after which
    /// the slot must be removed.
    pub(crate) async fn call(
        &mut self,
        id: &HandlerId,
        message: CallMessage,
    ) -> CallOutcome {
        let Some(position) = self.position(id) else {
            return CallOutcome::Rejected(Error::NotFound(id.clone()));
        };
        let slot = &mut self.slots[position];
        if !slot.supports(Operation::Call) {
            return CallOutcome::Rejected(Error::Unsupported(
                id.clone(),
                Operation::Call,
            ));
        }
        if !slot.handler.accepts(&message) {
            return CallOutcome::Rejected(Error::BadCall(id.clone()));
        }
        match slot.handle_call(message).await {
            Ok((reply, flow)) => CallOutcome::Reply(reply, flow),
            Err(error @ Error::Unsupported(..)) => CallOutcome::Rejected(error),
            Err(error) => CallOutcome::Fault(error),
        }
    }

    /// Terminates every slot in order and empties the chain.
    pub(crate) async fn drain(&mut self, reason: Reason) -> Vec<Detached> {
        let mut detached = Vec::with_capacity(self.slots.len());
        for slot in std::mem::take(&mut self.slots) {
            detached.push(Self::detach(slot, reason.clone()).await);
        }
        detached
    }

    async fn sweep(&mut self, leaving: Vec<(usize, Reason)>) -> Vec<Detached> {
        let mut detached = Vec::with_capacity(leaving.len());
        // Back to front keeps the remaining positions valid.
        let mut taken = Vec::with_capacity(leaving.len());
        for (position, reason) in leaving.into_iter().rev() {
            taken.push((self.slots.remove(position), reason));
        }
        for (slot, reason) in taken.into_iter().rev() {
            detached.push(Self::detach(slot, reason).await);
        }
        detached
    }

    async fn detach(mut slot: Slot<E>, reason: Reason) -> Detached {
        let transfer = slot.terminate(&reason).await;
        debug!("Handler {} removed: {:?}.", slot.id(), reason);
        Detached {
            id: slot.id,
            link: slot.link,
            reason,
            transfer,
        }
    }
}
