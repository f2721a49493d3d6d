// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Stream subscriptions
//!
//! A [`Subscription`] turns the events of a manager into a pull-based sequence. It installs a
//! forwarder handler that copies every event into a private queue, and removes it when the
//! subscription ends: on expiry, on a pull timeout, on drop, or when the manager stops.
//!

use crate::{
    Error, EventManager, HandlerId, Reference,
    config::{AddOptions, StreamOptions},
    handler::{Capabilities, Event, EventHandler, Flow, Payload, Reason},
};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use std::time::Duration;

/// Pull side of a stream over a manager's events.
pub struct Subscription<E: Event> {
    reference: Reference,
    id: HandlerId,
    manager: EventManager<E>,
    queue: mpsc::UnboundedReceiver<E>,
    timeout: Option<Duration>,
    /// Cancelled when the forwarder leaves the chain.
    timer: CancellationToken,
    /// Set after a pull timed out.
    failed: bool,
}

impl<E: Event> Subscription<E> {
    pub(crate) async fn open(
        manager: &EventManager<E>,
        options: StreamOptions,
    ) -> Result<Self, Error> {
        let reference = Reference::new();
        let id = HandlerId::stream(reference);
        let (sender, queue) = mpsc::unbounded_channel();
        let timer = CancellationToken::new();

        let forwarder = Forwarder {
            sender,
            timer: timer.clone(),
        };
        manager
            .add_handler(id.clone(), forwarder, AddOptions::default())
            .await?;

        if let Some(duration) = options.duration {
            let token = timer.clone();
            let handle = manager.clone();
            let target = id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!("Expiry timer for {} defused.", target);
                    }
                    _ = tokio::time::sleep(duration) => {
                        debug!("Stream {} expired.", target);
                        handle.detach(target, Reason::Expired);
                    }
                }
            });
        }

        debug!("Stream {} opened.", id);
        Ok(Self {
            reference,
            id,
            manager: manager.clone(),
            queue,
            timeout: options.timeout,
            timer,
            failed: false,
        })
    }

    /// Unique reference of the subscription.
    pub fn reference(&self) -> Reference {
        self.reference
    }

    /// Identity of the forwarder serving this subscription.
    pub fn id(&self) -> &HandlerId {
        &self.id
    }

    /// Returns true once the forwarder has left the manager.
    pub fn is_finished(&self) -> bool {
        self.timer.is_cancelled()
    }

    /// Next event of the subscription.
    ///
    /// Returns `Ok(None)` once the subscription has ended, whether it expired, was removed,
    /// its manager stopped, or a previous pull timed out.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if no event arrived within the pull timeout. The subscription
    /// is ended and its forwarder removed.
    pub async fn next(&mut self) -> Result<Option<E>, Error> {
        if self.failed {
            return Ok(None);
        }
        let Some(timeout) = self.timeout else {
            return Ok(self.queue.recv().await);
        };
        match tokio::time::timeout(timeout, self.queue.recv()).await {
            Ok(event) => Ok(event),
            Err(_) => {
                debug!("Stream {} timed out after {:?}.", self.id, timeout);
                self.failed = true;
                self.manager.detach(self.id.clone(), Reason::Expired);
                self.queue.close();
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Adapts the subscription into a [`Stream`]. The stream yields the timeout error once,
    /// then ends.
    pub fn into_stream(self) -> impl Stream<Item = Result<E, Error>> {
        futures::stream::unfold(self, |mut subscription| async move {
            match subscription.next().await {
                Ok(Some(event)) => Some((Ok(event), subscription)),
                Ok(None) => None,
                Err(error) => Some((Err(error), subscription)),
            }
        })
    }
}

impl<E: Event> Drop for Subscription<E> {
    fn drop(&mut self) {
        if !self.timer.is_cancelled() && !self.failed {
            self.manager
                .detach(self.id.clone(), Reason::Removed(Payload::empty()));
        }
    }
}

impl<E: Event> From<&Subscription<E>> for HandlerId {
    fn from(subscription: &Subscription<E>) -> Self {
        subscription.id.clone()
    }
}

/// Handler copying events into a subscription queue.
struct Forwarder<E: Event> {
    sender: mpsc::UnboundedSender<E>,
    timer: CancellationToken,
}

#[async_trait]
impl<E: Event> EventHandler<E> for Forwarder<E> {
    type Call = ();
    type Reply = ();

    const CAPABILITIES: Capabilities = Capabilities::EVENTS;

    async fn handle_event(&mut self, event: &E) -> Result<Flow, Error> {
        if self.sender.send(event.clone()).is_err() {
            return Ok(Flow::Remove);
        }
        Ok(Flow::Continue)
    }

    async fn terminate(&mut self, _reason: &Reason) -> Option<Payload> {
        self.timer.cancel();
        None
    }
}
