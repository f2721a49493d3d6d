// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Manager runner
//!
//! The `ManagerRunner` is the dispatch loop of one event manager. It owns the handler chain
//! and is the only code that ever touches it, so handler state needs no locking: every
//! callback runs inside this loop, one at a time.
//!
//! ## Lifecycle
//!
//! ```text
//! Running ──(stop / shutdown / creator exit / mailbox closed)──▶ Terminating ──▶ Stopped
//! ```
//!
//! - **Running**: commands are taken from the mailbox and applied in arrival order. Exit
//!   signals from the registry travel through the mailbox too, so they never overtake a
//!   command queued before them. Handler faults only remove the faulty handler.
//! - **Terminating**: every handler is terminated in chain order, the mailbox is closed and
//!   whatever is still queued is dropped (pending callers observe `NoProc`), and the unit
//!   leaves the registry, which notifies linked and monitoring units.
//! - **Stopped**: the loop is over. Any handle to the manager now fails with `NoProc`.
//!
//! A panic in the loop itself (outside handler callbacks) is a fatal fault: the unit exits with
//! [`ExitReason::Fault`].
//!

use crate::{
    Error, EventManager, HandlerId, UnitId,
    chain::{CallOutcome, Detached, HandlerChain, Slot, Swapped},
    handler::{CallMessage, Event, Flow, Reason},
    mailbox::{Command, MailboxHelper, MailboxReceiver, mailbox},
    system::{ExitReason, ExitSignal, SystemRef},
};

use futures::FutureExt;
use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tracing::{debug, error, warn};

use std::{panic::AssertUnwindSafe, time::Duration};

/// Receiving side of the out-of-band stop channel used by system shutdown.
pub type StopReceiver = mpsc::Receiver<Option<oneshot::Sender<()>>>;

/// Sending side of the out-of-band stop channel used by system shutdown.
pub type StopSender = mpsc::Sender<Option<oneshot::Sender<()>>>;

/// Manager lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerLifecycle {
    /// Processing commands.
    Running,
    /// Terminating handlers and leaving the registry.
    Terminating,
    /// Done.
    Stopped,
}

pub(crate) struct ManagerRunner<E: Event> {
    id: UnitId,

    system: SystemRef,

    chain: HandlerChain<E>,

    lifecycle: ManagerLifecycle,

    receiver: MailboxReceiver<E>,

    stop_receiver: StopReceiver,

    /// Creator linked through `start_link`.
    parent: Option<UnitId>,

    /// Reason the manager stops with.
    exit: ExitReason,

    /// Callers waiting for the stop to complete.
    stop_replies: Vec<oneshot::Sender<()>>,
}

impl<E: Event> ManagerRunner<E> {
    pub(crate) fn create(
        id: UnitId,
        system: SystemRef,
        parent: Option<UnitId>,
        call_timeout: Option<Duration>,
    ) -> (Self, EventManager<E>, StopSender) {
        debug!("Creating new manager runner.");
        let (sender, receiver) = mailbox();
        let (stop_sender, stop_receiver) = mpsc::channel(100);
        let manager =
            EventManager::new(id, MailboxHelper::new(sender), call_timeout);
        let runner = ManagerRunner {
            id,
            system,
            chain: HandlerChain::new(),
            lifecycle: ManagerLifecycle::Running,
            receiver,
            stop_receiver,
            parent,
            exit: ExitReason::Normal,
            stop_replies: Vec::new(),
        };
        (runner, manager, stop_sender)
    }

    /// Spawns the runner on its own task.
    pub(crate) fn spawn(self) {
        let system = self.system.clone();
        let id = self.id;
        tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(self.init()).catch_unwind().await {
                let message = panic
                    .downcast_ref::<&'static str>()
                    .map(|msg| (*msg).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Event manager {} crashed: {}", id, message);
                system
                    .exit(id, ExitReason::Fault(Error::Functional(message)))
                    .await;
            }
        });
    }

    /// Drives the lifecycle to the end.
    async fn init(mut self) {
        loop {
            match self.lifecycle {
                ManagerLifecycle::Running => {
                    debug!("Event manager {} is running.", self.id);
                    self.run().await;
                    self.lifecycle = ManagerLifecycle::Terminating;
                }
                ManagerLifecycle::Terminating => {
                    debug!("Event manager {} is terminating.", self.id);
                    self.terminate().await;
                    self.lifecycle = ManagerLifecycle::Stopped;
                }
                ManagerLifecycle::Stopped => {
                    debug!("Event manager {} is stopped.", self.id);
                    break;
                }
            }
        }
    }

    async fn run(&mut self) {
        loop {
            select! {
                biased;
                Some(stop) = self.stop_receiver.recv() => {
                    debug!("Stopping event manager {} on shutdown.", self.id);
                    self.exit = ExitReason::Shutdown;
                    if let Some(reply) = stop {
                        self.stop_replies.push(reply);
                    }
                    break;
                }
                command = self.receiver.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle(command).await {
                                break;
                            }
                        }
                        None => {
                            debug!("Every handle to event manager {} is gone.", self.id);
                            self.exit = ExitReason::Normal;
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Applies one command. Returns false when the manager must stop.
    async fn handle(&mut self, command: Command<E>) -> bool {
        match command {
            Command::Notify(event) => {
                let detached = self.chain.dispatch_event(&event).await;
                self.release(detached).await;
            }
            Command::SyncNotify { event, rsvp } => {
                let detached = self.chain.dispatch_event(&event).await;
                self.release(detached).await;
                if rsvp.send(()).is_err() {
                    debug!("Sync notify caller is gone.");
                }
            }
            Command::Info(info) => {
                let detached = self.chain.dispatch_info(&info).await;
                self.release(detached).await;
            }
            Command::Call { id, message, rsvp } => {
                self.call(id, message, rsvp).await;
            }
            Command::Add {
                id,
                handler,
                link,
                rsvp,
            } => {
                let result = match self.link(link).await {
                    Ok(()) => {
                        let result =
                            self.chain.add(Slot::new(id, handler, link)).await;
                        if result.is_err() {
                            self.unlink_if_unused(link).await;
                        }
                        result
                    }
                    Err(error) => Err(error),
                };
                reply(rsvp, result);
            }
            Command::Remove { id, args, rsvp } => {
                match self.chain.remove(&id, Reason::Removed(args)).await {
                    Ok(detached) => {
                        reply(rsvp, Ok(()));
                        self.release(vec![detached]).await;
                    }
                    Err(error) => reply(rsvp, Err(error)),
                }
            }
            Command::Swap {
                old,
                args,
                id,
                handler,
                link,
                rsvp,
            } => {
                if let Err(error) = self.link(link).await {
                    reply(rsvp, Err(error));
                    return true;
                }
                match self
                    .chain
                    .swap(&old, args, Slot::new(id, handler, link))
                    .await
                {
                    Ok(Swapped { old, installed }) => {
                        let failed = installed.is_err();
                        reply(rsvp, installed);
                        self.release(vec![old]).await;
                        if failed {
                            self.unlink_if_unused(link).await;
                        }
                    }
                    Err(error) => {
                        reply(rsvp, Err(error));
                        self.unlink_if_unused(link).await;
                    }
                }
            }
            Command::Which { rsvp } => {
                reply(rsvp, self.chain.which());
            }
            Command::Detach { id, reason } => {
                if self.chain.contains(&id) {
                    if let Ok(detached) = self.chain.remove(&id, reason).await {
                        self.release(vec![detached]).await;
                    }
                } else {
                    debug!("Handler {} already gone, detach dropped.", id);
                }
            }
            Command::Signal(signal) => {
                return self.on_signal(signal).await;
            }
            Command::Stop { reason, rsvp } => {
                debug!("Stopping event manager {}: {:?}.", self.id, reason);
                self.exit = reason;
                if let Some(rsvp) = rsvp {
                    self.stop_replies.push(rsvp);
                }
                return false;
            }
        }
        true
    }

    async fn call(
        &mut self,
        id: HandlerId,
        message: CallMessage,
        rsvp: oneshot::Sender<Result<CallMessage, Error>>,
    ) {
        match self.chain.call(&id, message).await {
            CallOutcome::Reply(response, flow) => {
                reply(rsvp, Ok(response));
                if flow == Flow::Remove {
                    if let Ok(detached) =
                        self.chain.remove(&id, Reason::Requested).await
                    {
                        self.release(vec![detached]).await;
                    }
                }
            }
            CallOutcome::Rejected(error) => reply(rsvp, Err(error)),
            CallOutcome::Fault(error) => {
                reply(rsvp, Err(error.clone()));
                if let Ok(detached) =
                    self.chain.remove(&id, Reason::Fault(error)).await
                {
                    self.release(vec![detached]).await;
                }
            }
        }
    }

    /// Reacts to a signal. Returns false when the manager must stop.
    async fn on_signal(&mut self, signal: ExitSignal) -> bool {
        match signal {
            ExitSignal::Exit { from, reason } if Some(from) == self.parent => {
                debug!(
                    "Creator {} of event manager {} exited: {:?}.",
                    from, self.id, reason
                );
                self.parent = None;
                self.exit = reason;
                false
            }
            ExitSignal::Exit { from, reason } => {
                for id in self.chain.linked_to(from) {
                    if let Ok(detached) = self
                        .chain
                        .remove(&id, Reason::WatcherExited(reason.clone()))
                        .await
                    {
                        self.release(vec![detached]).await;
                    }
                }
                true
            }
            other => {
                debug!("Event manager {} ignores {:?}.", self.id, other);
                true
            }
        }
    }

    /// Links the manager to the watcher of a handler being installed.
    async fn link(&mut self, link: Option<UnitId>) -> Result<(), Error> {
        match link {
            Some(watcher) => self.system.link(watcher, self.id).await,
            None => Ok(()),
        }
    }

    /// Drops the link to `watcher` once nothing needs it anymore.
    async fn unlink_if_unused(&mut self, watcher: Option<UnitId>) {
        if let Some(watcher) = watcher {
            if Some(watcher) != self.parent && !self.chain.is_linked(watcher) {
                self.system.unlink(watcher, self.id).await;
            }
        }
    }

    /// Reports removed handlers to their watchers.
    async fn release(&mut self, detached: Vec<Detached>) {
        for Detached {
            id, link, reason, ..
        } in detached
        {
            if let Some(watcher) = link {
                let signal = ExitSignal::HandlerExit {
                    manager: self.id,
                    handler: id,
                    reason: reason.exit_reason(),
                };
                if !self.system.signal(watcher, signal).await {
                    debug!("Watcher {} is gone.", watcher);
                }
                self.unlink_if_unused(link).await;
            }
        }
    }

    async fn terminate(&mut self) {
        debug!(
            "Event manager {} terminates {} handlers.",
            self.id,
            self.chain.len()
        );
        let detached =
            self.chain.drain(Reason::Stop(self.exit.clone())).await;
        self.release(detached).await;

        self.receiver.close();
        let mut dropped = 0usize;
        while self.receiver.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(
                "Event manager {} dropped {} queued commands.",
                self.id, dropped
            );
        }

        if self.exit.is_abnormal() {
            warn!("Event manager {} exits abnormally: {:?}.", self.id, self.exit);
        }
        self.system.exit(self.id, self.exit.clone()).await;
        for stop in self.stop_replies.drain(..) {
            let _ = stop.send(());
        }
    }
}

fn reply<T>(rsvp: oneshot::Sender<T>, value: T) {
    if rsvp.send(value).is_err() {
        debug!("Caller is gone, reply dropped.");
    }
}
