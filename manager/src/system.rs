// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Event system
//!
//! The `system` module provides the [`EventSystem`]: the place managers are started in, and the
//! registry that makes them addressable. The registry keeps
//!
//! - the live units (managers and [`Watcher`]s) and where their [`ExitSignal`]s go: the
//!   watcher's channel, or the manager's mailbox behind the commands already queued,
//! - the bidirectional links between units,
//! - the one-directional monitors,
//! - the names managers are registered under.
//!
//! When a unit exits, its linked units receive [`ExitSignal::Exit`], its monitors receive
//! [`ExitSignal::Down`], and its names and links are dropped.
//!

use crate::{
    Error, EventManager, HandlerId, UnitId,
    config::StartOptions,
    handler::Event,
    runner::{ManagerRunner, StopSender},
};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use tracing::{debug, warn};

use std::{
    any::Any,
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

/// Event system.
pub struct EventSystem {}

impl EventSystem {
    /// Create a new event system. Cancelling `token` stops every manager started in it.
    ///
    /// # Returns
    ///
    /// Returns a tuple with the system reference and the system runner.
    pub fn create(token: CancellationToken) -> (SystemRef, SystemRunner) {
        let (event_sender, event_receiver) = mpsc::channel(100);
        let system = SystemRef::new(event_sender, token);
        let runner = SystemRunner::new(event_receiver);
        (system, runner)
    }
}

/// System event.
#[derive(Debug, Clone)]
pub enum SystemEvent {
    /// Stop the event system.
    StopSystem,
}

/// Why a unit (or a handler) went away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Regular termination.
    Normal,
    /// Stopped because the event system shut down.
    Shutdown,
    /// A handler was replaced by the handler with this identity.
    Swapped(HandlerId),
    /// Terminated by a fault.
    Fault(Error),
    /// The target of a monitor did not exist.
    NoProc,
    /// Application-defined reason.
    Other(String),
}

impl ExitReason {
    /// Returns true for faults and application-defined reasons.
    pub fn is_abnormal(&self) -> bool {
        matches!(self, ExitReason::Fault(_) | ExitReason::Other(_))
    }
}

/// Notification delivered to a unit.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitSignal {
    /// A linked unit exited.
    Exit { from: UnitId, reason: ExitReason },
    /// A monitored unit exited.
    Down { from: UnitId, reason: ExitReason },
    /// A handler linked to this unit left the chain of `manager`.
    HandlerExit {
        manager: UnitId,
        handler: HandlerId,
        reason: ExitReason,
    },
}

/// Delivers a signal to one unit. Returns false if the unit can no longer receive it.
pub(crate) type SignalSink = Box<dyn Fn(ExitSignal) -> bool + Send + Sync>;

pub(crate) type SignalReceiver = mpsc::UnboundedReceiver<ExitSignal>;

#[derive(Default)]
struct Registry {
    units: HashMap<UnitId, SignalSink>,
    links: HashMap<UnitId, HashSet<UnitId>>,
    /// Monitored unit to the units monitoring it.
    monitors: HashMap<UnitId, HashSet<UnitId>>,
    names: HashMap<String, (UnitId, Box<dyn Any + Send + Sync + 'static>)>,
}

impl Registry {
    fn send(&self, to: &UnitId, signal: ExitSignal) -> bool {
        self.units
            .get(to)
            .map(|sink| sink(signal))
            .unwrap_or(false)
    }
}

/// System reference.
#[derive(Clone)]
pub struct SystemRef {
    registry: Arc<RwLock<Registry>>,

    /// Stop channels of the running managers of this system.
    root_senders: Arc<RwLock<BTreeMap<UnitId, StopSender>>>,

    token: CancellationToken,
}

impl SystemRef {
    /// Create system reference.
    pub fn new(
        event_sender: mpsc::Sender<SystemEvent>,
        token: CancellationToken,
    ) -> Self {
        let root_senders =
            Arc::new(RwLock::new(BTreeMap::<UnitId, StopSender>::new()));
        let root_sender_clone = root_senders.clone();
        let token_clone = token.clone();

        tokio::spawn(async move {
            token_clone.cancelled().await;
            debug!("Stopping event system...");
            // Stopping managers take their own entry out, so the lock is not held while
            // waiting for them. Managers started meanwhile are picked up by the next round.
            loop {
                let root_senders =
                    std::mem::take(&mut *root_sender_clone.write().await);
                if root_senders.is_empty() {
                    break;
                }
                for (_, sender) in root_senders.into_iter().rev() {
                    let (stop_sender, stop_receiver) = oneshot::channel();
                    // Managers that already stopped have dropped their receiver.
                    if sender.send(Some(stop_sender)).await.is_ok() {
                        let _ = stop_receiver.await;
                    }
                }
            }

            let _ = event_sender.send(SystemEvent::StopSystem).await;
        });

        SystemRef {
            registry: Arc::new(RwLock::new(Registry::default())),
            root_senders,
            token,
        }
    }

    /// Starts an event manager with an empty handler chain.
    ///
    /// # Arguments
    ///
    /// * `options` - Name to register, unit to link to and call timeout of the manager.
    ///
    /// # Returns
    ///
    /// Returns the handle of the running manager.
    ///
    /// # Errors
    ///
    /// Returns `Error::NameTaken` if `options.name` is registered already, and `Error::NoProc`
    /// if `options.link` names a unit that is not alive.
    ///
    pub async fn start<E: Event>(
        &self,
        options: StartOptions,
    ) -> Result<EventManager<E>, Error> {
        let id = UnitId::next();
        let (runner, manager, stop_sender) = ManagerRunner::create(
            id,
            self.clone(),
            options.link,
            options.call_timeout,
        );
        self.register_unit(id, manager.signal_sink()).await;

        if let Some(name) = &options.name {
            if let Err(error) =
                self.register_name(name, id, Box::new(manager.clone())).await
            {
                self.exit(id, ExitReason::Normal).await;
                return Err(error);
            }
        }
        if let Some(parent) = options.link {
            if let Err(error) = self.link(parent, id).await {
                self.exit(id, ExitReason::NoProc).await;
                return Err(error);
            }
        }

        self.root_senders.write().await.insert(id, stop_sender);
        runner.spawn();
        debug!("Event manager {} started.", id);
        Ok(manager)
    }

    /// Starts an event manager linked to `watcher`. The manager stops when the watcher exits,
    /// and the watcher receives an [`ExitSignal::Exit`] when the manager stops.
    ///
    /// # Arguments
    ///
    /// * `watcher` - The creator the manager is linked to.
    /// * `options` - Start options; any link they carry is replaced by `watcher`.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    ///
    pub async fn start_link<E: Event>(
        &self,
        watcher: &Watcher,
        options: StartOptions,
    ) -> Result<EventManager<E>, Error> {
        self.start(options.link(watcher.id())).await
    }

    /// Creates a new watcher unit.
    pub async fn watcher(&self) -> Watcher {
        let (id, signals) = self.register().await;
        Watcher {
            id,
            system: self.clone(),
            signals,
            exited: false,
        }
    }

    /// Looks up a manager registered under `name`.
    ///
    /// # Arguments
    ///
    /// * `name` - The name the manager was started under, see [`StartOptions`].
    ///
    /// # Returns
    ///
    /// Returns the manager handle, or `None` if there is none or if it handles a different
    /// event type.
    ///
    pub async fn whereis<E: Event>(&self, name: &str) -> Option<EventManager<E>> {
        let registry = self.registry.read().await;
        registry
            .names
            .get(name)
            .and_then(|(_, any)| any.downcast_ref::<EventManager<E>>().cloned())
    }

    /// Stops the manager registered under `name`.
    ///
    /// # Arguments
    ///
    /// * `name` - The name the manager is registered under.
    /// * `reason` - The exit reason handed to linked and monitoring units.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoProc` if no such manager is running.
    pub async fn stop_named<E: Event>(
        &self,
        name: &str,
        reason: ExitReason,
    ) -> Result<(), Error> {
        match self.whereis::<E>(name).await {
            Some(manager) => manager.stop(reason).await,
            None => Err(Error::NoProc),
        }
    }

    /// Returns true while `unit` is registered.
    pub async fn is_alive(&self, unit: UnitId) -> bool {
        self.registry.read().await.units.contains_key(&unit)
    }

    /// Links two units. When one of them exits, the other receives an
    /// [`ExitSignal::Exit`]. Linking a unit to itself does nothing.
    ///
    /// # Arguments
    ///
    /// * `a` - One end of the link.
    /// * `b` - The other end.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoProc` if either unit is not alive.
    pub async fn link(&self, a: UnitId, b: UnitId) -> Result<(), Error> {
        let mut registry = self.registry.write().await;
        if !registry.units.contains_key(&a) || !registry.units.contains_key(&b) {
            return Err(Error::NoProc);
        }
        if a != b {
            registry.links.entry(a).or_default().insert(b);
            registry.links.entry(b).or_default().insert(a);
        }
        Ok(())
    }

    /// Removes the link between two units, if any.
    ///
    /// # Arguments
    ///
    /// * `a` - One end of the link.
    /// * `b` - The other end.
    ///
    pub async fn unlink(&self, a: UnitId, b: UnitId) {
        let mut registry = self.registry.write().await;
        if let Some(links) = registry.links.get_mut(&a) {
            links.remove(&b);
        }
        if let Some(links) = registry.links.get_mut(&b) {
            links.remove(&a);
        }
    }

    /// Returns the units linked to `unit`, sorted.
    pub async fn links_of(&self, unit: UnitId) -> Vec<UnitId> {
        let registry = self.registry.read().await;
        let mut links: Vec<UnitId> = registry
            .links
            .get(&unit)
            .map(|links| links.iter().copied().collect())
            .unwrap_or_default();
        links.sort();
        links
    }

    /// Makes `watcher` receive an [`ExitSignal::Down`] when `target` exits. If `target` is
    /// not alive the signal is sent right away with [`ExitReason::NoProc`].
    ///
    /// # Arguments
    ///
    /// * `watcher` - The unit to notify.
    /// * `target` - The unit to monitor.
    ///
    pub async fn monitor(&self, watcher: UnitId, target: UnitId) {
        let mut registry = self.registry.write().await;
        if registry.units.contains_key(&target) {
            registry.monitors.entry(target).or_default().insert(watcher);
        } else {
            registry.send(
                &watcher,
                ExitSignal::Down {
                    from: target,
                    reason: ExitReason::NoProc,
                },
            );
        }
    }

    /// Cancels a monitor set up by [`monitor`](Self::monitor).
    pub async fn demonitor(&self, watcher: UnitId, target: UnitId) {
        let mut registry = self.registry.write().await;
        if let Some(watchers) = registry.monitors.get_mut(&target) {
            watchers.remove(&watcher);
        }
    }

    /// Stops every manager of the system, then ends the system runner.
    pub fn stop_system(&self) {
        self.token.cancel();
    }

    /// Registers a new unit whose signals are read from a channel.
    async fn register(&self) -> (UnitId, SignalReceiver) {
        let id = UnitId::next();
        let (sender, receiver) = mpsc::unbounded_channel();
        let sink: SignalSink =
            Box::new(move |signal: ExitSignal| sender.send(signal).is_ok());
        self.register_unit(id, sink).await;
        (id, receiver)
    }

    async fn register_unit(&self, id: UnitId, sink: SignalSink) {
        self.registry.write().await.units.insert(id, sink);
    }

    async fn register_name(
        &self,
        name: &str,
        unit: UnitId,
        handle: Box<dyn Any + Send + Sync + 'static>,
    ) -> Result<(), Error> {
        let mut registry = self.registry.write().await;
        if registry.names.contains_key(name) {
            return Err(Error::NameTaken(name.to_owned()));
        }
        registry.names.insert(name.to_owned(), (unit, handle));
        Ok(())
    }

    /// Delivers a signal to `to`. Returns false if the unit is gone.
    pub(crate) async fn signal(&self, to: UnitId, signal: ExitSignal) -> bool {
        self.registry.read().await.send(&to, signal)
    }

    /// Unregisters `unit` and notifies its links and monitors.
    pub(crate) async fn exit(&self, unit: UnitId, reason: ExitReason) {
        self.root_senders.write().await.remove(&unit);
        let mut registry = self.registry.write().await;
        if registry.units.remove(&unit).is_none() {
            warn!("Unit {} exited twice.", unit);
            return;
        }
        registry.names.retain(|_, (owner, _)| *owner != unit);

        let linked = registry.links.remove(&unit).unwrap_or_default();
        for other in &linked {
            if let Some(links) = registry.links.get_mut(other) {
                links.remove(&unit);
            }
            registry.send(
                other,
                ExitSignal::Exit {
                    from: unit,
                    reason: reason.clone(),
                },
            );
        }

        let watchers = registry.monitors.remove(&unit).unwrap_or_default();
        for watcher in &watchers {
            registry.send(
                watcher,
                ExitSignal::Down {
                    from: unit,
                    reason: reason.clone(),
                },
            );
        }
        for watchers in registry.monitors.values_mut() {
            watchers.remove(&unit);
        }
        debug!("Unit {} exited: {:?}.", unit, reason);
    }
}

/// System runner.
pub struct SystemRunner {
    /// The event receiver.
    event_receiver: mpsc::Receiver<SystemEvent>,
}

impl SystemRunner {
    /// Create a new system runner.
    pub(crate) fn new(event_receiver: mpsc::Receiver<SystemEvent>) -> Self {
        Self { event_receiver }
    }

    /// Runs until the event system is stopped.
    pub async fn run(&mut self) {
        debug!("Running event system...");
        if let Some(SystemEvent::StopSystem) = self.event_receiver.recv().await {
            debug!("Event system stopped.");
        }
    }
}

/// A caller unit that can be linked to managers and handlers, and receives their
/// [`ExitSignal`]s.
///
/// Dropping a watcher exits it with [`ExitReason::Normal`].
pub struct Watcher {
    id: UnitId,
    system: SystemRef,
    signals: SignalReceiver,
    exited: bool,
}

impl Watcher {
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Waits for the next signal.
    pub async fn recv(&mut self) -> Option<ExitSignal> {
        self.signals.recv().await
    }

    /// Returns a signal if one is already queued.
    pub fn try_recv(&mut self) -> Option<ExitSignal> {
        self.signals.try_recv().ok()
    }

    /// Exits the watcher. Linked managers react as described in [`ExitSignal::Exit`].
    pub async fn exit(mut self, reason: ExitReason) {
        self.exited = true;
        self.system.exit(self.id, reason).await;
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let system = self.system.clone();
            let id = self.id;
            handle.spawn(async move {
                system.exit(id, ExitReason::Normal).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use tracing_test::traced_test;

    use std::time::Duration;

    #[tokio::test]
    #[traced_test]
    async fn test_stop_event_system() {
        let token = CancellationToken::new();
        let (_system, mut runner) = EventSystem::create(token.clone());

        let handle = tokio::spawn(async move {
            runner.run().await;
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(logs_contain("Running event system..."));
        token.cancel();
        handle.await.unwrap();

        assert!(logs_contain("Stopping event system..."));
        assert!(logs_contain("Event system stopped."));
    }

    #[tokio::test]
    async fn test_links_are_bidirectional() {
        let (system, _) = EventSystem::create(CancellationToken::new());
        let a = system.watcher().await;
        let b = system.watcher().await;
        system.link(a.id(), b.id()).await.unwrap();
        assert_eq!(system.links_of(a.id()).await, vec![b.id()]);
        assert_eq!(system.links_of(b.id()).await, vec![a.id()]);
        system.unlink(b.id(), a.id()).await;
        assert!(system.links_of(a.id()).await.is_empty());
    }

    #[tokio::test]
    async fn test_exit_notifies_links_and_monitors() {
        let (system, _) = EventSystem::create(CancellationToken::new());
        let mut linked = system.watcher().await;
        let mut monitoring = system.watcher().await;
        let leaving = system.watcher().await;
        let leaving_id = leaving.id();
        system.link(linked.id(), leaving_id).await.unwrap();
        system.monitor(monitoring.id(), leaving_id).await;

        leaving.exit(ExitReason::Other("bye".to_owned())).await;

        assert_eq!(
            linked.recv().await,
            Some(ExitSignal::Exit {
                from: leaving_id,
                reason: ExitReason::Other("bye".to_owned()),
            })
        );
        assert_eq!(
            monitoring.recv().await,
            Some(ExitSignal::Down {
                from: leaving_id,
                reason: ExitReason::Other("bye".to_owned()),
            })
        );
        assert!(!system.is_alive(leaving_id).await);
        assert!(system.links_of(linked.id()).await.is_empty());
        assert_eq!(system.link(linked.id(), leaving_id).await, Err(Error::NoProc));
    }

    #[tokio::test]
    async fn test_monitor_dead_unit() {
        let (system, _) = EventSystem::create(CancellationToken::new());
        let mut watcher = system.watcher().await;
        let gone = system.watcher().await;
        let gone_id = gone.id();
        gone.exit(ExitReason::Normal).await;
        system.monitor(watcher.id(), gone_id).await;
        assert_eq!(
            watcher.try_recv(),
            Some(ExitSignal::Down {
                from: gone_id,
                reason: ExitReason::NoProc,
            })
        );
    }

    #[tokio::test]
    async fn test_dropped_watcher_exits() {
        let (system, _) = EventSystem::create(CancellationToken::new());
        let mut linked = system.watcher().await;
        let dropped = system.watcher().await;
        let dropped_id = dropped.id();
        system.link(linked.id(), dropped_id).await.unwrap();
        drop(dropped);
        assert_eq!(
            linked.recv().await,
            Some(ExitSignal::Exit {
                from: dropped_id,
                reason: ExitReason::Normal,
            })
        );
    }

    #[tokio::test]
    async fn test_stopped_managers_release_stop_channels() {
        let (system, _) = EventSystem::create(CancellationToken::new());
        for _ in 0..50 {
            let manager =
                system.start::<u8>(StartOptions::default()).await.unwrap();
            manager.stop(ExitReason::Normal).await.unwrap();
        }
        assert!(system.root_senders.read().await.is_empty());

        let live = system.start::<u8>(StartOptions::default()).await.unwrap();
        assert_eq!(system.root_senders.read().await.len(), 1);
        live.stop(ExitReason::Normal).await.unwrap();
        assert!(system.root_senders.read().await.is_empty());
    }

    #[test]
    fn test_abnormal_reasons() {
        assert!(!ExitReason::Normal.is_abnormal());
        assert!(!ExitReason::Shutdown.is_abnormal());
        assert!(ExitReason::Fault(Error::NoProc).is_abnormal());
        assert!(ExitReason::Other("x".to_owned()).is_abnormal());
    }
}
