// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for links, monitors, names and system shutdown.

use manager::{
    AddOptions, Capabilities, Error, EventHandler, EventSystem, ExitReason,
    ExitSignal, Flow, HandlerId, Payload, Reason, StartOptions,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use std::time::Duration;

/// Counts events, fails on odd ones when strict.
#[derive(Default)]
struct Counter {
    count: usize,
    strict: bool,
}

#[async_trait]
impl EventHandler<u32> for Counter {
    type Call = ();
    type Reply = usize;

    const CAPABILITIES: Capabilities =
        Capabilities::EVENTS.with(Capabilities::CALLS);

    async fn handle_event(&mut self, event: &u32) -> Result<Flow, Error> {
        if self.strict && event % 2 == 1 {
            return Err(Error::Functional(format!("odd event {}", event)));
        }
        self.count += 1;
        Ok(Flow::Continue)
    }

    async fn handle_call(&mut self, _msg: ()) -> Result<(usize, Flow), Error> {
        Ok((self.count, Flow::Continue))
    }
}

/// Takes its time with every event.
struct Slow;

#[async_trait]
impl EventHandler<u32> for Slow {
    type Call = ();
    type Reply = ();

    const CAPABILITIES: Capabilities = Capabilities::EVENTS;

    async fn handle_event(&mut self, _event: &u32) -> Result<Flow, Error> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(Flow::Continue)
    }
}

/// Reports the events it saw when it leaves the chain.
struct Reporter {
    seen: Vec<u32>,
    report: mpsc::UnboundedSender<Vec<u32>>,
}

#[async_trait]
impl EventHandler<u32> for Reporter {
    type Call = ();
    type Reply = ();

    const CAPABILITIES: Capabilities = Capabilities::EVENTS;

    async fn handle_event(&mut self, event: &u32) -> Result<Flow, Error> {
        self.seen.push(*event);
        Ok(Flow::Continue)
    }

    async fn terminate(&mut self, _reason: &Reason) -> Option<Payload> {
        let _ = self.report.send(self.seen.clone());
        None
    }
}

#[tokio::test]
async fn test_start_link_semantics() {
    let (system, _runner) = EventSystem::create(CancellationToken::new());
    let watcher = system.watcher().await;

    let unlinked = system.start::<u32>(StartOptions::default()).await.unwrap();
    assert!(!system.links_of(watcher.id()).await.contains(&unlinked.id()));

    let linked = system
        .start_link::<u32>(&watcher, StartOptions::default())
        .await
        .unwrap();
    assert!(system.links_of(watcher.id()).await.contains(&linked.id()));

    unlinked
        .add_handler(
            "counter",
            Counter::default(),
            AddOptions::linked(watcher.id()),
        )
        .await
        .unwrap();
    assert_eq!(
        system.links_of(watcher.id()).await,
        vec![unlinked.id(), linked.id()]
    );
}

#[tokio::test]
async fn test_handler_link_lifecycle() {
    let (system, _runner) = EventSystem::create(CancellationToken::new());
    let mut watcher = system.watcher().await;
    let manager = system.start::<u32>(StartOptions::default()).await.unwrap();

    manager
        .add_handler("a", Counter::default(), AddOptions::linked(watcher.id()))
        .await
        .unwrap();
    manager
        .add_handler("b", Counter::default(), AddOptions::linked(watcher.id()))
        .await
        .unwrap();

    manager.remove_handler("a", Payload::empty()).await.unwrap();
    assert_eq!(
        watcher.recv().await,
        Some(ExitSignal::HandlerExit {
            manager: manager.id(),
            handler: HandlerId::from("a"),
            reason: ExitReason::Normal,
        })
    );
    manager.which_handlers().await.unwrap();
    assert_eq!(system.links_of(watcher.id()).await, vec![manager.id()]);

    manager.remove_handler("b", Payload::empty()).await.unwrap();
    assert!(matches!(
        watcher.recv().await,
        Some(ExitSignal::HandlerExit { .. })
    ));
    manager.which_handlers().await.unwrap();
    assert!(system.links_of(watcher.id()).await.is_empty());
}

#[tokio::test]
async fn test_linked_handler_fault_is_reported() {
    let (system, _runner) = EventSystem::create(CancellationToken::new());
    let mut watcher = system.watcher().await;
    let manager = system.start::<u32>(StartOptions::default()).await.unwrap();

    let strict = Counter {
        count: 0,
        strict: true,
    };
    manager
        .add_handler("strict", strict, AddOptions::linked(watcher.id()))
        .await
        .unwrap();
    manager
        .add_handler("lenient", Counter::default(), AddOptions::default())
        .await
        .unwrap();

    manager.notify(2);
    manager.notify(3);
    manager.notify(4);

    match watcher.recv().await {
        Some(ExitSignal::HandlerExit {
            handler,
            reason: ExitReason::Fault(Error::Handler(_, message)),
            ..
        }) => {
            assert_eq!(handler, HandlerId::from("strict"));
            assert!(message.contains("odd event 3"));
        }
        other => panic!("unexpected signal {:?}", other),
    }
    assert_eq!(manager.call::<Counter>("lenient", ()).await, Ok(3));
    assert_eq!(
        manager.which_handlers().await.unwrap(),
        vec![HandlerId::from("lenient")]
    );
}

#[tokio::test]
async fn test_watcher_exit_removes_linked_handlers() {
    let (system, _runner) = EventSystem::create(CancellationToken::new());
    let watcher = system.watcher().await;
    let manager = system.start::<u32>(StartOptions::default()).await.unwrap();

    manager
        .add_handler("linked", Counter::default(), AddOptions::linked(watcher.id()))
        .await
        .unwrap();
    manager
        .add_handler("free", Counter::default(), AddOptions::default())
        .await
        .unwrap();

    watcher.exit(ExitReason::Other("done".to_owned())).await;
    assert_eq!(
        manager.which_handlers().await.unwrap(),
        vec![HandlerId::from("free")]
    );
    assert!(system.is_alive(manager.id()).await);
}

#[tokio::test]
async fn test_watcher_exit_waits_for_queued_events() {
    let (system, _runner) = EventSystem::create(CancellationToken::new());
    let watcher = system.watcher().await;
    let manager = system.start::<u32>(StartOptions::default()).await.unwrap();
    let (report, mut reports) = mpsc::unbounded_channel();

    manager
        .add_handler("slow", Slow, AddOptions::default())
        .await
        .unwrap();
    manager
        .add_handler(
            "reporter",
            Reporter {
                seen: Vec::new(),
                report,
            },
            AddOptions::linked(watcher.id()),
        )
        .await
        .unwrap();

    for event in 1..=3 {
        manager.notify(event);
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    watcher.exit(ExitReason::Other("done".to_owned())).await;

    assert_eq!(reports.recv().await, Some(vec![1, 2, 3]));
    assert_eq!(
        manager.which_handlers().await.unwrap(),
        vec![HandlerId::from("slow")]
    );
}

#[tokio::test]
async fn test_creator_exit_keeps_queued_requests() {
    let (system, _runner) = EventSystem::create(CancellationToken::new());
    let creator = system.watcher().await;
    let mut observer = system.watcher().await;
    let manager = system
        .start_link::<u32>(&creator, StartOptions::default())
        .await
        .unwrap();
    system.monitor(observer.id(), manager.id()).await;
    manager
        .add_handler("slow", Slow, AddOptions::default())
        .await
        .unwrap();

    manager.notify(1);
    let queued = manager.clone();
    let pending = tokio::spawn(async move { queued.sync_notify(2).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    creator.exit(ExitReason::Other("crash".to_owned())).await;

    assert_eq!(pending.await.unwrap(), Ok(()));
    assert_eq!(
        observer.recv().await,
        Some(ExitSignal::Down {
            from: manager.id(),
            reason: ExitReason::Other("crash".to_owned()),
        })
    );
}

#[tokio::test]
async fn test_swap_does_not_carry_link() {
    let (system, _runner) = EventSystem::create(CancellationToken::new());
    let mut watcher = system.watcher().await;
    let manager = system.start::<u32>(StartOptions::default()).await.unwrap();

    manager
        .add_handler("old", Counter::default(), AddOptions::linked(watcher.id()))
        .await
        .unwrap();
    manager
        .swap_handler(
            "old",
            Payload::empty(),
            "new",
            Counter::default(),
            AddOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        watcher.recv().await,
        Some(ExitSignal::HandlerExit {
            manager: manager.id(),
            handler: HandlerId::from("old"),
            reason: ExitReason::Swapped(HandlerId::from("new")),
        })
    );
    manager.which_handlers().await.unwrap();
    assert!(system.links_of(watcher.id()).await.is_empty());

    manager
        .swap_handler(
            "new",
            Payload::empty(),
            "newer",
            Counter::default(),
            AddOptions::linked(watcher.id()),
        )
        .await
        .unwrap();
    assert_eq!(system.links_of(watcher.id()).await, vec![manager.id()]);
    assert!(watcher.try_recv().is_none());
}

#[tokio::test]
async fn test_creator_exit_stops_manager() {
    let (system, _runner) = EventSystem::create(CancellationToken::new());
    let creator = system.watcher().await;
    let mut observer = system.watcher().await;

    let manager = system
        .start_link::<u32>(&creator, StartOptions::default())
        .await
        .unwrap();
    system.monitor(observer.id(), manager.id()).await;

    creator.exit(ExitReason::Other("crash".to_owned())).await;
    assert_eq!(
        observer.recv().await,
        Some(ExitSignal::Down {
            from: manager.id(),
            reason: ExitReason::Other("crash".to_owned()),
        })
    );
    assert_eq!(manager.sync_notify(1).await, Err(Error::NoProc));
}

#[tokio::test]
async fn test_manager_stop_notifies_creator() {
    let (system, _runner) = EventSystem::create(CancellationToken::new());
    let mut creator = system.watcher().await;
    let manager = system
        .start_link::<u32>(&creator, StartOptions::default())
        .await
        .unwrap();

    manager.stop(ExitReason::Normal).await.unwrap();
    assert_eq!(
        creator.recv().await,
        Some(ExitSignal::Exit {
            from: manager.id(),
            reason: ExitReason::Normal,
        })
    );
    assert!(system.links_of(creator.id()).await.is_empty());
}

#[tokio::test]
async fn test_start_link_to_dead_watcher_fails() {
    let (system, _runner) = EventSystem::create(CancellationToken::new());
    let watcher = system.watcher().await;
    let id = watcher.id();
    watcher.exit(ExitReason::Normal).await;

    let result = system
        .start::<u32>(StartOptions::default().link(id))
        .await;
    assert!(matches!(result, Err(Error::NoProc)));

    let manager = system.start::<u32>(StartOptions::default()).await.unwrap();
    assert_eq!(
        manager
            .add_handler("counter", Counter::default(), AddOptions::linked(id))
            .await,
        Err(Error::NoProc)
    );
    assert!(manager.which_handlers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_named_managers() {
    let (system, _runner) = EventSystem::create(CancellationToken::new());
    let manager = system
        .start::<u32>(StartOptions::default().name("audit"))
        .await
        .unwrap();

    let found = system.whereis::<u32>("audit").await.unwrap();
    assert_eq!(found.id(), manager.id());
    assert!(system.whereis::<String>("audit").await.is_none());
    assert!(system.whereis::<u32>("other").await.is_none());

    let taken = system
        .start::<u32>(StartOptions::default().name("audit"))
        .await;
    assert!(matches!(taken, Err(Error::NameTaken(name)) if name == "audit"));

    assert_eq!(
        system.stop_named::<u32>("audit", ExitReason::Normal).await,
        Ok(())
    );
    assert!(system.whereis::<u32>("audit").await.is_none());
    assert_eq!(
        system.stop_named::<u32>("audit", ExitReason::Normal).await,
        Err(Error::NoProc)
    );
}

#[tokio::test]
async fn test_system_shutdown_stops_managers() {
    let token = CancellationToken::new();
    let (system, mut runner) = EventSystem::create(token.clone());
    let mut watcher = system.watcher().await;

    let first = system.start::<u32>(StartOptions::default()).await.unwrap();
    let second = system.start::<u32>(StartOptions::default()).await.unwrap();
    second
        .add_handler("counter", Counter::default(), AddOptions::linked(watcher.id()))
        .await
        .unwrap();

    system.stop_system();
    runner.run().await;

    assert!(first.is_closed());
    assert!(second.is_closed());
    assert_eq!(
        watcher.recv().await,
        Some(ExitSignal::HandlerExit {
            manager: second.id(),
            handler: HandlerId::from("counter"),
            reason: ExitReason::Shutdown,
        })
    );
    assert!(!system.is_alive(first.id()).await);
    assert!(!system.is_alive(second.id()).await);
}
