use num_bigint::BigUint;
use pinwarden_core::{
    AddReferenceOutcome, ApplyEventOperationOutcome, ChannelSource, HandleStatus, Lane,
    LifecycleEvent, ManualClock, MemoryContentStore, Orchestrator, OrchestratorSettings,
    RemoveReferenceOutcome, SourcedEvent, StaticChainClient, ThrottleSettings,
};
use std::sync::Arc;
use std::time::Duration;

const T0: i64 = 1_700_000_000_000;

struct Fixture {
    store: Arc<MemoryContentStore>,
    clock: Arc<ManualClock>,
    orchestrator: Orchestrator,
}

async fn fixture(limit: u64) -> Fixture {
    let store = Arc::new(MemoryContentStore::new());
    let chain = Arc::new(StaticChainClient::new());
    chain.set_block(1, T0).await;
    let clock = Arc::new(ManualClock::new(T0));

    let orchestrator = Orchestrator::new(
        store.clone(),
        chain,
        clock.clone(),
        OrchestratorSettings {
            limit: BigUint::from(limit),
            throttle: ThrottleSettings {
                backoff_base: Duration::from_micros(10),
                ..ThrottleSettings::default()
            },
            ..OrchestratorSettings::default()
        },
    );

    Fixture {
        store,
        clock,
        orchestrator,
    }
}

fn added(contract: &str, hash: &str, ttl: u64, sender: &str) -> SourcedEvent {
    SourcedEvent {
        source: "registry".to_string(),
        event: LifecycleEvent::HashAdded {
            contract_address: contract.to_string(),
            hash: hash.to_string(),
            ttl,
            block_number: 1,
            sender: sender.to_string(),
        },
    }
}

fn removed(contract: &str, hash: &str) -> SourcedEvent {
    SourcedEvent {
        source: "registry".to_string(),
        event: LifecycleEvent::HashRemoved {
            contract_address: contract.to_string(),
            hash: hash.to_string(),
            sender: "0xanyone".to_string(),
        },
    }
}

async fn apply_and_wait(fixture: &Fixture, event: SourcedEvent) {
    let mut outcome = fixture.orchestrator.apply(event).await.unwrap();
    if let ApplyEventOperationOutcome::AwaitingBlock { handle, .. } = outcome {
        let Some(added) = handle.await.unwrap().unwrap() else {
            return;
        };
        outcome = added;
    }
    if let ApplyEventOperationOutcome::Added {
        outcome: AddReferenceOutcome::Started(handle),
        ..
    } = outcome
    {
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_two_contracts_share_one_pin() {
    let fixture = fixture(10_000).await;
    fixture.store.put("QmShared", vec![7u8; 250]).await;

    apply_and_wait(&fixture, added("0xA", "/ipfs/QmShared", 0, "0xAlice")).await;
    apply_and_wait(&fixture, added("0xB", "QmShared", 0, "0xBob")).await;

    assert_eq!(fixture.store.calls(Lane::Fetch, "QmShared").await, 1);
    assert_eq!(fixture.store.calls(Lane::PinAdd, "QmShared").await, 1);
    assert_eq!(
        fixture.orchestrator.ledger().usage("0xalice").await,
        BigUint::from(250u32)
    );

    fixture.orchestrator.apply(removed("0xa", "QmShared")).await.unwrap();
    assert!(fixture.store.is_pinned("QmShared").await);

    let outcome = fixture.orchestrator.apply(removed("0xB", "QmShared")).await.unwrap();
    let ApplyEventOperationOutcome::Removed(RemoveReferenceOutcome::Unpinning(handle)) = outcome
    else {
        panic!("expected the last removal to unpin");
    };
    handle.await.unwrap().unwrap();

    assert!(!fixture.store.is_pinned("QmShared").await);
    assert_eq!(
        fixture.orchestrator.ledger().usage("0xalice").await,
        BigUint::from(0u32)
    );
    assert!(fixture.orchestrator.tracker().get("QmShared").await.is_none());
}

#[tokio::test]
async fn test_ttl_expiry_through_sweep() {
    let fixture = fixture(10_000).await;
    fixture.store.put("QmTtl", vec![1u8; 10]).await;
    fixture.store.put("QmForever", vec![1u8; 10]).await;

    apply_and_wait(&fixture, added("0xA", "QmTtl", 3600, "0xAlice")).await;
    apply_and_wait(&fixture, added("0xA", "QmForever", 0, "0xAlice")).await;

    assert_eq!(
        fixture.orchestrator.expiry().expiry_of("QmTtl").await,
        Some(T0 + 3_600_000)
    );
    assert_eq!(fixture.orchestrator.expiry().expiry_of("QmForever").await, None);

    fixture.clock.set(T0 + 3_599_000);
    assert!(fixture.orchestrator.sweep().await.unwrap().expired.is_empty());

    fixture.clock.set(T0 + 3_601_000);
    let result = fixture.orchestrator.sweep().await.unwrap();
    assert_eq!(result.expired, vec!["QmTtl".to_string()]);
    for handle in result.unpins {
        handle.await.unwrap().unwrap();
    }

    assert!(!fixture.store.is_pinned("QmTtl").await);
    assert!(fixture.store.is_pinned("QmForever").await);
}

#[tokio::test]
async fn test_registered_owner_is_charged() {
    let fixture = fixture(1000).await;
    fixture.store.put("QmOwned", vec![0u8; 100]).await;

    fixture
        .orchestrator
        .apply(SourcedEvent {
            source: "registry".to_string(),
            event: LifecycleEvent::OwnerRegistered {
                contract_address: "0xA".to_string(),
                owner: "0xOwner".to_string(),
            },
        })
        .await
        .unwrap();

    apply_and_wait(&fixture, added("0xA", "QmOwned", 0, "0xSender")).await;

    let ledger = fixture.orchestrator.ledger();
    assert_eq!(ledger.usage("0xowner").await, BigUint::from(100u32));
    assert!(!ledger.contains("0xsender").await);
}

#[tokio::test]
async fn test_event_loop_over_channel_source() {
    let fixture = fixture(10_000).await;
    fixture.store.put("QmLoop", vec![0u8; 42]).await;

    let (source, events) = ChannelSource::new("channel", 16);
    events.send(added("0xA", "QmLoop", 0, "0xAlice").event).await.unwrap();
    events
        .send(LifecycleEvent::LimitChanged {
            limit: "5000".to_string(),
        })
        .await
        .unwrap();
    drop(events);

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let run = fixture.orchestrator.run(vec![Box::new(source)], async move {
        let _ = stop_rx.await;
    });
    let wait = async {
        loop {
            let complete = fixture
                .orchestrator
                .tracker()
                .get("QmLoop")
                .await
                .is_some_and(|record| record.status == HandleStatus::Complete);
            let limit_applied =
                fixture.orchestrator.ledger().limit().await == BigUint::from(5000u32);
            if complete && limit_applied {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let _ = stop_tx.send(());
    };
    let (result, ()) = tokio::join!(run, wait);
    result.unwrap();

    let snapshot = fixture.orchestrator.subscribe().borrow().clone().unwrap();
    assert_eq!(snapshot.limit, "5000");
    assert_eq!(snapshot.pinned_hashes, 1);
    assert_eq!(snapshot.principals[0].used, "42");
}
