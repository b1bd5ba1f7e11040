//! Platform-facing scenarios that don't require a live websocket server:
//! queue ordering (spec.md §8 scenario 5's ordering guarantee) and
//! registration idempotence across restarts (scenario 6).

use chrono::Utc;
use uuid::Uuid;

use premiscale::action::{Action, ActionOutcome, AuditRecord};
use premiscale::platform::protocol::{RegistrationEnvelope, RegistrationResponse};
use premiscale::queues::{PlatformMessage, platform_queue};

fn audit(id: u8) -> AuditRecord {
    AuditRecord {
        id: Uuid::new_v4(),
        action: Action::Delete { asg: "g1".into(), vm: format!("g1-{id}"), host: "h1".into(), reclaim_storage: true },
        asg: "g1".into(),
        host: "h1".into(),
        vm: format!("g1-{id}"),
        started_at: Utc::now(),
        finished_at: Utc::now(),
        outcome: ActionOutcome::Succeeded,
        error: None,
    }
}

#[tokio::test]
async fn platform_queue_preserves_enqueue_order_across_a_disconnect() {
    let (tx, mut rx) = platform_queue(8);

    // Three audit messages enqueued while the link is "disconnected"
    // (nothing draining the receiver yet).
    for id in 0..3u8 {
        tx.send(PlatformMessage::Audit(audit(id))).await.unwrap();
    }

    // "Reconnect": drain and check order.
    for expected in 0..3u8 {
        match rx.recv().await.unwrap() {
            PlatformMessage::Audit(record) => assert_eq!(record.vm, format!("g1-{expected}")),
            PlatformMessage::Telemetry(_) => panic!("unexpected telemetry message"),
        }
    }
}

#[tokio::test]
async fn registration_is_skipped_on_restart_against_the_same_host_but_not_a_new_one() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registration.json");
    let store = premiscale::platform::RegistrationStore::new(path);

    assert!(store.load().is_none(), "no cached registration before first run");

    store
        .save(&RegistrationEnvelope {
            host: "p1.example.com".into(),
            response: RegistrationResponse { agent_id: "agent-1".into(), extra: serde_json::Value::Null },
        })
        .unwrap();

    let cached = store.load().expect("registration cached after first run");
    assert_eq!(cached.host, "p1.example.com", "restart against the same host should find a cache hit");
    assert_ne!(cached.host, "p2.example.com", "pointing at a new host must not reuse the cached registration");
}
