use std::time::Duration;

use relay::{Filter, HttpRelay, MemoryRelay, RelayStore};
use serde_json::json;

async fn spawn_relay() -> HttpRelay {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind relay listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(relay::server::serve(listener, MemoryRelay::new()));
    HttpRelay::new(&format!("http://{addr}")).with_poll_interval(Duration::from_millis(25))
}

#[tokio::test]
async fn crud_round_trip_over_http() {
    let relay = spawn_relay().await;
    relay.health().await.expect("relay healthy");

    relay
        .put("users", "u1", json!({"user_id": "u1", "queue_status": "queued"}), false)
        .await
        .expect("put");
    relay
        .put("users", "u1", json!({"queue_status": "paired"}), true)
        .await
        .expect("merge put");

    let record = relay.get("users", "u1").await.expect("get").expect("present");
    assert_eq!(record.fields["user_id"], "u1");
    assert_eq!(record.fields["queue_status"], "paired");

    assert!(relay.get("users", "missing").await.expect("get").is_none());

    assert!(relay.delete("users", "u1").await.expect("delete"));
    assert!(!relay.delete("users", "u1").await.expect("repeat delete"));
}

#[tokio::test]
async fn list_honors_field_filter() {
    let relay = spawn_relay().await;

    relay
        .put("candidates", "x1", json!({"call_id": "c1", "candidate": "a"}), false)
        .await
        .expect("put");
    relay
        .put("candidates", "x2", json!({"call_id": "c2", "candidate": "b"}), false)
        .await
        .expect("put");

    let matching = relay
        .list("candidates", &Filter::field_eq("call_id", "c1"))
        .await
        .expect("list");
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].id, "x1");

    let all = relay.list("candidates", &Filter::All).await.expect("list all");
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn record_subscription_polls_changes() {
    let relay = spawn_relay().await;

    let mut sub = relay
        .subscribe_record("calls", "c1")
        .await
        .expect("subscribe");
    let initial = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("initial poll")
        .expect("channel open");
    assert!(initial.is_none());

    relay
        .put("calls", "c1", json!({"call_id": "c1", "offer": "sdp"}), false)
        .await
        .expect("put");
    let update = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("update delivered")
        .expect("channel open")
        .expect("record present");
    assert_eq!(update.fields["offer"], "sdp");

    relay.delete("calls", "c1").await.expect("delete");
    let gone = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("deletion delivered")
        .expect("channel open");
    assert!(gone.is_none());
}

#[tokio::test]
async fn collection_subscription_tracks_matching_set() {
    let relay = spawn_relay().await;

    let mut sub = relay
        .subscribe_collection("queue", Filter::All)
        .await
        .expect("subscribe");
    let initial = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("initial poll")
        .expect("channel open");
    assert!(initial.is_empty());

    relay
        .put("queue", "u1", json!({"user_id": "u1"}), false)
        .await
        .expect("put");
    let snapshot = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("snapshot delivered")
        .expect("channel open");
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, "u1");
}
