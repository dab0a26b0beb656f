//! Durable binding: event-log bridge, restart resume and reseeding.

mod common;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::transport::{connect, transport, CHANNEL};
use common::wait::{next_event, next_item};
use common::{
    allowlist_override, config_hint, context, variant_hint, FakeBroker, FakeSource,
    VariantBuilder,
};
use flagreplica::eventlog::{EventLog, FatalHook, ReplicatorTarget};
use flagreplica::replica::VARIANT_TOPIC;
use flagreplica::{
    BusError, ChangeKind, Database, LocalReplica, Replica, ReplicaSettings, ReplicaStore,
    ValueQuery, VariantKey,
};

fn settings() -> ReplicaSettings {
    ReplicaSettings {
        channel: CHANNEL.to_string(),
        full_refresh_interval: Duration::from_secs(3600),
        idle_interval: Duration::from_millis(20),
        batch_size: 2,
        ..ReplicaSettings::default()
    }
}

fn checkpoint(path: &Path) -> Option<String> {
    let db = Database::open(path).unwrap();
    let local = LocalReplica::open(db, Arc::new(ReplicaStore::new())).unwrap();
    local.replicator_consumer_id().unwrap()
}

fn seeded_source() -> Arc<FakeSource> {
    FakeSource::with([
        VariantBuilder::new("v1", "a").value(json!(1)).build(),
        VariantBuilder::new("v2", "b").value(json!(1)).build(),
        VariantBuilder::new("v3", "c").value(json!(1)).build(),
    ])
}

#[tokio::test]
async fn test_first_start_seeds_and_checkpoints() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("replica.db");
    let source = seeded_source();

    let replica = Replica::new(16);
    let mut events = Box::pin(replica.watch("P", CancellationToken::new()));
    replica
        .start_durable(source.clone(), Database::open(&path).unwrap(), None, settings(), None)
        .await
        .unwrap();

    assert_eq!(replica.store().len(), 3);
    for _ in 0..3 {
        assert_eq!(next_event(&mut events).await.kind, ChangeKind::Created);
    }
    replica.stop().await;

    assert!(checkpoint(&path).is_some());
}

#[tokio::test]
async fn test_notifications_flow_through_the_log() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let broker = FakeBroker::new();
    let transport = transport(&broker);

    let replica = Replica::new(16);
    replica
        .start_durable(
            source.clone(),
            Database::open(&dir.path().join("replica.db")).unwrap(),
            Some(&transport),
            settings(),
            None,
        )
        .await
        .unwrap();
    connect(&transport).await;
    let mut events = Box::pin(replica.watch("P", CancellationToken::new()));

    source.update("v2", json!(2));
    broker.publish(CHANNEL, &variant_hint("v2"));
    broker.publish(CHANNEL, &variant_hint("v2"));
    let updated = next_event(&mut events).await;
    assert_eq!(updated.kind, ChangeKind::Updated);
    assert_eq!(updated.entity.variant_id, "v2");

    source.remove("v3");
    broker.publish(CHANNEL, &variant_hint("v3"));
    let deleted = next_event(&mut events).await;
    assert_eq!(deleted.kind, ChangeKind::Deleted);
    assert_eq!(deleted.entity.variant_id, "v3");
    assert!(replica.get_config(&VariantKey::new("P", "c", "prod")).is_none());

    // Config-level hints sweep the whole source.
    source.update("v1", json!(3));
    broker.publish(CHANNEL, &config_hint("c-a"));
    let swept = next_event(&mut events).await;
    assert_eq!(swept.kind, ChangeKind::Updated);
    assert_eq!(swept.entity.variant_id, "v1");
    assert_eq!(swept.entity.value, json!(3));

    replica.stop().await;
    transport.stop().await;
}

#[tokio::test]
async fn test_restart_resumes_from_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("replica.db");
    let source = seeded_source();

    let first = Replica::new(16);
    first
        .start_durable(source.clone(), Database::open(&path).unwrap(), None, settings(), None)
        .await
        .unwrap();
    first.stop().await;
    let consumer = checkpoint(&path).unwrap();

    // Written while nothing was listening.
    source.update("v1", json!(2));

    let second = Replica::new(16);
    let mut events = Box::pin(second.watch("P", CancellationToken::new()));
    second
        .start_durable(source.clone(), Database::open(&path).unwrap(), None, settings(), None)
        .await
        .unwrap();

    // Served from disk before the source is consulted again.
    assert_eq!(second.store().len(), 3);

    let caught_up = next_event(&mut events).await;
    assert_eq!(caught_up.kind, ChangeKind::Updated);
    assert_eq!(caught_up.entity.variant_id, "v1");
    assert_eq!(caught_up.entity.version, 2);

    // Unchanged variants are not replayed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.next().now_or_never().is_none());

    second.stop().await;
    assert_eq!(checkpoint(&path), Some(consumer));
}

#[tokio::test]
async fn test_forgotten_consumer_reseeds() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("replica.db");
    let source = seeded_source();

    let first = Replica::new(16);
    first
        .start_durable(source.clone(), Database::open(&path).unwrap(), None, settings(), None)
        .await
        .unwrap();
    first.stop().await;
    let consumer = checkpoint(&path).unwrap();

    let log = EventLog::new(Database::open(&path).unwrap());
    assert!(log.topic(VARIANT_TOPIC).destroy_consumer(&consumer).unwrap());

    source.remove("v3");
    source.put(VariantBuilder::new("v4", "d").value(json!(4)).build());

    let second = Replica::new(16);
    second
        .start_durable(source.clone(), Database::open(&path).unwrap(), None, settings(), None)
        .await
        .unwrap();

    let mut ids: Vec<String> = second
        .store()
        .snapshot()
        .iter()
        .map(|v| v.variant_id.clone())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["v1", "v2", "v4"]);

    second.stop().await;
    let reseeded = checkpoint(&path).unwrap();
    assert_ne!(reseeded, consumer);
}

#[tokio::test]
async fn test_consumer_destroyed_while_running_is_fatal() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("replica.db");
    let source = seeded_source();
    let broker = FakeBroker::new();
    let transport = transport(&broker);

    let fatal: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let hook: FatalHook = {
        let fatal = Arc::clone(&fatal);
        Arc::new(move |e: &flagreplica::ReplicatorError| {
            *fatal.lock().unwrap() = Some(e.to_string());
        })
    };

    let replica = Replica::new(16);
    replica
        .start_durable(
            source.clone(),
            Database::open(&path).unwrap(),
            Some(&transport),
            settings(),
            Some(hook),
        )
        .await
        .unwrap();
    connect(&transport).await;
    let mut events = Box::pin(replica.watch("P", CancellationToken::new()));

    let consumer = checkpoint(&path).unwrap();
    let log = EventLog::new(Database::open(&path).unwrap());
    log.topic(VARIANT_TOPIC).destroy_consumer(&consumer).unwrap();

    source.update("v1", json!(2));
    broker.publish(CHANNEL, &variant_hint("v1"));

    match next_item(&mut events).await {
        Some(Err(BusError::Failed(message))) => assert!(message.contains(&consumer)),
        other => panic!("expected the stream to fail, got {:?}", other),
    }
    assert!(fatal.lock().unwrap().is_some());

    replica.stop().await;
    transport.stop().await;
}

#[tokio::test]
async fn test_referencing_flag_rerendered_through_the_log() {
    let dir = TempDir::new().unwrap();
    let source = FakeSource::with([VariantBuilder::new("a1", "allowlist")
        .value(json!({"users": ["x"]}))
        .build()]);
    source.put_authored(
        VariantBuilder::new("b1", "beta").value(json!(false)).build(),
        vec![allowlist_override("allowlist")],
    );
    let broker = FakeBroker::new();
    let transport = transport(&broker);

    let replica = Replica::new(16);
    replica
        .start_durable(
            source.clone(),
            Database::open(&dir.path().join("replica.db")).unwrap(),
            Some(&transport),
            settings(),
            None,
        )
        .await
        .unwrap();
    connect(&transport).await;
    let for_y = ValueQuery::new(VariantKey::new("P", "beta", "prod"))
        .with_context(context(json!({"userId": "y"})));
    assert_eq!(replica.get_config_value(&for_y), Some(json!(false)));

    let mut events = Box::pin(replica.watch("P", CancellationToken::new()));
    source.update("a1", json!({"users": ["x", "y"]}));
    broker.publish(CHANNEL, &variant_hint("a1"));

    assert_eq!(next_event(&mut events).await.entity.config_name, "allowlist");
    let beta = next_event(&mut events).await;
    assert_eq!(beta.kind, ChangeKind::Updated);
    assert_eq!(beta.entity.config_name, "beta");
    assert_eq!(replica.get_config_value(&for_y), Some(json!(true)));

    replica.stop().await;
    transport.stop().await;
}
