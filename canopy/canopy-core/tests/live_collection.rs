use canopy_core::{BatchWriter, ChangeSubscriber, Error, MemoryStore, Reader};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, PartialEq)]
enum Change {
    Upsert(String, Value),
    Remove(String),
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Change>) -> Change {
    timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn created_rooms_show_up_in_a_live_collection() {
    let store = Arc::new(MemoryStore::new());
    let mut writer = BatchWriter::new(store.clone());
    let watcher = ChangeSubscriber::new(store.clone());
    let reader = Reader::new(store.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let remove_tx = tx.clone();
    let handle = watcher
        .watch_collection(
            ["rooms"],
            move |key, value| {
                let _ = tx.send(Change::Upsert(key, value));
            },
            move |key| {
                let _ = remove_tx.send(Change::Remove(key));
            },
            |e| panic!("unexpected subscription error: {e}"),
        )
        .await
        .unwrap();

    let first = writer.create(["rooms"]).await.unwrap();
    let second = writer.create(["rooms"]).await.unwrap();
    assert!(first < second);

    writer.begin();
    writer.set(["rooms", first.as_str()], ["name"], json!("lobby")).unwrap();
    writer.set(["rooms", second.as_str()], ["name"], json!("kitchen")).unwrap();
    writer.commit().await.unwrap();

    assert_eq!(next(&mut rx).await, Change::Upsert(first.clone(), json!({"name": "lobby"})));
    assert_eq!(next(&mut rx).await, Change::Upsert(second.clone(), json!({"name": "kitchen"})));

    assert_eq!(writer.increment(["rooms", first.as_str()], ["visits"]).await.unwrap(), 1);
    assert_eq!(
        next(&mut rx).await,
        Change::Upsert(first.clone(), json!({"name": "lobby", "visits": 1}))
    );

    writer.take(["rooms", first.as_str()], ["owner"], json!("ann")).await.unwrap();
    next(&mut rx).await;
    let err = writer
        .take(["rooms", first.as_str()], ["owner"], json!("bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyClaimed { .. }));

    writer.remove(["rooms"], [second.as_str()]).unwrap();
    writer.commit().await.unwrap();
    assert_eq!(next(&mut rx).await, Change::Remove(second.clone()));

    assert_eq!(
        reader.read(["rooms", first.as_str(), "owner"]).await.unwrap(),
        Some(json!("ann"))
    );

    handle.cancel();
    assert_eq!(watcher.active_count(), 0);
}
