//! Shared behavioural checks for [`RecordStore`] backends.
//!
//! Each backend calls [`run_all`] from its own tests. Keys are namespaced
//! with a random prefix so the suite can run against a shared database.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use time::OffsetDateTime;

use super::record::{RecordStore, StoredRecord, expiry_after};
use crate::token::generate_token;

fn live(value: serde_json::Value) -> StoredRecord {
    StoredRecord::new(value, expiry_after(Duration::from_secs(300)))
}

fn expired(value: serde_json::Value) -> StoredRecord {
    StoredRecord::new(value, OffsetDateTime::now_utc() - time::Duration::seconds(10))
}

/// Runs every check against `store`. Panics on the first violation.
pub async fn run_all(store: Arc<dyn RecordStore>) {
    let ns = format!("conf-{}:", generate_token(6));
    put_get_delete(store.as_ref(), &ns).await;
    put_if_absent_semantics(store.as_ref(), &ns).await;
    take_is_single_use(store.as_ref(), &ns).await;
    replace_requires_existing(store.as_ref(), &ns).await;
    replace_if_unchanged_semantics(store.as_ref(), &ns).await;
    expired_records_stay_readable(store.as_ref(), &ns).await;
    prefix_operations(store.as_ref(), &ns).await;
    concurrent_put_if_absent(store.clone(), &ns).await;
    concurrent_read_modify_write(store.clone(), &ns).await;
}

async fn put_get_delete(store: &dyn RecordStore, ns: &str) {
    let key = format!("{ns}basic");
    assert!(store.get(&key).await.unwrap().is_none());

    store.put(&key, live(json!({"n": 1}))).await.unwrap();
    let got = store.get(&key).await.unwrap().unwrap();
    assert_eq!(got.value, json!({"n": 1}));

    store.put(&key, live(json!({"n": 2}))).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap().unwrap().value, json!({"n": 2}));

    assert!(store.delete(&key).await.unwrap());
    assert!(!store.delete(&key).await.unwrap());
    assert!(store.get(&key).await.unwrap().is_none());
}

async fn put_if_absent_semantics(store: &dyn RecordStore, ns: &str) {
    let key = format!("{ns}once");
    assert!(store.put_if_absent(&key, live(json!("first"))).await.unwrap());
    assert!(!store.put_if_absent(&key, live(json!("second"))).await.unwrap());
    assert_eq!(store.get(&key).await.unwrap().unwrap().value, json!("first"));

    let stale = format!("{ns}stale");
    store.put(&stale, expired(json!("old"))).await.unwrap();
    assert!(store.put_if_absent(&stale, live(json!("new"))).await.unwrap());
    assert_eq!(store.get(&stale).await.unwrap().unwrap().value, json!("new"));
}

async fn take_is_single_use(store: &dyn RecordStore, ns: &str) {
    let key = format!("{ns}take");
    store.put(&key, live(json!(42))).await.unwrap();
    assert_eq!(store.take(&key).await.unwrap().unwrap().value, json!(42));
    assert!(store.take(&key).await.unwrap().is_none());

    let stale = format!("{ns}take-stale");
    store.put(&stale, expired(json!(1))).await.unwrap();
    let taken = store.take(&stale).await.unwrap().unwrap();
    assert!(taken.is_expired());
    assert!(store.get(&stale).await.unwrap().is_none());
}

async fn replace_requires_existing(store: &dyn RecordStore, ns: &str) {
    let key = format!("{ns}replace");
    assert!(!store.replace(&key, live(json!("x"))).await.unwrap());
    assert!(store.get(&key).await.unwrap().is_none());

    store.put(&key, live(json!("x"))).await.unwrap();
    assert!(store.replace(&key, live(json!("y"))).await.unwrap());
    assert_eq!(store.get(&key).await.unwrap().unwrap().value, json!("y"));
}

async fn replace_if_unchanged_semantics(store: &dyn RecordStore, ns: &str) {
    let key = format!("{ns}cas");
    let never_stored = live(json!("none"));
    assert!(!store.replace_if_unchanged(&key, &never_stored, live(json!("x"))).await.unwrap());
    assert!(store.get(&key).await.unwrap().is_none());

    store.put(&key, live(json!({"v": 1}))).await.unwrap();
    let read = store.get(&key).await.unwrap().unwrap();
    assert!(store.replace_if_unchanged(&key, &read, live(json!({"v": 2}))).await.unwrap());

    // `read` no longer matches the stored record.
    assert!(!store.replace_if_unchanged(&key, &read, live(json!({"v": 3}))).await.unwrap());
    assert_eq!(store.get(&key).await.unwrap().unwrap().value, json!({"v": 2}));
}

async fn expired_records_stay_readable(store: &dyn RecordStore, ns: &str) {
    let key = format!("{ns}expired");
    store.put(&key, expired(json!("gone"))).await.unwrap();
    let got = store.get(&key).await.unwrap().unwrap();
    assert!(got.is_expired());
    assert_eq!(got.value, json!("gone"));
}

async fn prefix_operations(store: &dyn RecordStore, ns: &str) {
    let prefix = format!("{ns}scan:");
    store.put(&format!("{prefix}a"), live(json!(1))).await.unwrap();
    store.put(&format!("{prefix}b"), live(json!(2))).await.unwrap();
    store.put(&format!("{prefix}c"), expired(json!(3))).await.unwrap();
    store.put(&format!("{ns}other"), expired(json!(4))).await.unwrap();

    let mut keys: Vec<String> = store
        .scan_prefix(&prefix)
        .await
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    keys.sort();
    assert_eq!(
        keys,
        vec![format!("{prefix}a"), format!("{prefix}b"), format!("{prefix}c")]
    );

    assert_eq!(store.count_prefix(&prefix).await.unwrap(), 2);
    assert_eq!(store.purge_expired(&prefix).await.unwrap(), 1);
    assert_eq!(store.scan_prefix(&prefix).await.unwrap().len(), 2);
    // Outside the prefix: untouched.
    assert!(store.get(&format!("{ns}other")).await.unwrap().is_some());
}

async fn concurrent_put_if_absent(store: Arc<dyn RecordStore>, ns: &str) {
    let key = format!("{ns}race");
    let mut tasks = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            store.put_if_absent(&key, live(json!(i))).await.unwrap()
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one concurrent insert must win");
}

async fn concurrent_read_modify_write(store: Arc<dyn RecordStore>, ns: &str) {
    let key = format!("{ns}counter");
    store.put(&key, live(json!(0))).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let current = store.get(&key).await.unwrap().unwrap();
                let n = current.value.as_i64().unwrap();
                if store
                    .replace_if_unchanged(&key, &current, live(json!(n + 1)))
                    .await
                    .unwrap()
                {
                    break;
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(
        store.get(&key).await.unwrap().unwrap().value,
        json!(16),
        "no increment may be lost"
    );
}
