use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::remote_store::{
    ListenStream, ListenerDetach, Mutation, OrderedRange, RemoteStore, Snapshot, SnapshotEntry,
};
use crate::domain::error::SyncError;
use crate::infrastructure::settings::SyncSettings;

const DEFAULT_MAX_TRANSACTION_ATTEMPTS: u32 = 25;

type ListenerTx = mpsc::UnboundedSender<Result<Snapshot, SyncError>>;

struct Listener {
    path: Vec<String>,
    tx: ListenerTx,
}

struct Inner {
    root: Mutex<Value>,
    listeners: Mutex<HashMap<u64, Listener>>,
    next_listener_id: AtomicU64,
    push_seq: AtomicU64,
    range_reads: AtomicUsize,
    offline: AtomicBool,
    max_transaction_attempts: u32,
}

/// Документное хранилище в памяти процесса: JSON-дерево с транзакциями
/// compare-and-retry и живыми слушателями.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_max_transaction_attempts(DEFAULT_MAX_TRANSACTION_ATTEMPTS)
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::with_max_transaction_attempts(settings.transaction_max_attempts)
    }

    pub fn with_max_transaction_attempts(max_transaction_attempts: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: Mutex::new(Value::Object(Map::new())),
                listeners: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                push_seq: AtomicU64::new(0),
                range_reads: AtomicUsize::new(0),
                offline: AtomicBool::new(false),
                max_transaction_attempts: max_transaction_attempts.max(1),
            }),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn range_reads(&self) -> usize {
        self.inner.range_reads.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self, path: &str) -> usize {
        let path = segments(path);
        self.listeners()
            .values()
            .filter(|listener| listener.path == path)
            .count()
    }

    // имитация отзыва прав доступа
    pub fn fail_listeners(&self, path: &str, err: SyncError) {
        let path = segments(path);
        let mut listeners = self.listeners();
        let failed: Vec<u64> = listeners
            .iter()
            .filter(|(_, listener)| listener.path == path)
            .map(|(id, _)| *id)
            .collect();
        for id in failed {
            if let Some(listener) = listeners.remove(&id) {
                let _ = listener.tx.send(Err(err.clone()));
            }
        }
    }

    fn root(&self) -> MutexGuard<'_, Value> {
        self.inner.root.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<u64, Listener>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_online(&self, op: &str) -> Result<(), SyncError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(SyncError::NetworkFailure(format!("{op}: store unreachable")));
        }
        Ok(())
    }

    fn write(&self, path: &[String], apply: impl FnOnce(&mut Value)) {
        let mut root = self.root();
        apply(&mut root);
        self.notify(&root, path);
    }

    fn notify(&self, root: &Value, written: &[String]) {
        let mut listeners = self.listeners();
        listeners.retain(|_, listener| {
            if !related(&listener.path, written) {
                return true;
            }
            listener.tx.send(Ok(children(root, &listener.path))).is_ok()
        });
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, SyncError> {
        self.ensure_online("get")?;
        let segs = segments(path);
        Ok(value_at(&self.root(), &segs).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), SyncError> {
        self.ensure_online("set")?;
        let segs = segments(path);
        self.write(&segs, |root| put_at(root, &segs, value));
        Ok(())
    }

    async fn update(&self, path: &str, partial: Map<String, Value>) -> Result<(), SyncError> {
        self.ensure_online("update")?;
        let segs = segments(path);
        self.write(&segs, |root| {
            for (key, value) in partial {
                let mut child = segs.clone();
                child.extend(segments(&key));
                put_at(root, &child, value);
            }
        });
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), SyncError> {
        self.ensure_online("remove")?;
        let segs = segments(path);
        self.write(&segs, |root| put_at(root, &segs, Value::Null));
        Ok(())
    }

    async fn transaction(&self, path: &str, mutate: Mutation<'_>) -> Result<Value, SyncError> {
        let segs = segments(path);
        let max_attempts = self.inner.max_transaction_attempts;

        for attempt in 1..=max_attempts {
            self.ensure_online("transaction")?;
            let observed = value_at(&self.root(), &segs).cloned();

            // точка, в которой могут вклиниться другие писатели
            tokio::task::yield_now().await;
            let next = mutate(observed.clone());

            {
                let mut root = self.root();
                if value_at(&root, &segs).cloned() == observed {
                    put_at(&mut root, &segs, next.clone());
                    self.notify(&root, &segs);
                    return Ok(next);
                }
            }
            debug!(path, attempt, "transaction conflict, retrying");
        }

        Err(SyncError::TransactionAborted {
            path: path.to_string(),
            attempts: max_attempts,
        })
    }

    async fn push(&self, path: &str) -> Result<String, SyncError> {
        self.ensure_online("push")?;
        let seq = self.inner.push_seq.fetch_add(1, Ordering::SeqCst);
        let millis = Utc::now().timestamp_millis().max(0);
        debug!(path, seq, "generated child key");
        Ok(format!("k{millis:013}{seq:08}"))
    }

    async fn listen(&self, path: &str) -> Result<ListenStream, SyncError> {
        self.ensure_online("listen")?;
        let segs = segments(path);
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);

        // первый снимок уходит сразу после подключения
        let root = self.root();
        let _ = tx.send(Ok(children(&root, &segs)));
        self.listeners().insert(id, Listener { path: segs, tx });
        drop(root);

        Ok(ListenStream {
            updates: rx,
            detach: Box::new(MemoryDetach {
                id,
                inner: Arc::downgrade(&self.inner),
            }),
        })
    }

    async fn get_range(&self, path: &str, range: OrderedRange) -> Result<Snapshot, SyncError> {
        self.ensure_online("get_range")?;
        self.inner.range_reads.fetch_add(1, Ordering::SeqCst);

        let mut entries = children(&self.root(), &segments(path));
        entries.sort_by(|a, b| {
            let a_order = a.value.get(&range.order_by).and_then(Value::as_i64);
            let b_order = b.value.get(&range.order_by).and_then(Value::as_i64);
            b_order.cmp(&a_order).then_with(|| a.key.cmp(&b.key))
        });

        Ok(entries
            .into_iter()
            .skip(range.offset)
            .take(range.limit)
            .collect())
    }
}

struct MemoryDetach {
    id: u64,
    inner: Weak<Inner>,
}

impl ListenerDetach for MemoryDetach {
    fn detach(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

fn segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Запись по одному пути видна слушателю другого, если один из путей является префиксом другого.
fn related(listened: &[String], written: &[String]) -> bool {
    listened
        .iter()
        .zip(written.iter())
        .all(|(left, right)| left == right)
}

fn value_at<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter()
        .try_fold(root, |node, segment| node.as_object()?.get(segment))
}

fn put_at(root: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *root = if value.is_null() {
            Value::Object(Map::new())
        } else {
            value
        };
        return;
    };

    let mut node = root;
    for segment in parents {
        if !node.is_object() {
            if value.is_null() {
                return;
            }
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else { return };
        node = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    match node {
        Value::Object(map) if value.is_null() => {
            map.remove(last);
        }
        Value::Object(map) => {
            map.insert(last.clone(), value);
        }
        other if !value.is_null() => {
            let mut map = Map::new();
            map.insert(last.clone(), value);
            *other = Value::Object(map);
        }
        _ => {}
    }
}

fn children(root: &Value, path: &[String]) -> Snapshot {
    match value_at(root, path) {
        Some(Value::Object(map)) => {
            let mut entries: Snapshot = map
                .iter()
                .map(|(key, value)| SnapshotEntry {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect();
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            entries
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Map, Value, json};

    use super::InMemoryStore;
    use crate::data::remote_store::{OrderedRange, RemoteStore};
    use crate::domain::error::SyncError;
    use crate::infrastructure::settings::SyncSettings;

    // мутация, которая каждый раз сама меняет значение в обход транзакции
    fn conflicting_increment(
        writer: Arc<InMemoryStore>,
    ) -> impl Fn(Option<Value>) -> Value + Send + Sync {
        move |current: Option<Value>| {
            let next = current.and_then(|v| v.as_i64()).unwrap_or(0) + 1;
            let mut root = writer.root();
            super::put_at(&mut root, &super::segments("counters/c"), json!(next + 100));
            json!(next)
        }
    }

    #[tokio::test]
    async fn set_get_and_remove_nested_paths() {
        let store = InMemoryStore::new();
        store
            .set("posts/p1", json!({"title": "Fern", "interactionCounts": {"likes": 2}}))
            .await
            .expect("set must succeed");

        let likes = store
            .get("posts/p1/interactionCounts/likes")
            .await
            .expect("get must succeed");
        assert_eq!(likes, Some(json!(2)));

        store.remove("posts/p1").await.expect("remove must succeed");
        assert_eq!(store.get("posts/p1").await.expect("get must succeed"), None);
    }

    #[tokio::test]
    async fn update_merges_fields_without_touching_others() {
        let store = InMemoryStore::new();
        store
            .set("posts/p1", json!({"title": "Fern", "body": "old"}))
            .await
            .expect("set must succeed");

        let mut partial = Map::new();
        partial.insert("body".to_string(), json!("new"));
        store
            .update("posts/p1", partial)
            .await
            .expect("update must succeed");

        let post = store
            .get("posts/p1")
            .await
            .expect("get must succeed")
            .expect("post must exist");
        assert_eq!(post, json!({"title": "Fern", "body": "new"}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transactions_do_not_lose_updates() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .transaction("counters/c", &|current: Option<Value>| {
                        json!(current.and_then(|v| v.as_i64()).unwrap_or(0) + 1)
                    })
                    .await
            }));
        }
        for handle in handles {
            handle
                .await
                .expect("task must not panic")
                .expect("transaction must commit");
        }

        let value = store.get("counters/c").await.expect("get must succeed");
        assert_eq!(value, Some(json!(10)));
    }

    #[tokio::test]
    async fn transaction_aborts_after_attempt_bound() {
        let store = Arc::new(InMemoryStore::with_max_transaction_attempts(3));
        store
            .set("counters/c", json!(0))
            .await
            .expect("set must succeed");

        let err = store
            .transaction("counters/c", &conflicting_increment(store.clone()))
            .await
            .expect_err("must abort");

        assert_eq!(
            err,
            SyncError::TransactionAborted {
                path: "counters/c".to_string(),
                attempts: 3,
            }
        );
    }

    #[tokio::test]
    async fn attempt_bound_comes_from_settings() {
        let settings = SyncSettings::from_lookup(|key| {
            (key == "TRANSACTION_MAX_ATTEMPTS").then(|| "2".to_string())
        })
        .expect("settings must parse");
        let store = Arc::new(InMemoryStore::from_settings(&settings));
        store
            .set("counters/c", json!(0))
            .await
            .expect("set must succeed");

        let err = store
            .transaction("counters/c", &conflicting_increment(store.clone()))
            .await
            .expect_err("must abort");

        assert_eq!(
            err,
            SyncError::TransactionAborted {
                path: "counters/c".to_string(),
                attempts: 2,
            }
        );
    }

    #[tokio::test]
    async fn get_range_orders_by_field_descending_then_key() {
        let store = InMemoryStore::new();
        for (key, created_at) in [("a", 1), ("b", 3), ("c", 3), ("d", 2)] {
            store
                .set(&format!("posts/{key}"), json!({"createdAt": created_at}))
                .await
                .expect("set must succeed");
        }

        let page = store
            .get_range(
                "posts",
                OrderedRange {
                    order_by: "createdAt".to_string(),
                    offset: 1,
                    limit: 2,
                },
            )
            .await
            .expect("range must succeed");

        let keys: Vec<&str> = page.iter().map(|entry| entry.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "d"]);
        assert_eq!(store.range_reads(), 1);
    }

    #[tokio::test]
    async fn listener_receives_initial_and_changed_snapshots_until_detached() {
        let store = InMemoryStore::new();
        let mut stream = store.listen("posts").await.expect("listen must succeed");

        let initial = stream.updates.recv().await.expect("initial snapshot");
        assert!(initial.expect("snapshot must be ok").is_empty());

        store
            .set("posts/p1/title", json!("Moth"))
            .await
            .expect("set must succeed");
        let changed = stream
            .updates
            .recv()
            .await
            .expect("changed snapshot")
            .expect("snapshot must be ok");
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].key, "p1");

        stream.detach.detach();
        assert_eq!(store.listener_count("posts"), 0);
        assert!(stream.updates.recv().await.is_none());
    }

    #[tokio::test]
    async fn offline_store_reports_network_failure() {
        let store = InMemoryStore::new();
        store.set_offline(true);

        let err = store.get("posts").await.expect_err("must fail offline");
        assert!(matches!(err, SyncError::NetworkFailure(_)));
    }

    #[tokio::test]
    async fn push_generates_unique_keys() {
        let store = InMemoryStore::new();
        let first = store.push("comments/p1").await.expect("push must succeed");
        let second = store.push("comments/p1").await.expect("push must succeed");
        assert_ne!(first, second);
        assert!(first < second);
    }
}
