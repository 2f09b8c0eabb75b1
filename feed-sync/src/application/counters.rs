use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::data::remote_store::{RemoteStore, bounded, counter_value, paths};
use crate::domain::error::SyncError;
use crate::domain::like::{LikeRecord, LikeToggle};

/// Атомарные счётчики поверх транзакций хранилища.
///
/// Локальных блокировок нет: счётчик сериализуется только транзакцией хранилища,
/// через которую проходят и другие устройства.
pub struct CounterEngine<S: RemoteStore> {
    store: Arc<S>,
    timeout: Duration,
}

impl<S: RemoteStore> CounterEngine<S> {
    pub fn new(store: Arc<S>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Переключает лайк поста; `true` означает, что пост теперь лайкнут.
    pub async fn toggle_like(&self, post_id: &str, user_id: &str) -> Result<bool, SyncError> {
        Ok(self.toggle_like_detailed(post_id, user_id).await?.liked)
    }

    /// То же, что `toggle_like`, но вместе с зафиксированным значением счётчика.
    pub async fn toggle_like_detailed(
        &self,
        post_id: &str,
        user_id: &str,
    ) -> Result<LikeToggle, SyncError> {
        validate_ids(post_id, user_id)?;
        // лайк несуществующего поста создал бы в `posts/` заготовку со счётчиком
        bounded(self.timeout, "post lookup", self.store.get(&paths::post(post_id)))
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("post id: {post_id}")))?;
        let toggle = self
            .toggle_membership(
                &paths::like(post_id, user_id),
                &paths::post_likes_counter(post_id),
            )
            .await?;
        info!(post_id, user_id, liked = toggle.liked, likes = toggle.likes, "post like toggled");
        Ok(toggle)
    }

    /// Лайк комментария: запись `commentLikes/{commentId}/{userId}` и счётчик `likeCount`.
    pub async fn toggle_comment_like(
        &self,
        post_id: &str,
        comment_id: &str,
        user_id: &str,
    ) -> Result<LikeToggle, SyncError> {
        validate_ids(post_id, user_id)?;
        if comment_id.trim().is_empty() {
            return Err(SyncError::Validation {
                field: "comment_id",
                message: "must not be empty",
            });
        }
        let toggle = self
            .toggle_membership(
                &paths::comment_like(comment_id, user_id),
                &paths::comment_like_counter(post_id, comment_id),
            )
            .await?;
        info!(
            post_id,
            comment_id,
            user_id,
            liked = toggle.liked,
            likes = toggle.likes,
            "comment like toggled"
        );
        Ok(toggle)
    }

    /// Безусловный инкремент счётчика; возвращает зафиксированное значение.
    pub async fn increment_counter(&self, path: &str) -> Result<i64, SyncError> {
        self.transact(path, &increment).await
    }

    // Запись и счётчик меняются двумя отдельными шагами. Если транзакция счётчика
    // не прошла, запись откатывается по возможности.
    async fn toggle_membership(
        &self,
        record_path: &str,
        counter_path: &str,
    ) -> Result<LikeToggle, SyncError> {
        let existing = bounded(self.timeout, "like lookup", self.store.get(record_path)).await?;

        match existing {
            Some(record) => {
                bounded(self.timeout, "like remove", self.store.remove(record_path)).await?;
                match self.transact(counter_path, &decrement).await {
                    Ok(likes) => Ok(LikeToggle {
                        liked: false,
                        likes,
                    }),
                    Err(err) => {
                        self.compensate(record_path, Some(record)).await;
                        Err(err)
                    }
                }
            }
            None => {
                let record = serde_json::to_value(LikeRecord {
                    created_at: Utc::now().timestamp_millis(),
                })
                .map_err(|err| SyncError::Unexpected(err.to_string()))?;
                bounded(self.timeout, "like write", self.store.set(record_path, record)).await?;
                match self.transact(counter_path, &increment).await {
                    Ok(likes) => Ok(LikeToggle { liked: true, likes }),
                    Err(err) => {
                        self.compensate(record_path, None).await;
                        Err(err)
                    }
                }
            }
        }
    }

    async fn transact(
        &self,
        path: &str,
        mutate: &(dyn Fn(Option<Value>) -> Value + Send + Sync),
    ) -> Result<i64, SyncError> {
        let committed = bounded(
            self.timeout,
            "counter transaction",
            self.store.transaction(path, mutate),
        )
        .await?;
        Ok(counter_value(Some(&committed)))
    }

    async fn compensate(&self, record_path: &str, restore: Option<Value>) {
        let result = match restore {
            Some(record) => {
                bounded(self.timeout, "like restore", self.store.set(record_path, record)).await
            }
            None => bounded(self.timeout, "like rollback", self.store.remove(record_path)).await,
        };
        if let Err(err) = result {
            warn!(record_path, error = %err, "like record left out of sync with counter");
        }
    }
}

fn validate_ids(post_id: &str, user_id: &str) -> Result<(), SyncError> {
    if user_id.trim().is_empty() {
        return Err(SyncError::NotAuthenticated);
    }
    if post_id.trim().is_empty() {
        return Err(SyncError::Validation {
            field: "post_id",
            message: "must not be empty",
        });
    }
    Ok(())
}

fn increment(current: Option<Value>) -> Value {
    json!(counter_value(current.as_ref()) + 1)
}

fn decrement(current: Option<Value>) -> Value {
    json!((counter_value(current.as_ref()) - 1).max(0))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Map, Value, json};

    use super::CounterEngine;
    use crate::data::memory_store::InMemoryStore;
    use crate::data::remote_store::{
        ListenStream, Mutation, OrderedRange, RemoteStore, Snapshot,
    };
    use crate::domain::error::SyncError;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn toggle_twice_restores_count_and_removes_record() {
        let store = Arc::new(InMemoryStore::new());
        seed_post(&store, "p1", 4).await;
        let engine = CounterEngine::new(store.clone(), TIMEOUT);

        let liked = engine.toggle_like("p1", "u1").await.expect("like must succeed");
        assert!(liked);
        assert_eq!(likes(&store, "p1").await, 5);
        assert!(store.get("likes/p1/u1").await.expect("get").is_some());

        let liked = engine.toggle_like("p1", "u1").await.expect("unlike must succeed");
        assert!(!liked);
        assert_eq!(likes(&store, "p1").await, 4);
        assert!(store.get("likes/p1/u1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn unlike_never_drives_counter_below_zero() {
        let store = Arc::new(InMemoryStore::new());
        seed_post(&store, "p1", 0).await;
        store
            .set("likes/p1/u1", json!({"createdAt": 1}))
            .await
            .expect("set must succeed");
        let engine = CounterEngine::new(store.clone(), TIMEOUT);

        let toggle = engine
            .toggle_like_detailed("p1", "u1")
            .await
            .expect("unlike must succeed");
        assert!(!toggle.liked);
        assert_eq!(toggle.likes, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_likes_from_distinct_users_converge() {
        let store = Arc::new(InMemoryStore::new());
        seed_post(&store, "p1", 0).await;
        let engine = Arc::new(CounterEngine::new(store.clone(), TIMEOUT));

        let mut handles = Vec::new();
        for i in 0..12 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.toggle_like("p1", &format!("u{i}")).await
            }));
        }
        for handle in handles {
            let liked = handle
                .await
                .expect("task must not panic")
                .expect("toggle must succeed");
            assert!(liked);
        }

        assert_eq!(likes(&store, "p1").await, 12);
    }

    #[tokio::test]
    async fn liking_missing_post_is_not_found_and_writes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let engine = CounterEngine::new(store.clone(), TIMEOUT);

        let err = engine
            .toggle_like("ghost", "u1")
            .await
            .expect_err("missing post must fail");

        assert_eq!(err, SyncError::NotFound("post id: ghost".to_string()));
        assert!(store.get("posts/ghost").await.expect("get").is_none());
        assert!(store.get("likes/ghost/u1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn blank_user_fails_before_touching_store() {
        let store = Arc::new(InMemoryStore::new());
        store.set_offline(true);
        let engine = CounterEngine::new(store, TIMEOUT);

        let err = engine.toggle_like("p1", " ").await.expect_err("must fail");
        assert_eq!(err, SyncError::NotAuthenticated);
    }

    #[tokio::test]
    async fn increment_counter_is_unconditional() {
        let store = Arc::new(InMemoryStore::new());
        let engine = CounterEngine::new(store.clone(), TIMEOUT);

        assert_eq!(engine.increment_counter("posts/p1/interactionCounts/comments").await, Ok(1));
        assert_eq!(engine.increment_counter("posts/p1/interactionCounts/comments").await, Ok(2));
    }

    #[tokio::test]
    async fn comment_like_uses_comment_counter() {
        let store = Arc::new(InMemoryStore::new());
        let engine = CounterEngine::new(store.clone(), TIMEOUT);

        let toggle = engine
            .toggle_comment_like("p1", "c1", "u1")
            .await
            .expect("comment like must succeed");
        assert!(toggle.liked);
        assert_eq!(
            store.get("comments/p1/c1/likeCount").await.expect("get"),
            Some(json!(1))
        );
        assert!(store.get("commentLikes/c1/u1").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn failed_counter_transaction_rolls_back_record_write() {
        let inner = InMemoryStore::new();
        seed_post(&inner, "p1", 0).await;
        let store = Arc::new(AbortingTransactions {
            inner: inner.clone(),
        });
        let engine = CounterEngine::new(store, TIMEOUT);

        let err = engine
            .toggle_like("p1", "u1")
            .await
            .expect_err("transaction must fail");
        assert!(matches!(err, SyncError::TransactionAborted { .. }));
        assert!(inner.get("likes/p1/u1").await.expect("get").is_none());
    }

    struct AbortingTransactions {
        inner: InMemoryStore,
    }

    #[async_trait]
    impl RemoteStore for AbortingTransactions {
        async fn get(&self, path: &str) -> Result<Option<Value>, SyncError> {
            self.inner.get(path).await
        }

        async fn set(&self, path: &str, value: Value) -> Result<(), SyncError> {
            self.inner.set(path, value).await
        }

        async fn update(&self, path: &str, partial: Map<String, Value>) -> Result<(), SyncError> {
            self.inner.update(path, partial).await
        }

        async fn remove(&self, path: &str) -> Result<(), SyncError> {
            self.inner.remove(path).await
        }

        async fn transaction(&self, path: &str, _mutate: Mutation<'_>) -> Result<Value, SyncError> {
            Err(SyncError::TransactionAborted {
                path: path.to_string(),
                attempts: 25,
            })
        }

        async fn push(&self, path: &str) -> Result<String, SyncError> {
            self.inner.push(path).await
        }

        async fn listen(&self, path: &str) -> Result<ListenStream, SyncError> {
            self.inner.listen(path).await
        }

        async fn get_range(
            &self,
            path: &str,
            range: OrderedRange,
        ) -> Result<Snapshot, SyncError> {
            self.inner.get_range(path, range).await
        }
    }

    async fn seed_post(store: &InMemoryStore, id: &str, likes: i64) {
        store
            .set(
                &format!("posts/{id}"),
                json!({
                    "authorId": "author",
                    "authorDisplayName": "Author",
                    "kind": "INSECT",
                    "title": "Bee",
                    "createdAt": 1,
                    "interactionCounts": {"likes": likes, "comments": 0},
                }),
            )
            .await
            .expect("seed must succeed");
    }

    async fn likes(store: &InMemoryStore, id: &str) -> i64 {
        store
            .get(&format!("posts/{id}/interactionCounts/likes"))
            .await
            .expect("get must succeed")
            .and_then(|value| value.as_i64())
            .expect("counter must exist")
    }
}
