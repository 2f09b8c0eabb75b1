use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::domain::error::SyncError;

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub key: String,
    pub value: Value,
}

pub type Snapshot = Vec<SnapshotEntry>;

/// Упорядоченная выборка детей пути: по полю `order_by` по убыванию,
/// при равенстве по ключу по возрастанию.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedRange {
    pub order_by: String,
    pub offset: usize,
    pub limit: usize,
}

/// Функция транзакции. Должна быть чистой: хранилище может вызвать её повторно.
pub type Mutation<'a> = &'a (dyn Fn(Option<Value>) -> Value + Send + Sync);

pub trait ListenerDetach: Send + Sync {
    fn detach(&self);
}

pub struct ListenStream {
    pub updates: mpsc::UnboundedReceiver<Result<Snapshot, SyncError>>,
    pub detach: Box<dyn ListenerDetach>,
}

impl std::fmt::Debug for ListenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenStream").finish_non_exhaustive()
    }
}

/// Контракт удалённого документного хранилища с иерархическими путями вида `posts/{id}`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, SyncError>;
    async fn set(&self, path: &str, value: Value) -> Result<(), SyncError>;
    async fn update(&self, path: &str, partial: Map<String, Value>) -> Result<(), SyncError>;
    async fn remove(&self, path: &str) -> Result<(), SyncError>;
    /// Атомарный read-modify-write. При конфликте `mutate` вызывается заново;
    /// возвращает зафиксированное значение.
    async fn transaction(&self, path: &str, mutate: Mutation<'_>) -> Result<Value, SyncError>;
    async fn push(&self, path: &str) -> Result<String, SyncError>;
    async fn listen(&self, path: &str) -> Result<ListenStream, SyncError>;
    async fn get_range(&self, path: &str, range: OrderedRange) -> Result<Snapshot, SyncError>;
}

/// Ограничивает вызов хранилища по времени; истечение превращается в `NetworkFailure`.
pub(crate) async fn bounded<T, F>(timeout: Duration, op: &str, fut: F) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, SyncError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::NetworkFailure(format!(
            "{op} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

pub(crate) fn counter_value(value: Option<&Value>) -> i64 {
    value.and_then(Value::as_i64).unwrap_or(0)
}

pub mod paths {
    pub const POSTS: &str = "posts";

    pub fn post(post_id: &str) -> String {
        format!("posts/{post_id}")
    }

    pub fn post_likes_counter(post_id: &str) -> String {
        format!("posts/{post_id}/interactionCounts/likes")
    }

    pub fn post_comments_counter(post_id: &str) -> String {
        format!("posts/{post_id}/interactionCounts/comments")
    }

    pub fn like(post_id: &str, user_id: &str) -> String {
        format!("likes/{post_id}/{user_id}")
    }

    pub fn comments(post_id: &str) -> String {
        format!("comments/{post_id}")
    }

    pub fn comment(post_id: &str, comment_id: &str) -> String {
        format!("comments/{post_id}/{comment_id}")
    }

    pub fn comment_like_counter(post_id: &str, comment_id: &str) -> String {
        format!("comments/{post_id}/{comment_id}/likeCount")
    }

    pub fn comment_like(comment_id: &str, user_id: &str) -> String {
        format!("commentLikes/{comment_id}/{user_id}")
    }

    pub fn user_posts(user_id: &str) -> String {
        format!("users/{user_id}/posts")
    }

    pub fn user_post(user_id: &str, post_id: &str) -> String {
        format!("users/{user_id}/posts/{post_id}")
    }

    pub fn user_comment_stats(user_id: &str) -> String {
        format!("users/{user_id}/stats/comments")
    }
}
