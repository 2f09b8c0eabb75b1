use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::data::post_repository::{FetchedPage, Pagination, PostPatch, PostRepository};
use crate::data::remote_store::{OrderedRange, RemoteStore, SnapshotEntry, bounded, paths};
use crate::domain::error::SyncError;
use crate::domain::post::Post;

const ORDER_FIELD: &str = "createdAt";

#[derive(Clone)]
pub struct RemotePostRepository<S: RemoteStore> {
    store: Arc<S>,
    collection: String,
    fetch_timeout: Duration,
}

impl<S: RemoteStore> RemotePostRepository<S> {
    /// Репозиторий общей ленты `posts`.
    pub fn new(store: Arc<S>, fetch_timeout: Duration) -> Self {
        Self::for_collection(store, paths::POSTS, fetch_timeout)
    }

    /// Репозиторий поверх произвольной коллекции копий постов,
    /// например `users/{userId}/posts`.
    pub fn for_collection(
        store: Arc<S>,
        collection: impl Into<String>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            fetch_timeout,
        }
    }

    fn document(&self, id: &str) -> String {
        format!("{}/{id}", self.collection)
    }
}

#[async_trait]
impl<S: RemoteStore> PostRepository for RemotePostRepository<S> {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn list_posts(&self, pagination: Pagination) -> Result<FetchedPage, SyncError> {
        let range = OrderedRange {
            order_by: ORDER_FIELD.to_string(),
            offset: pagination.offset(),
            limit: pagination.page_size as usize,
        };
        let entries = bounded(
            self.fetch_timeout,
            "list posts",
            self.store.get_range(&self.collection, range),
        )
        .await?;

        Ok(decode_posts(&self.collection, entries))
    }

    async fn get_post(&self, id: &str) -> Result<Option<Post>, SyncError> {
        let value = bounded(
            self.fetch_timeout,
            "get post",
            self.store.get(&self.document(id)),
        )
        .await?;

        value.map(|value| Post::from_record(id, value)).transpose()
    }

    async fn update_post(&self, id: &str, patch: PostPatch) -> Result<Post, SyncError> {
        let mut partial = Map::new();
        partial.insert("title".to_string(), Value::String(patch.title));
        partial.insert("body".to_string(), Value::String(patch.body));
        if let Some(tags) = patch.tags {
            partial.insert("tags".to_string(), json!(tags));
        }
        if let Some(visibility) = patch.visibility {
            partial.insert(
                "visibility".to_string(),
                serde_json::to_value(visibility)
                    .map_err(|err| SyncError::Unexpected(err.to_string()))?,
            );
        }

        bounded(
            self.fetch_timeout,
            "update post",
            self.store.update(&self.document(id), partial),
        )
        .await?;

        self.get_post(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("post id: {id}")))
    }
}

/// Разбирает записи коллекции. Битые записи пропускаются и учитываются в `skipped`.
pub(crate) fn decode_posts(collection: &str, entries: Vec<SnapshotEntry>) -> FetchedPage {
    let fetched = entries.len();
    let mut posts = Vec::with_capacity(fetched);
    let mut skipped = 0;

    for entry in entries {
        match Post::from_record(&entry.key, entry.value) {
            Ok(post) => posts.push(post),
            Err(err) => {
                skipped += 1;
                warn!(collection, key = %entry.key, error = %err, "skipping malformed post");
            }
        }
    }

    FetchedPage {
        posts,
        fetched,
        skipped,
    }
}
