use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::auth::{AuthProvider, require_identity};
use super::counters::CounterEngine;
use crate::data::remote_store::{RemoteStore, bounded, paths};
use crate::domain::comment::{Comment, NewComment, normalize_comment_body};
use crate::domain::error::SyncError;
use crate::domain::like::LikeToggle;
use crate::infrastructure::settings::SyncSettings;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentPage {
    pub comments: Vec<Comment>,
    pub skipped: usize,
}

pub struct CommentService<S: RemoteStore> {
    store: Arc<S>,
    auth: Arc<dyn AuthProvider>,
    counters: CounterEngine<S>,
    fetch_timeout: Duration,
    max_depth: usize,
}

impl<S: RemoteStore> CommentService<S> {
    pub fn new(store: Arc<S>, auth: Arc<dyn AuthProvider>, settings: &SyncSettings) -> Self {
        Self {
            counters: CounterEngine::new(store.clone(), settings.transaction_timeout()),
            store,
            auth,
            fetch_timeout: settings.fetch_timeout(),
            max_depth: settings.comment_max_depth,
        }
    }

    /// Создаёт комментарий и увеличивает счётчик комментариев поста.
    ///
    /// Ответ допускается только на комментарий того же поста и не глубже `max_depth`.
    pub async fn add_comment(&self, req: NewComment) -> Result<Comment, SyncError> {
        let identity = require_identity(self.auth.as_ref())?;
        let req = req.validate()?;

        if let Some(parent_id) = &req.parent_id {
            let parent_depth = self.depth_of(&req.post_id, parent_id).await?;
            if parent_depth >= self.max_depth {
                return Err(SyncError::Validation {
                    field: "parent_id",
                    message: "comment nesting is too deep",
                });
            }
        }

        let id = bounded(
            self.fetch_timeout,
            "comment id",
            self.store.push(&paths::comments(&req.post_id)),
        )
        .await?;
        let comment = Comment {
            id,
            post_id: req.post_id,
            parent_id: req.parent_id,
            author_id: identity.user_id,
            author_display_name: identity.display_name,
            body: req.body,
            created_at: Utc::now().timestamp_millis(),
            like_count: 0,
            edited: false,
        };

        bounded(
            self.fetch_timeout,
            "comment write",
            self.store.set(
                &paths::comment(&comment.post_id, &comment.id),
                comment.to_record()?,
            ),
        )
        .await?;

        let comments = self
            .counters
            .increment_counter(&paths::post_comments_counter(&comment.post_id))
            .await?;

        if let Err(err) = self
            .counters
            .increment_counter(&paths::user_comment_stats(&comment.author_id))
            .await
        {
            warn!(user_id = %comment.author_id, error = %err, "comment stats not updated");
        }

        info!(
            post_id = %comment.post_id,
            comment_id = %comment.id,
            comments,
            "comment added"
        );
        Ok(comment)
    }

    pub async fn edit_comment(
        &self,
        post_id: &str,
        comment_id: &str,
        body: &str,
    ) -> Result<Comment, SyncError> {
        let identity = require_identity(self.auth.as_ref())?;
        let body = normalize_comment_body(body)?;

        let mut comment = self.get_comment(post_id, comment_id).await?;
        if comment.author_id != identity.user_id {
            return Err(SyncError::PermissionDenied);
        }

        let mut partial = Map::new();
        partial.insert("body".to_string(), Value::String(body.clone()));
        partial.insert("edited".to_string(), Value::Bool(true));
        bounded(
            self.fetch_timeout,
            "comment update",
            self.store.update(&paths::comment(post_id, comment_id), partial),
        )
        .await?;

        comment.body = body;
        comment.edited = true;
        info!(post_id, comment_id, "comment edited");
        Ok(comment)
    }

    /// Комментарии поста по `createdAt` по возрастанию.
    pub async fn list_comments(&self, post_id: &str) -> Result<CommentPage, SyncError> {
        let value = bounded(
            self.fetch_timeout,
            "list comments",
            self.store.get(&paths::comments(post_id)),
        )
        .await?;

        let Some(Value::Object(records)) = value else {
            return Ok(CommentPage::default());
        };

        let mut page = CommentPage::default();
        for (key, record) in records {
            match Comment::from_record(post_id, &key, record) {
                Ok(comment) => page.comments.push(comment),
                Err(err) => {
                    warn!(post_id, comment_id = %key, error = %err, "skipping malformed comment");
                    page.skipped += 1;
                }
            }
        }
        page.comments.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(page)
    }

    pub async fn toggle_comment_like(
        &self,
        post_id: &str,
        comment_id: &str,
    ) -> Result<LikeToggle, SyncError> {
        let identity = require_identity(self.auth.as_ref())?;
        self.get_comment(post_id, comment_id).await?;
        self.counters
            .toggle_comment_like(post_id, comment_id, &identity.user_id)
            .await
    }

    async fn get_comment(&self, post_id: &str, comment_id: &str) -> Result<Comment, SyncError> {
        let value = bounded(
            self.fetch_timeout,
            "get comment",
            self.store.get(&paths::comment(post_id, comment_id)),
        )
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("comment id: {comment_id}")))?;

        Comment::from_record(post_id, comment_id, value)
    }

    // Глубина комментария верхнего уровня равна 1.
    async fn depth_of(&self, post_id: &str, comment_id: &str) -> Result<usize, SyncError> {
        let mut depth = 1;
        let mut current = self.get_comment(post_id, comment_id).await?;
        while let Some(parent_id) = current.parent_id.take() {
            depth += 1;
            if depth > self.max_depth {
                break;
            }
            current = self.get_comment(post_id, &parent_id).await?;
        }
        Ok(depth)
    }
}
