use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::auth::{AuthProvider, require_identity};
use crate::data::post_repository::{PostPatch, PostRepository};
use crate::data::remote_store::{RemoteStore, bounded, paths};
use crate::domain::error::SyncError;
use crate::domain::post::{Post, PostEdit};

/// Чтение и редактирование постов автором.
///
/// После успешного `edit_post` результат нужно передать в
/// `FeedSynchronizer::update_item`, чтобы лента и кэш увидели правку.
pub struct PostService<R: PostRepository, S: RemoteStore> {
    repo: R,
    store: Arc<S>,
    auth: Arc<dyn AuthProvider>,
    timeout: Duration,
}

impl<R: PostRepository, S: RemoteStore> PostService<R, S> {
    pub fn new(repo: R, store: Arc<S>, auth: Arc<dyn AuthProvider>, timeout: Duration) -> Self {
        Self {
            repo,
            store,
            auth,
            timeout,
        }
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Post, SyncError> {
        self.repo
            .get_post(post_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("post id: {post_id}")))
    }

    pub async fn edit_post(&self, post_id: &str, req: PostEdit) -> Result<Post, SyncError> {
        let identity = require_identity(self.auth.as_ref())?;
        let req = req.validate()?;

        let original = self.get_post(post_id).await?;
        if original.author_id != identity.user_id {
            return Err(SyncError::PermissionDenied);
        }

        let patch = PostPatch {
            title: req.title,
            body: req.body,
            tags: req.tags,
            visibility: req.visibility,
        };
        let updated = self.repo.update_post(post_id, patch).await?;
        self.mirror_to_author(&updated).await;

        info!(post_id, author_id = %updated.author_id, "post edited");
        Ok(updated)
    }

    // Копия в `users/{authorId}/posts` некритична: ошибка только логируется.
    async fn mirror_to_author(&self, post: &Post) {
        let path = paths::user_post(&post.author_id, &post.id);
        let result = match post.to_record() {
            Ok(record) => bounded(self.timeout, "mirror post", self.store.set(&path, record)).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(path, error = %err, "author copy of post not updated");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::PostService;
    use crate::application::auth::StaticAuth;
    use crate::data::memory_store::InMemoryStore;
    use crate::data::post_repository::{FetchedPage, Pagination, PostPatch, PostRepository};
    use crate::data::remote_store::RemoteStore;
    use crate::domain::error::SyncError;
    use crate::domain::post::{InteractionCounts, Post, PostEdit, PostKind, Visibility};

    #[derive(Clone)]
    struct FakePostRepo {
        post_for_get: Arc<Mutex<Option<Post>>>,
        update_call: Arc<Mutex<Option<(String, PostPatch)>>>,
    }

    impl FakePostRepo {
        fn with_post(post: Option<Post>) -> Self {
            Self {
                post_for_get: Arc::new(Mutex::new(post)),
                update_call: Arc::new(Mutex::new(None)),
            }
        }
    }

    #[async_trait]
    impl PostRepository for FakePostRepo {
        fn collection(&self) -> &str {
            "posts"
        }

        async fn list_posts(&self, _pagination: Pagination) -> Result<FetchedPage, SyncError> {
            Ok(FetchedPage::default())
        }

        async fn get_post(&self, _id: &str) -> Result<Option<Post>, SyncError> {
            Ok(self
                .post_for_get
                .lock()
                .expect("post_for_get mutex poisoned")
                .clone())
        }

        async fn update_post(&self, id: &str, patch: PostPatch) -> Result<Post, SyncError> {
            *self
                .update_call
                .lock()
                .expect("update_call mutex poisoned") = Some((id.to_string(), patch.clone()));

            let mut post = self
                .post_for_get
                .lock()
                .expect("post_for_get mutex poisoned")
                .clone()
                .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
            post.title = patch.title;
            post.body = patch.body;
            if let Some(tags) = patch.tags {
                post.tags = tags;
            }
            Ok(post)
        }
    }

    fn sample_post() -> Post {
        Post {
            id: "p1".to_string(),
            author_id: "u1".to_string(),
            author_display_name: "Ann".to_string(),
            kind: PostKind::Plant,
            title: "Fern".to_string(),
            body: "under the oak".to_string(),
            image_ref: None,
            created_at: 10,
            interaction_counts: InteractionCounts::default(),
            visibility: Visibility::Public,
            tags: BTreeSet::new(),
        }
    }

    fn edit(title: &str) -> PostEdit {
        PostEdit {
            title: title.to_string(),
            body: " new body ".to_string(),
            tags: Some(BTreeSet::from([" Ferns ".to_string()])),
            visibility: None,
        }
    }

    #[tokio::test]
    async fn edit_post_updates_and_mirrors_to_author_copy() {
        let repo = FakePostRepo::with_post(Some(sample_post()));
        let store = Arc::new(InMemoryStore::new());
        let service = PostService::new(
            repo.clone(),
            store.clone(),
            Arc::new(StaticAuth::signed_in("u1", "Ann")),
            Duration::from_secs(5),
        );

        let updated = service
            .edit_post("p1", edit("  Royal fern "))
            .await
            .expect("edit must succeed");

        assert_eq!(updated.title, "Royal fern");
        let (id, patch) = repo
            .update_call
            .lock()
            .expect("update_call mutex poisoned")
            .clone()
            .expect("update must be called");
        assert_eq!(id, "p1");
        assert_eq!(patch.body, "new body");
        assert_eq!(patch.tags, Some(BTreeSet::from(["ferns".to_string()])));

        let mirrored = store
            .get("users/u1/posts/p1")
            .await
            .expect("get must succeed")
            .expect("author copy must exist");
        assert_eq!(mirrored["title"], "Royal fern");
    }

    #[tokio::test]
    async fn edit_post_by_stranger_is_denied() {
        let repo = FakePostRepo::with_post(Some(sample_post()));
        let service = PostService::new(
            repo.clone(),
            Arc::new(InMemoryStore::new()),
            Arc::new(StaticAuth::signed_in("u2", "Bob")),
            Duration::from_secs(5),
        );

        let err = service
            .edit_post("p1", edit("Mine now"))
            .await
            .expect_err("stranger edit must fail");

        assert_eq!(err, SyncError::PermissionDenied);
        assert!(
            repo.update_call
                .lock()
                .expect("update_call mutex poisoned")
                .is_none()
        );
    }

    #[tokio::test]
    async fn edit_post_validates_before_lookup() {
        let repo = FakePostRepo::with_post(None);
        let service = PostService::new(
            repo,
            Arc::new(InMemoryStore::new()),
            Arc::new(StaticAuth::signed_in("u1", "Ann")),
            Duration::from_secs(5),
        );

        let err = service
            .edit_post("p1", edit("   "))
            .await
            .expect_err("blank title must fail");
        assert!(matches!(err, SyncError::Validation { field: "title", .. }));

        let err = service
            .edit_post("p1", edit("Fern"))
            .await
            .expect_err("missing post must fail");
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn mirror_failure_does_not_fail_edit() {
        let repo = FakePostRepo::with_post(Some(sample_post()));
        let store = Arc::new(InMemoryStore::new());
        store.set_offline(true);
        let service = PostService::new(
            repo,
            store,
            Arc::new(StaticAuth::signed_in("u1", "Ann")),
            Duration::from_secs(5),
        );

        let updated = service
            .edit_post("p1", edit("Fern again"))
            .await
            .expect("edit must succeed despite mirror failure");
        assert_eq!(updated.title, "Fern again");
    }

    #[tokio::test]
    async fn get_post_maps_absence_to_not_found() {
        let service = PostService::new(
            FakePostRepo::with_post(None),
            Arc::new(InMemoryStore::new()),
            Arc::new(StaticAuth::anonymous()),
            Duration::from_secs(5),
        );

        let err = service.get_post("p9").await.expect_err("must fail");
        assert_eq!(err, SyncError::NotFound("post id: p9".to_string()));
    }
}
