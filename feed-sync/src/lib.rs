//! Слой синхронизации ленты наблюдений и социальных взаимодействий.
//!
//! Поверх удалённого документного хранилища (`RemoteStore`) библиотека даёт:
//! - постраничную загрузку ленты с TTL-кэшем страниц (`FeedSynchronizer`);
//! - живые обновления через не более чем одну подписку на пару ресурс/область
//!   (`SubscriptionManager`);
//! - счётчики лайков и комментариев на транзакциях хранилища без локальных
//!   блокировок (`CounterEngine`);
//! - дебаунс поисковых запросов (`SearchDebouncer`).
//!
//! Хранилище и провайдер аутентификации передаются явно. Для тестов и локальной
//! работы есть `InMemoryStore` и `StaticAuth`.

mod application;
mod data;
mod domain;
mod infrastructure;

pub use application::auth::{AuthProvider, Identity, StaticAuth};
pub use application::comment_service::{CommentPage, CommentService};
pub use application::counters::CounterEngine;
pub use application::feed_sync::{FeedSynchronizer, FeedView, Page, PaginationState};
pub use application::pagination_cache::{
    CacheEntry, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL, PaginationCache, page_key,
};
pub use application::post_service::PostService;
pub use application::realtime::{GLOBAL_SCOPE, Subscription, SubscriptionKey, SubscriptionManager};
pub use application::search_debouncer::{
    Debounced, SearchDebouncer, SearchRequest, SearchStream, run_search_dispatch,
};
pub use data::memory_store::InMemoryStore;
pub use data::post_repository::{FetchedPage, Pagination, PostPatch, PostRepository};
pub use data::remote_store::{
    ListenStream, ListenerDetach, Mutation, OrderedRange, RemoteStore, Snapshot, SnapshotEntry,
    paths,
};
pub use data::repositories::remote::post_repository::RemotePostRepository;
pub use domain::comment::{Comment, NewComment};
pub use domain::error::SyncError;
pub use domain::filter::{FeedFilter, matches_feed, matches_query, normalize_query};
pub use domain::like::{LikeRecord, LikeToggle};
pub use domain::post::{InteractionCounts, Post, PostEdit, PostKind, Visibility};
pub use infrastructure::logging::init_logging;
pub use infrastructure::settings::SyncSettings;
