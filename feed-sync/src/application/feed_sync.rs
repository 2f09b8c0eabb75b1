use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::auth::{AuthProvider, require_identity};
use super::counters::CounterEngine;
use super::pagination_cache::{PaginationCache, page_key};
use super::realtime::{Subscription, SubscriptionManager};
use crate::data::post_repository::{FetchedPage, Pagination, PostRepository};
use crate::data::remote_store::{RemoteStore, Snapshot};
use crate::data::repositories::remote::post_repository::decode_posts;
use crate::domain::error::SyncError;
use crate::domain::filter::{FeedFilter, matches_feed, matches_query, normalize_query};
use crate::domain::like::LikeToggle;
use crate::domain::post::Post;
use crate::infrastructure::settings::SyncSettings;

const MAX_SUGGESTIONS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationState {
    pub current_page: u32,
    pub page_size: u32,
    pub has_next_page: bool,
    pub active_filter: FeedFilter,
    pub active_query: String,
}

impl PaginationState {
    fn fresh(page_size: u32, filter: FeedFilter, query: String) -> Self {
        Self {
            current_page: 1,
            page_size,
            has_next_page: false,
            active_filter: filter,
            active_query: query,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub number: u32,
    pub posts: Vec<Post>,
    pub has_next_page: bool,
    pub skipped: usize,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedView {
    pub posts: Vec<Post>,
    pub pagination: PaginationState,
}

#[derive(Debug, Clone)]
struct CachedPage {
    posts: Vec<Post>,
    has_next_page: bool,
    skipped: usize,
}

impl CachedPage {
    fn from_fetched(page: FetchedPage, page_size: u32) -> Self {
        Self {
            has_next_page: page.fetched >= page_size as usize,
            posts: page.posts,
            skipped: page.skipped,
        }
    }
}

struct FeedState {
    pagination: PaginationState,
    cache: PaginationCache<CachedPage>,
    loaded: Vec<Post>,
    // оптимистичные значения, ещё не подтверждённые сервером
    pending: HashMap<String, Post>,
    generation: u64,
}

impl FeedState {
    fn visible(&self) -> Vec<Post> {
        let filter = &self.pagination.active_filter;
        let query = &self.pagination.active_query;
        self.loaded
            .iter()
            .filter(|post| matches_feed(post, filter, query))
            .cloned()
            .collect()
    }

    fn view(&self) -> FeedView {
        FeedView {
            posts: self.visible(),
            pagination: self.pagination.clone(),
        }
    }

    fn replace_loaded(&mut self, post: &Post) -> bool {
        match self.loaded.iter_mut().find(|existing| existing.id == post.id) {
            Some(existing) => {
                *existing = post.clone();
                true
            }
            None => false,
        }
    }

    fn replace_cached(&mut self, post: &Post) {
        self.cache.update_all(|page| {
            for cached in page.posts.iter_mut().filter(|cached| cached.id == post.id) {
                *cached = post.clone();
            }
        });
    }

    // Состав ленты изменился: старые страницы сдвинуты, поэтому кэш собирается
    // заново из списка для текущих фильтра и запроса.
    fn reseed_cache(&mut self, resource: &str, posts: &[Post]) {
        self.cache.clear();
        let size = self.pagination.page_size.max(1) as usize;
        let last = self.pagination.current_page.max(1);
        let filter = self.pagination.active_filter;
        let query = self.pagination.active_query.clone();

        for number in 1..=last {
            let start = ((number - 1) as usize * size).min(posts.len());
            let end = if number == last {
                posts.len()
            } else {
                (start + size).min(posts.len())
            };
            let page = CachedPage {
                posts: posts[start..end].to_vec(),
                has_next_page: number < last || self.pagination.has_next_page,
                skipped: 0,
            };
            self.cache.put(page_key(resource, &filter, &query, number), page);
        }
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Синхронизатор одной ленты. Мютекс состояния не держится через `.await`;
/// загрузка, вытесненная новым `load_first_page`, отбрасывается.
pub struct FeedSynchronizer<R: PostRepository> {
    repo: R,
    state: Mutex<FeedState>,
    loading_next: AtomicBool,
    view_tx: watch::Sender<FeedView>,
    suggestion_min_chars: usize,
}

impl<R: PostRepository> FeedSynchronizer<R> {
    pub fn new(repo: R, settings: &SyncSettings) -> Self {
        let pagination =
            PaginationState::fresh(settings.page_size, FeedFilter::default(), String::new());
        let (view_tx, _) = watch::channel(FeedView {
            posts: Vec::new(),
            pagination: pagination.clone(),
        });

        Self {
            repo,
            state: Mutex::new(FeedState {
                pagination,
                cache: PaginationCache::new(settings.cache_ttl(), settings.cache_capacity),
                loaded: Vec::new(),
                pending: HashMap::new(),
                generation: 0,
            }),
            loading_next: AtomicBool::new(false),
            view_tx,
            suggestion_min_chars: settings.suggestion_min_chars,
        }
    }

    pub fn watch(&self) -> watch::Receiver<FeedView> {
        self.view_tx.subscribe()
    }

    pub fn view(&self) -> FeedView {
        self.lock().view()
    }

    pub fn pagination(&self) -> PaginationState {
        self.lock().pagination.clone()
    }

    pub fn resource(&self) -> &str {
        self.repo.collection()
    }

    /// Сбрасывает пагинацию и загружает первую страницу; список заменяется целиком.
    pub async fn load_first_page(&self, filter: FeedFilter, query: &str) -> Result<Page, SyncError> {
        let query = normalize_query(query);
        let (generation, page_size) = {
            let mut state = self.lock();
            let page_size = state.pagination.page_size;
            state.generation += 1;
            state.pagination = PaginationState::fresh(page_size, filter, query.clone());
            (state.generation, page_size)
        };

        let key = page_key(self.resource(), &filter, &query, 1);
        let (cached, from_cache) = self.resolve_page(&key, 1, page_size).await?;

        let mut state = self.lock();
        if state.generation != generation {
            debug!(resource = self.resource(), "first page superseded, discarding");
            return Ok(Page::default());
        }

        state.loaded = dedup_sorted(cached.posts.clone());
        state.pending.clear();
        state.pagination.has_next_page = cached.has_next_page;

        let page = Page {
            number: 1,
            posts: filter_page(&cached.posts, &filter, &query),
            has_next_page: state.pagination.has_next_page,
            skipped: cached.skipped,
            from_cache,
        };
        self.publish(&state);
        info!(
            resource = self.resource(),
            filter = filter.cache_segment(),
            visible = page.posts.len(),
            has_next_page = page.has_next_page,
            from_cache,
            "first page loaded"
        );
        Ok(page)
    }

    /// Пустая страница, если загрузка уже идёт или страниц больше нет.
    /// При ошибке счётчик страниц откатывается.
    pub async fn load_next_page(&self) -> Result<Page, SyncError> {
        if self.loading_next.swap(true, Ordering::SeqCst) {
            debug!(resource = self.resource(), "next page already in flight");
            return Ok(Page::default());
        }
        let _in_flight = InFlight(&self.loading_next);

        let (generation, number, page_size, filter, query) = {
            let mut state = self.lock();
            if !state.pagination.has_next_page {
                return Ok(Page::default());
            }
            state.pagination.current_page += 1;
            (
                state.generation,
                state.pagination.current_page,
                state.pagination.page_size,
                state.pagination.active_filter,
                state.pagination.active_query.clone(),
            )
        };

        let key = page_key(self.resource(), &filter, &query, number);
        let (cached, from_cache) = match self.resolve_page(&key, number, page_size).await {
            Ok(resolved) => resolved,
            Err(err) => {
                let mut state = self.lock();
                if state.generation == generation && state.pagination.current_page == number {
                    state.pagination.current_page = number - 1;
                }
                warn!(resource = self.resource(), page = number, error = %err, "next page failed");
                return Err(err);
            }
        };

        let mut state = self.lock();
        if state.generation != generation {
            debug!(resource = self.resource(), page = number, "next page superseded, discarding");
            return Ok(Page::default());
        }

        let known: HashSet<String> = state.loaded.iter().map(|post| post.id.clone()).collect();
        let fresh: Vec<Post> = cached
            .posts
            .iter()
            .filter(|post| !known.contains(&post.id))
            .cloned()
            .collect();
        state.loaded.extend(fresh);
        state.loaded.sort_by(Post::feed_order);
        state.pagination.has_next_page = cached.has_next_page;

        let page = Page {
            number,
            posts: filter_page(&cached.posts, &filter, &query),
            has_next_page: state.pagination.has_next_page,
            skipped: cached.skipped,
            from_cache,
        };
        self.publish(&state);
        info!(
            resource = self.resource(),
            page = number,
            visible = page.posts.len(),
            has_next_page = page.has_next_page,
            from_cache,
            "next page loaded"
        );
        Ok(page)
    }

    pub fn apply_filter(&self, filter: FeedFilter) -> Vec<Post> {
        let mut state = self.lock();
        state.pagination.active_filter = filter;
        self.publish(&state);
        state.visible()
    }

    pub fn apply_search(&self, query: &str) -> Vec<Post> {
        let mut state = self.lock();
        state.pagination.active_query = normalize_query(query);
        self.publish(&state);
        state.visible()
    }

    /// Заменяет пост в списке и во всех страницах кэша. `false`, если поста нет в списке.
    pub fn update_item(&self, post: Post) -> bool {
        let mut state = self.lock();
        state.pending.remove(&post.id);
        let found = state.replace_loaded(&post);
        state.replace_cached(&post);
        if found {
            self.publish(&state);
        }
        found
    }

    pub fn invalidate(&self) -> usize {
        let prefix = format!("{}|", self.resource());
        let removed = self.lock().cache.invalidate(&prefix);
        debug!(resource = self.resource(), removed, "feed cache invalidated");
        removed
    }

    /// Сводит полный снимок коллекции с загруженным списком. Возвращает число
    /// пропущенных битых записей.
    pub fn apply_remote_snapshot(&self, snapshot: Snapshot) -> usize {
        let decoded = decode_posts(self.resource(), snapshot);
        let mut incoming: HashMap<String, Post> = decoded
            .posts
            .into_iter()
            .map(|post| (post.id.clone(), post))
            .collect();

        let mut state = self.lock();
        let floor = if state.pagination.has_next_page {
            Some(state.loaded.last().map_or(i64::MAX, |post| post.created_at))
        } else {
            None
        };

        let before = state.loaded.len();
        let mut merged = Vec::with_capacity(before);
        // серверные версии, без неподтверждённых оптимистичных значений
        let mut confirmed = Vec::with_capacity(before);
        for post in std::mem::take(&mut state.loaded) {
            let Some(remote) = incoming.remove(&post.id) else {
                continue;
            };
            let settled = state
                .pending
                .get(&post.id)
                .is_none_or(|local| local.interaction_counts == remote.interaction_counts);
            if settled {
                state.pending.remove(&post.id);
                merged.push(remote.clone());
            } else {
                merged.push(post);
            }
            confirmed.push(remote);
        }
        let kept = merged.len();
        let added: Vec<Post> = incoming
            .into_values()
            .filter(|post| floor.is_none_or(|floor| post.created_at >= floor))
            .collect();
        confirmed.extend(added.iter().cloned());
        merged.extend(added);
        merged.sort_by(Post::feed_order);
        confirmed.sort_by(Post::feed_order);

        if kept == before && merged.len() == before {
            for post in &merged {
                if !state.pending.contains_key(&post.id) {
                    state.replace_cached(post);
                }
            }
        } else {
            debug!(
                resource = self.resource(),
                before,
                after = merged.len(),
                "feed membership changed, reseeding page cache"
            );
            state.reseed_cache(self.resource(), &confirmed);
        }
        state.loaded = merged;
        self.publish(&state);
        decoded.skipped
    }

    /// `currently_liked` задаёт только направление оптимистичного изменения.
    pub async fn toggle_like<S: RemoteStore>(
        &self,
        engine: &CounterEngine<S>,
        auth: &dyn AuthProvider,
        post_id: &str,
        currently_liked: bool,
    ) -> Result<LikeToggle, SyncError> {
        let identity = require_identity(auth)?;
        let delta = if currently_liked { -1 } else { 1 };
        let original = self.apply_optimistic(post_id, delta);

        match engine.toggle_like_detailed(post_id, &identity.user_id).await {
            Ok(toggle) => {
                if let Some(mut post) = self.find(post_id) {
                    post.interaction_counts.likes = toggle.likes;
                    self.update_item(post);
                }
                Ok(toggle)
            }
            Err(err) => {
                if let Some(post) = original {
                    self.update_item(post);
                }
                Err(err)
            }
        }
    }

    pub fn suggestions(&self, prefix: &str) -> Vec<String> {
        let prefix = normalize_query(prefix);
        if prefix.chars().count() < self.suggestion_min_chars {
            return Vec::new();
        }

        let state = self.lock();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for post in state.loaded.iter().filter(|post| matches_query(post, &prefix)) {
            let candidates = std::iter::once(post.title.clone()).chain(post.tags.iter().cloned());
            for candidate in candidates {
                if candidate.to_lowercase().contains(&prefix) && seen.insert(candidate.to_lowercase())
                {
                    out.push(candidate);
                    if out.len() == MAX_SUGGESTIONS {
                        return out;
                    }
                }
            }
        }
        out
    }

    fn find(&self, post_id: &str) -> Option<Post> {
        self.lock()
            .loaded
            .iter()
            .find(|post| post.id == post_id)
            .cloned()
    }

    fn apply_optimistic(&self, post_id: &str, delta: i64) -> Option<Post> {
        let mut state = self.lock();
        let original = state.loaded.iter().find(|post| post.id == post_id).cloned()?;

        let mut optimistic = original.clone();
        optimistic.interaction_counts.likes = (optimistic.interaction_counts.likes + delta).max(0);
        state.replace_loaded(&optimistic);
        state.pending.insert(post_id.to_string(), optimistic);
        self.publish(&state);
        Some(original)
    }

    async fn resolve_page(
        &self,
        key: &str,
        number: u32,
        page_size: u32,
    ) -> Result<(CachedPage, bool), SyncError> {
        let hit = self.lock().cache.get(key);
        if let Some(entry) = hit {
            debug!(key, "page cache hit");
            return Ok((entry.payload, true));
        }

        debug!(key, "page cache miss, fetching");
        let fetched = self
            .repo
            .list_posts(Pagination {
                page: number,
                page_size,
            })
            .await?;
        if fetched.skipped > 0 {
            warn!(key, skipped = fetched.skipped, "page contained malformed posts");
        }

        let cached = CachedPage::from_fetched(fetched, page_size);
        self.lock().cache.put(key, cached.clone());
        Ok((cached, false))
    }

    fn publish(&self, state: &FeedState) {
        self.view_tx.send_replace(state.view());
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: PostRepository + 'static> FeedSynchronizer<R> {
    pub async fn attach_realtime<S: RemoteStore>(
        self: &Arc<Self>,
        manager: &SubscriptionManager<S>,
        scope: &str,
    ) -> Result<Subscription, SyncError> {
        let feed = Arc::downgrade(self);
        manager
            .subscribe(self.resource(), scope, move |snapshot| {
                if let Some(feed) = feed.upgrade() {
                    feed.apply_remote_snapshot(snapshot);
                }
            })
            .await
    }
}

fn dedup_sorted(mut posts: Vec<Post>) -> Vec<Post> {
    let mut seen = HashSet::new();
    posts.retain(|post| seen.insert(post.id.clone()));
    posts.sort_by(Post::feed_order);
    posts
}

fn filter_page(posts: &[Post], filter: &FeedFilter, query: &str) -> Vec<Post> {
    let mut visible: Vec<Post> = posts
        .iter()
        .filter(|post| matches_feed(post, filter, query))
        .cloned()
        .collect();
    visible.sort_by(Post::feed_order);
    visible
}
