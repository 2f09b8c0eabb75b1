use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::filter::FeedFilter;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CACHE_CAPACITY: usize = 50;

/// Ключ страницы: `{resource}|{filter}|{query}|{page}`.
///
/// Ресурс идёт первым, поэтому `invalidate(resource)` снимает все страницы ресурса.
pub fn page_key(resource: &str, filter: &FeedFilter, normalized_query: &str, page: u32) -> String {
    format!(
        "{resource}|{}|{normalized_query}|{page}",
        filter.cache_segment()
    )
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub payload: V,
    pub fetched_at: Instant,
}

/// Вытеснение FIFO: при переполнении уходит запись, вставленная раньше всех,
/// независимо от того, как часто её читали.
#[derive(Debug)]
pub struct PaginationCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    order: VecDeque<String>,
    ttl: Duration,
    capacity: usize,
}

impl<V: Clone> Default for PaginationCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL, DEFAULT_CACHE_CAPACITY)
    }
}

impl<V: Clone> PaginationCache<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) => entry.fetched_at.elapsed() > self.ttl,
        };
        if expired {
            self.remove(key);
            return None;
        }
        self.entries.get(key).cloned()
    }

    // повторная вставка ключа считается новой вставкой
    pub fn put(&mut self, key: impl Into<String>, payload: V) {
        let key = key.into();
        self.remove(&key);

        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }

        self.order.push_back(key.clone());
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                payload,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Удаляет все записи, ключ которых начинается с `prefix`. Возвращает число удалённых.
    pub fn invalidate(&mut self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        let entries = &self.entries;
        self.order.retain(|key| entries.contains_key(key));
        before - self.entries.len()
    }

    pub fn update_all(&mut self, mut f: impl FnMut(&mut V)) {
        for entry in self.entries.values_mut() {
            f(&mut entry.payload);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|existing| existing != key);
        }
    }
}
