pub(crate) mod auth;
pub(crate) mod comment_service;
pub(crate) mod counters;
pub(crate) mod feed_sync;
pub(crate) mod pagination_cache;
pub(crate) mod post_service;
pub(crate) mod realtime;
pub(crate) mod search_debouncer;
