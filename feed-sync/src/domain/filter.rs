use super::post::{Post, PostKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
/// Фильтр ленты. Пустой фильтр пропускает всё.
pub struct FeedFilter {
    pub kind: Option<PostKind>,
}

impl FeedFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kind(kind: PostKind) -> Self {
        Self { kind: Some(kind) }
    }

    pub fn matches(&self, post: &Post) -> bool {
        self.kind.is_none_or(|kind| post.kind == kind)
    }

    pub(crate) fn cache_segment(&self) -> &'static str {
        self.kind.map(|kind| kind.as_str()).unwrap_or("ALL")
    }
}

/// Приводит поисковую строку к виду, по которому строится ключ кэша и идёт сравнение.
pub fn normalize_query(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Регистронезависимый поиск подстроки по заголовку, тексту, автору и тегам.
/// `query` должен быть уже нормализован.
pub fn matches_query(post: &Post, query: &str) -> bool {
    if query.is_empty() {
        return true;
    }
    post.title.to_lowercase().contains(query)
        || post.body.to_lowercase().contains(query)
        || post.author_display_name.to_lowercase().contains(query)
        || post.tags.iter().any(|tag| tag.to_lowercase().contains(query))
}

/// Предикат ленты: совпадение категории И совпадение поисковой строки.
pub fn matches_feed(post: &Post, filter: &FeedFilter, query: &str) -> bool {
    filter.matches(post) && matches_query(post, query)
}
