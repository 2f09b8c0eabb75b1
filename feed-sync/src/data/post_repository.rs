use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::domain::error::SyncError;
use crate::domain::post::{Post, Visibility};

#[derive(Debug, Clone)]
pub struct PostPatch {
    pub title: String,
    pub body: String,
    pub tags: Option<BTreeSet<String>>,
    pub visibility: Option<Visibility>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Pagination {
    pub(crate) fn offset(&self) -> usize {
        self.page.saturating_sub(1) as usize * self.page_size as usize
    }
}

/// Страница, прочитанная из хранилища.
///
/// `fetched` считает все полученные записи, включая пропущенные из-за ошибки
/// разбора (`skipped`); по нему определяется, была ли страница полной.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedPage {
    pub posts: Vec<Post>,
    pub fetched: usize,
    pub skipped: usize,
}

#[async_trait]
pub trait PostRepository: Send + Sync {
    /// Путь коллекции, из которой читаются страницы; служит префиксом ключей кэша.
    fn collection(&self) -> &str;
    async fn list_posts(&self, pagination: Pagination) -> Result<FetchedPage, SyncError>;
    async fn get_post(&self, id: &str) -> Result<Option<Post>, SyncError>;
    async fn update_post(&self, id: &str, patch: PostPatch) -> Result<Post, SyncError>;
}
