use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Отметка «нравится». Само наличие записи `likes/{postId}/{userId}` означает лайк.
pub struct LikeRecord {
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Итог переключения лайка: новое состояние и зафиксированное значение счётчика.
pub struct LikeToggle {
    pub liked: bool,
    pub likes: i64,
}
