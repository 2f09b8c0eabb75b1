use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostKind {
    Plant,
    Insect,
    Other,
}

impl PostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostKind::Plant => "PLANT",
            PostKind::Insect => "INSECT",
            PostKind::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionCounts {
    #[serde(default)]
    pub likes: i64,
    #[serde(default)]
    pub comments: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Идентификатор поста совпадает с ключом документа `posts/{id}`.
pub struct Post {
    #[serde(default)]
    pub id: String,
    pub author_id: String,
    pub author_display_name: String,
    pub kind: PostKind,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    // миллисекунды от эпохи
    pub created_at: i64,
    #[serde(default)]
    pub interaction_counts: InteractionCounts,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Post {
    pub fn from_record(key: &str, value: Value) -> Result<Self, SyncError> {
        let mut post: Post = serde_json::from_value(value)
            .map_err(|err| SyncError::malformed(format!("posts/{key}"), err))?;
        post.id = key.to_string();
        Ok(post)
    }

    pub fn to_record(&self) -> Result<Value, SyncError> {
        let mut value =
            serde_json::to_value(self).map_err(|err| SyncError::Unexpected(err.to_string()))?;
        if let Value::Object(map) = &mut value {
            map.remove("id");
        }
        Ok(value)
    }

    /// Порядок ленты: `createdAt` по убыванию, при равенстве `id` по возрастанию.
    pub fn feed_order(a: &Post, b: &Post) -> Ordering {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostEdit {
    pub title: String,
    pub body: String,
    pub tags: Option<BTreeSet<String>>,
    pub visibility: Option<Visibility>,
}

impl PostEdit {
    pub fn validate(self) -> Result<Self, SyncError> {
        Ok(Self {
            title: normalize_title(&self.title)?,
            body: normalize_body(&self.body)?,
            tags: self.tags.map(normalize_tags),
            visibility: self.visibility,
        })
    }
}

fn normalize_title(title: &str) -> Result<String, SyncError> {
    let title = title.trim();
    if title.is_empty() || title.chars().count() > 120 {
        return Err(SyncError::Validation {
            field: "title",
            message: "must be 1..120 chars",
        });
    }
    Ok(title.to_string())
}

fn normalize_body(body: &str) -> Result<String, SyncError> {
    let body = body.trim();
    if body.chars().count() > 5000 {
        return Err(SyncError::Validation {
            field: "body",
            message: "must be at most 5000 chars",
        });
    }
    Ok(body.to_string())
}

fn normalize_tags(tags: BTreeSet<String>) -> BTreeSet<String> {
    tags.into_iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect()
}
