use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::SyncError;

const MAX_COMMENT_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Комментарий к посту. `parent_id == None` означает комментарий верхнего уровня.
pub struct Comment {
    #[serde(default)]
    pub id: String,
    pub post_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub author_id: String,
    pub author_display_name: String,
    pub body: String,
    pub created_at: i64,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub edited: bool,
}

impl Comment {
    pub fn from_record(post_id: &str, key: &str, value: Value) -> Result<Self, SyncError> {
        let mut comment: Comment = serde_json::from_value(value)
            .map_err(|err| SyncError::malformed(format!("comments/{post_id}/{key}"), err))?;
        if comment.post_id != post_id {
            return Err(SyncError::Deserialization {
                path: format!("comments/{post_id}/{key}"),
                message: format!("belongs to post '{}'", comment.post_id),
            });
        }
        comment.id = key.to_string();
        Ok(comment)
    }

    pub fn to_record(&self) -> Result<Value, SyncError> {
        let mut value =
            serde_json::to_value(self).map_err(|err| SyncError::Unexpected(err.to_string()))?;
        if let Value::Object(map) = &mut value {
            map.remove("id");
        }
        Ok(value)
    }
}

#[derive(Debug, Clone)]
/// Запрос на создание комментария.
pub struct NewComment {
    pub post_id: String,
    pub parent_id: Option<String>,
    pub body: String,
}

impl NewComment {
    pub fn validate(self) -> Result<Self, SyncError> {
        if self.post_id.trim().is_empty() {
            return Err(SyncError::Validation {
                field: "post_id",
                message: "must not be empty",
            });
        }
        let parent_id = match self.parent_id {
            Some(parent_id) if parent_id.trim().is_empty() => {
                return Err(SyncError::Validation {
                    field: "parent_id",
                    message: "must not be blank",
                });
            }
            other => other,
        };
        Ok(Self {
            post_id: self.post_id,
            parent_id,
            body: normalize_comment_body(&self.body)?,
        })
    }
}

pub(crate) fn normalize_comment_body(body: &str) -> Result<String, SyncError> {
    let body = body.trim();
    if body.is_empty() || body.chars().count() > MAX_COMMENT_CHARS {
        return Err(SyncError::Validation {
            field: "body",
            message: "must be 1..2000 chars",
        });
    }
    Ok(body.to_string())
}
