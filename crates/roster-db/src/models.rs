//! Database row types — these map directly to SQLite rows.
//! Field names match column names so rows from `get_as`/`all_as` deserialize directly.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub username: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, with = "int_bool")]
    pub email_verified: bool,
    #[serde(default)]
    pub verification_token: Option<String>,
    #[serde(default, with = "int_bool")]
    pub is_admin: bool,
    #[serde(default)]
    pub school: Option<String>,
    #[serde(default)]
    pub age: Option<i64>,
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogRow {
    pub id: String,
    pub title: String,
    pub content: String,
    /// Not enforced: the author may since have been deleted.
    pub author_id: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRow {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettingsRow {
    pub user_id: String,
    pub localstorage_data: Option<String>,
    pub theme: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: String,
    pub user_id: String,
    pub created_at: i64,
    pub expires_at: i64,
}

impl SessionRow {
    /// `now` uses the same unit as `expires_at` (epoch milliseconds).
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp_millis())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRow {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub target_id: String,
    pub user_id: String,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikeRow {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub target_id: String,
    pub user_id: String,
    pub created_at: i64,
}

/// SQLite has no boolean type; flags are stored as 0/1 and may be NULL on
/// rows written before the column existed.
mod int_bool {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(i64::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(Option::<i64>::deserialize(deserializer)?.is_some_and(|v| v != 0))
    }
}
