use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Like {
    pub id: Uuid,
    pub post_id: Uuid,
    pub user_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub post_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Column projection of a like row, the only shape the aggregator needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LikeRef {
    pub post_id: Uuid,
    pub user_id: Uuid,
}

/// Column projection of a comment row for counting. Bodies load lazily,
/// per post, through the comment thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentRef {
    pub post_id: Uuid,
}
