use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Raw post row as stored by the backend. Author fields are a denormalized
/// snapshot taken at creation time, not a live reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub user_email: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// View-ready post row with aggregated counters attached. Produced by the
/// feed aggregator; never stored.
#[derive(Debug, Clone, Serialize)]
pub struct FeedPost {
    pub post: Post,
    pub likes_count: i64,
    pub comments_count: i64,
    pub user_liked: bool,
}

impl FeedPost {
    pub fn id(&self) -> Uuid {
        self.post.id
    }
}
