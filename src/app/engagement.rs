use anyhow::{bail, Result};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::engagement::{Comment, Like};
use crate::domain::post::FeedPost;
use crate::domain::user::User;
use crate::infra::query::QueryClient;

#[derive(Serialize)]
struct NewLikeRow {
    post_id: Uuid,
    user_id: Uuid,
}

#[derive(Serialize)]
struct NewCommentRow<'a> {
    post_id: Uuid,
    user_id: Uuid,
    user_name: &'a str,
    content: &'a str,
}

#[derive(Clone)]
pub struct EngagementService {
    query: QueryClient,
}

impl EngagementService {
    pub fn new(query: QueryClient) -> Self {
        Self { query }
    }

    pub async fn like(&self, post_id: Uuid, user_id: Uuid) -> Result<Like> {
        let like: Like = self
            .query
            .from("likes")
            .insert(&NewLikeRow { post_id, user_id })
            .await?;
        Ok(like)
    }

    pub async fn unlike(&self, post_id: Uuid, user_id: Uuid) -> Result<()> {
        self.query
            .from("likes")
            .eq("post_id", post_id)
            .eq("user_id", user_id)
            .delete()
            .await?;
        Ok(())
    }

    /// Full comment bodies for one post, newest first. Fetched only when a
    /// thread opens; the feed itself carries counts alone.
    pub async fn list_comments(&self, post_id: Uuid) -> Result<Vec<Comment>> {
        Ok(self
            .query
            .from("comments")
            .eq("post_id", post_id)
            .order_desc("created_at")
            .fetch()
            .await?)
    }

    pub async fn add_comment(
        &self,
        post_id: Uuid,
        author: &User,
        content: &str,
    ) -> Result<Comment> {
        let content = content.trim();
        if content.is_empty() {
            bail!("comment cannot be empty");
        }
        let comment: Comment = self
            .query
            .from("comments")
            .insert(&NewCommentRow {
                post_id,
                user_id: author.id,
                user_name: &author.display_name,
                content,
            })
            .await?;
        Ok(comment)
    }
}

/// Per-post local interaction state: the viewer's like flag, counters, the
/// lazily loaded comment thread and the comment draft. Mutations apply
/// optimistically and are never rolled back here; `reconcile` re-applies
/// the authoritative aggregation result (last full fetch wins).
#[derive(Debug)]
pub struct PostInteraction {
    post_id: Uuid,
    pub liked: bool,
    pub likes_count: i64,
    pub comments_count: i64,
    comments: Option<Vec<Comment>>,
    draft: String,
}

impl PostInteraction {
    pub fn from_feed_post(post: &FeedPost) -> Self {
        Self {
            post_id: post.post.id,
            liked: post.user_liked,
            likes_count: post.likes_count,
            comments_count: post.comments_count,
            comments: None,
            draft: String::new(),
        }
    }

    pub fn post_id(&self) -> Uuid {
        self.post_id
    }

    /// Flip the like state. Local state updates before the backend call
    /// resolves; a failure surfaces to the caller but the optimistic state
    /// stays until the next reconcile. Rapid double-toggles are not
    /// debounced; the backend's row semantics decide and the next full
    /// fetch converges.
    pub async fn toggle_like(
        &mut self,
        engagement: &EngagementService,
        viewer_id: Uuid,
    ) -> Result<()> {
        let was_liked = self.liked;
        self.liked = !was_liked;
        self.likes_count = if was_liked {
            (self.likes_count - 1).max(0)
        } else {
            self.likes_count + 1
        };

        if was_liked {
            engagement.unlike(self.post_id, viewer_id).await?;
        } else {
            engagement.like(self.post_id, viewer_id).await?;
        }
        Ok(())
    }

    /// Load the thread on first open; subsequent opens reuse it.
    pub async fn open_thread(&mut self, engagement: &EngagementService) -> Result<&[Comment]> {
        if self.comments.is_none() {
            self.comments = Some(engagement.list_comments(self.post_id).await?);
        }
        Ok(self.comments.as_deref().unwrap_or(&[]))
    }

    pub fn comments(&self) -> Option<&[Comment]> {
        self.comments.as_deref()
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, draft: impl Into<String>) {
        self.draft = draft.into();
    }

    pub fn can_comment(&self) -> bool {
        !self.draft.trim().is_empty()
    }

    /// Submit the draft. Empty drafts are inert: no request, no error. On
    /// success the count was already bumped, the draft clears, and the
    /// thread re-fetches to pick up the server-assigned order.
    pub async fn submit_comment(
        &mut self,
        engagement: &EngagementService,
        author: &User,
    ) -> Result<()> {
        if !self.can_comment() {
            return Ok(());
        }

        self.comments_count += 1;
        let draft = self.draft.clone();
        engagement.add_comment(self.post_id, author, &draft).await?;

        self.draft.clear();
        self.comments = Some(engagement.list_comments(self.post_id).await?);
        Ok(())
    }

    /// Re-apply the authoritative aggregation result.
    pub fn reconcile(&mut self, authoritative: &FeedPost) {
        if authoritative.post.id != self.post_id {
            return;
        }
        self.liked = authoritative.user_liked;
        self.likes_count = authoritative.likes_count;
        self.comments_count = authoritative.comments_count;
    }
}
