use anyhow::Result;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::engagement::{CommentRef, LikeRef};
use crate::domain::post::{FeedPost, Post};
use crate::infra::query::QueryClient;
use crate::infra::realtime::{ChangeKind, ChangeNotification, RealtimeClient, Subscription};

/// Turn three independently fetched relations into one denormalized view
/// list. Single pass per relation; output order is exactly the input post
/// order (the backend's order-by, including its tie-break, is preserved).
/// Likes and comments referencing posts outside `posts` contribute
/// nothing.
pub fn aggregate(
    posts: Vec<Post>,
    likes: &[LikeRef],
    comments: &[CommentRef],
    viewer_id: Option<Uuid>,
) -> Vec<FeedPost> {
    let mut likes_by_post: HashMap<Uuid, i64> = HashMap::new();
    let mut liked_by_viewer: HashSet<Uuid> = HashSet::new();
    for like in likes {
        *likes_by_post.entry(like.post_id).or_insert(0) += 1;
        if viewer_id == Some(like.user_id) {
            liked_by_viewer.insert(like.post_id);
        }
    }

    let mut comments_by_post: HashMap<Uuid, i64> = HashMap::new();
    for comment in comments {
        *comments_by_post.entry(comment.post_id).or_insert(0) += 1;
    }

    posts
        .into_iter()
        .map(|post| {
            let likes_count = likes_by_post.get(&post.id).copied().unwrap_or(0);
            let comments_count = comments_by_post.get(&post.id).copied().unwrap_or(0);
            let user_liked = liked_by_viewer.contains(&post.id);
            FeedPost {
                post,
                likes_count,
                comments_count,
                user_liked,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedScope {
    /// Every post in the system, newest first.
    Home,
    /// One user's posts, newest first.
    User(Uuid),
}

#[derive(Clone)]
pub struct FeedService {
    query: QueryClient,
}

impl FeedService {
    pub fn new(query: QueryClient) -> Self {
        Self { query }
    }

    pub async fn fetch(&self, scope: FeedScope, viewer_id: Option<Uuid>) -> Result<Vec<FeedPost>> {
        match scope {
            FeedScope::Home => self.fetch_home_feed(viewer_id).await,
            FeedScope::User(user_id) => self.fetch_user_posts(user_id, viewer_id).await,
        }
    }

    /// The three fetches carry no snapshot guarantee; a write landing
    /// between them is visible or not, and the next refresh converges.
    pub async fn fetch_home_feed(&self, viewer_id: Option<Uuid>) -> Result<Vec<FeedPost>> {
        let posts: Vec<Post> = self
            .query
            .from("posts")
            .order_desc("created_at")
            .fetch()
            .await?;
        let likes: Vec<LikeRef> = self
            .query
            .from("likes")
            .select("post_id, user_id")
            .fetch()
            .await?;
        let comments: Vec<CommentRef> = self
            .query
            .from("comments")
            .select("post_id")
            .fetch()
            .await?;

        Ok(aggregate(posts, &likes, &comments, viewer_id))
    }

    pub async fn fetch_user_posts(
        &self,
        user_id: Uuid,
        viewer_id: Option<Uuid>,
    ) -> Result<Vec<FeedPost>> {
        let posts: Vec<Post> = self
            .query
            .from("posts")
            .eq("user_id", user_id)
            .order_desc("created_at")
            .fetch()
            .await?;
        if posts.is_empty() {
            return Ok(Vec::new());
        }

        let post_ids: Vec<Uuid> = posts.iter().map(|post| post.id).collect();
        let likes: Vec<LikeRef> = self
            .query
            .from("likes")
            .select("post_id, user_id")
            .in_list("post_id", &post_ids)
            .fetch()
            .await?;
        let comments: Vec<CommentRef> = self
            .query
            .from("comments")
            .select("post_id")
            .in_list("post_id", &post_ids)
            .fetch()
            .await?;

        Ok(aggregate(posts, &likes, &comments, viewer_id))
    }
}

/// Live feed view model. Holds the latest aggregation result, re-fetches
/// on change notifications (patching counters in place when the payload
/// allows it) and discards stale responses from overlapping re-fetches.
/// Dropping the view releases its subscription.
pub struct FeedView {
    inner: Arc<ViewInner>,
    task: JoinHandle<()>,
}

struct ViewInner {
    feed: FeedService,
    scope: FeedScope,
    viewer_id: Option<Uuid>,
    posts: watch::Sender<Vec<FeedPost>>,
    issued: AtomicU64,
    applied: Mutex<u64>,
}

impl FeedView {
    pub async fn open(
        feed: FeedService,
        realtime: &RealtimeClient,
        scope: FeedScope,
        viewer_id: Option<Uuid>,
    ) -> Result<Self> {
        let (posts, _) = watch::channel(Vec::new());
        let inner = Arc::new(ViewInner {
            feed,
            scope,
            viewer_id,
            posts,
            issued: AtomicU64::new(0),
            applied: Mutex::new(0),
        });
        inner.refresh().await?;

        let (topic, builder) = match scope {
            FeedScope::Home => {
                let topic = "feed:home".to_string();
                let builder = realtime.channel(&topic).on_table("posts");
                (topic, builder)
            }
            FeedScope::User(user_id) => {
                let topic = format!("feed:user:{}", user_id);
                let builder = realtime
                    .channel(&topic)
                    .on_table_filtered("posts", &format!("user_id=eq.{}", user_id));
                (topic, builder)
            }
        };
        let subscription = builder
            .on_table("likes")
            .on_table("comments")
            .subscribe()
            .await?;
        debug!(topic = %topic, "feed view subscribed");

        let task = tokio::spawn(watch_changes(inner.clone(), subscription));
        Ok(Self { inner, task })
    }

    pub fn posts(&self) -> Vec<FeedPost> {
        self.inner.posts.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<FeedPost>> {
        self.inner.posts.subscribe()
    }

    pub async fn refresh(&self) -> Result<()> {
        self.inner.refresh().await
    }
}

impl Drop for FeedView {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ViewInner {
    /// Re-fetch and publish, unless a later refresh already landed. Each
    /// refresh takes a sequence number; a response sequenced below the
    /// last applied one is stale and dropped.
    async fn refresh(&self) -> Result<()> {
        let seq = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let posts = self.feed.fetch(self.scope, self.viewer_id).await?;

        let mut applied = self.applied.lock().expect("sequence lock poisoned");
        if seq < *applied {
            debug!(seq, applied = *applied, "discarding stale feed response");
            return Ok(());
        }
        *applied = seq;
        self.posts.send_replace(posts);
        Ok(())
    }

    /// Apply a change in place when it only moves counters. Returns false
    /// when the view must fall back to a full re-fetch: post rows change
    /// membership or ordering, and payloads without a usable row image
    /// cannot be patched.
    fn patch(&self, change: &ChangeNotification) -> bool {
        match change.table.as_str() {
            "likes" => match change.kind {
                ChangeKind::Insert => {
                    let Some(like) = row::<LikeRef>(&change.new) else {
                        return false;
                    };
                    self.bump(like.post_id, |post| {
                        post.likes_count += 1;
                        if self.viewer_id == Some(like.user_id) {
                            post.user_liked = true;
                        }
                    });
                    true
                }
                ChangeKind::Delete => {
                    let Some(like) = row::<LikeRef>(&change.old) else {
                        return false;
                    };
                    self.bump(like.post_id, |post| {
                        post.likes_count = (post.likes_count - 1).max(0);
                        if self.viewer_id == Some(like.user_id) {
                            post.user_liked = false;
                        }
                    });
                    true
                }
                ChangeKind::Update => false,
            },
            "comments" => match change.kind {
                ChangeKind::Insert => {
                    let Some(comment) = row::<CommentRef>(&change.new) else {
                        return false;
                    };
                    self.bump(comment.post_id, |post| post.comments_count += 1);
                    true
                }
                ChangeKind::Delete => {
                    let Some(comment) = row::<CommentRef>(&change.old) else {
                        return false;
                    };
                    self.bump(comment.post_id, |post| {
                        post.comments_count = (post.comments_count - 1).max(0);
                    });
                    true
                }
                // Body edits do not move counters.
                ChangeKind::Update => true,
            },
            "posts" => false,
            _ => true,
        }
    }

    fn bump(&self, post_id: Uuid, apply: impl FnOnce(&mut FeedPost)) {
        self.posts.send_if_modified(|posts| {
            match posts.iter_mut().find(|post| post.post.id == post_id) {
                Some(post) => {
                    apply(post);
                    true
                }
                // A change for a post outside this view; nothing to do.
                None => false,
            }
        });
    }
}

async fn watch_changes(inner: Arc<ViewInner>, mut subscription: Subscription) {
    while let Some(change) = subscription.next().await {
        if inner.patch(&change) {
            continue;
        }
        if let Err(err) = inner.refresh().await {
            warn!(error = ?err, "feed refresh after change failed");
        }
    }
    debug!("feed subscription ended");
}

fn row<T: DeserializeOwned>(value: &Option<Value>) -> Option<T> {
    value
        .clone()
        .and_then(|value| serde_json::from_value(value).ok())
}
