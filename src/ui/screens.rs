use anyhow::Result;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use uuid::Uuid;

use crate::app::engagement::{EngagementService, PostInteraction};
use crate::app::feed::{FeedScope, FeedService, FeedView};
use crate::app::posts::{Composer, ImageAttachment, PostService};
use crate::domain::post::FeedPost;
use crate::domain::user::User;
use crate::ui::format::format_timestamp;
use crate::AppState;

const MIN_PASSWORD_LEN: usize = 6;

/// Thin interactive front end: renders aggregation results and forwards
/// user intents to the services. Every failure surfaces once as an alert
/// line; nothing is retried.
pub struct Shell {
    state: AppState,
    feed: FeedService,
    posts: PostService,
    engagement: EngagementService,
    input: Lines<BufReader<Stdin>>,
}

impl Shell {
    pub fn new(state: AppState) -> Self {
        let feed = FeedService::new(state.query.clone());
        let posts = PostService::new(state.query.clone(), state.storage.clone());
        let engagement = EngagementService::new(state.query.clone());
        let input = BufReader::new(tokio::io::stdin()).lines();
        Self {
            state,
            feed,
            posts,
            engagement,
            input,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            match self.state.session.current_user() {
                Some(user) => {
                    if !self.main_screen(user).await? {
                        return Ok(());
                    }
                }
                None => {
                    if !self.login_screen().await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns false when the user quits.
    async fn login_screen(&mut self) -> Result<bool> {
        println!();
        println!("Sign in to continue.");
        println!("  login <email> <password>");
        println!("  register <email> <password> <display name>");
        println!("  quit");

        loop {
            let Some(line) = self.prompt("auth> ").await? else {
                return Ok(false);
            };
            let mut parts = line.split_whitespace();
            match parts.next() {
                None => continue,
                Some("quit") | Some("exit") => return Ok(false),
                Some("login") => {
                    let (Some(email), Some(password)) = (parts.next(), parts.next()) else {
                        alert("usage: login <email> <password>");
                        continue;
                    };
                    if !self.credentials_valid(email, password) {
                        continue;
                    }
                    match self.state.auth.sign_in_with_password(email, password).await {
                        Ok(_) => {
                            self.await_profile().await;
                            return Ok(true);
                        }
                        Err(err) => alert(&format!("login failed: {}", err)),
                    }
                }
                Some("register") => {
                    let (Some(email), Some(password)) = (parts.next(), parts.next()) else {
                        alert("usage: register <email> <password> <display name>");
                        continue;
                    };
                    let display_name = parts.collect::<Vec<_>>().join(" ");
                    if display_name.is_empty() {
                        alert("usage: register <email> <password> <display name>");
                        continue;
                    }
                    if !self.credentials_valid(email, password) {
                        continue;
                    }
                    match self.state.auth.sign_up(email, password, &display_name).await {
                        Ok(_) => {
                            self.await_profile().await;
                            return Ok(true);
                        }
                        Err(err) => alert(&format!("registration failed: {}", err)),
                    }
                }
                Some(other) => alert(&format!("unknown command: {}", other)),
            }
        }
    }

    fn credentials_valid(&self, email: &str, password: &str) -> bool {
        if !validate_email(email) {
            alert("please enter a valid email address");
            return false;
        }
        if !validate_password(password) {
            alert("password must be at least 6 characters");
            return false;
        }
        true
    }

    /// The session store updates from the auth-event listener; wait for the
    /// profile to land before switching screens.
    async fn await_profile(&self) {
        let mut session = self.state.session.subscribe();
        let resolved = tokio::time::timeout(
            Duration::from_secs(10),
            session.wait_for(|snapshot| snapshot.user.is_some()),
        )
        .await;
        if resolved.is_err() {
            alert("signed in, but the profile did not load yet");
        }
    }

    /// Returns false when the user quits, true to fall back to the login
    /// screen after logout.
    async fn main_screen(&mut self, user: User) -> Result<bool> {
        let view = FeedView::open(
            self.feed.clone(),
            &self.state.realtime,
            FeedScope::Home,
            Some(user.id),
        )
        .await?;
        let mut interactions = sync_interactions(Vec::new(), &view.posts());
        let mut composer = Composer::new();

        render_feed(&view.posts(), &interactions);
        println!();
        println!("Commands: feed, profile, post <text>, attach <path>, like <n>,");
        println!("          comments <n>, comment <n> <text>, logout, quit");

        loop {
            let Some(line) = self.prompt("> ").await? else {
                return Ok(false);
            };
            let line = line.trim();
            let (command, rest) = match line.split_once(' ') {
                Some((command, rest)) => (command, rest.trim()),
                None => (line, ""),
            };

            match command {
                "" => continue,
                "feed" | "refresh" => {
                    if let Err(err) = view.refresh().await {
                        alert(&format!("could not refresh the feed: {}", err));
                        continue;
                    }
                    interactions = sync_interactions(interactions, &view.posts());
                    render_feed(&view.posts(), &interactions);
                }
                "profile" => self.profile_screen(&user).await,
                "post" => {
                    composer.set_content(rest);
                    match self.posts.create_post(&user, &mut composer).await {
                        Ok(_) => println!("Posted!"),
                        Err(err) => alert(&err.to_string()),
                    }
                }
                "attach" => match std::fs::read(rest) {
                    Ok(data) => match ImageAttachment::from_bytes(&data) {
                        Ok(image) => {
                            composer.attach_image(image);
                            println!("Image attached.");
                        }
                        Err(err) => alert(&err.to_string()),
                    },
                    Err(err) => alert(&format!("could not read {}: {}", rest, err)),
                },
                "like" => {
                    let Some(interaction) = parse_index(rest, &mut interactions) else {
                        alert("usage: like <post number>");
                        continue;
                    };
                    if let Err(err) = interaction.toggle_like(&self.engagement, user.id).await {
                        alert(&format!("could not update like: {}", err));
                    }
                    render_feed(&view.posts(), &interactions);
                }
                "comments" => {
                    let Some(interaction) = parse_index(rest, &mut interactions) else {
                        alert("usage: comments <post number>");
                        continue;
                    };
                    match interaction.open_thread(&self.engagement).await {
                        Ok(comments) => render_thread(comments),
                        Err(err) => alert(&format!("could not load comments: {}", err)),
                    }
                }
                "comment" => {
                    let (index, text) = match rest.split_once(' ') {
                        Some((index, text)) => (index, text.trim()),
                        None => (rest, ""),
                    };
                    let Some(interaction) = parse_index(index, &mut interactions) else {
                        alert("usage: comment <post number> <text>");
                        continue;
                    };
                    interaction.set_draft(text);
                    if !interaction.can_comment() {
                        continue;
                    }
                    if let Err(err) = interaction.submit_comment(&self.engagement, &user).await {
                        alert(&format!("could not add comment: {}", err));
                    }
                }
                "logout" => match self.state.session.logout(&self.state.auth).await {
                    Ok(()) => return Ok(true),
                    Err(err) => alert(&format!("logout failed: {}", err)),
                },
                "quit" | "exit" => return Ok(false),
                other => alert(&format!("unknown command: {}", other)),
            }
        }
    }

    async fn profile_screen(&self, user: &User) {
        println!();
        println!("{} <{}>", user.display_name, user.email);
        match self.feed.fetch_user_posts(user.id, Some(user.id)).await {
            Ok(posts) => {
                let interactions = sync_interactions(Vec::new(), &posts);
                render_feed(&posts, &interactions);
            }
            Err(err) => alert(&format!("could not load your posts: {}", err)),
        }
    }

    async fn prompt(&mut self, prompt: &str) -> Result<Option<String>> {
        use std::io::Write;
        print!("{}", prompt);
        std::io::stdout().flush()?;
        Ok(self.input.next_line().await?)
    }
}

fn alert(message: &str) {
    println!("! {}", message);
}

fn render_feed(posts: &[FeedPost], interactions: &[PostInteraction]) {
    if posts.is_empty() {
        println!("No posts yet. Be the first to share!");
        return;
    }
    for (index, (post, interaction)) in posts.iter().zip(interactions).enumerate() {
        let heart = if interaction.liked { "liked" } else { "like" };
        println!();
        println!(
            "[{}] {} ({})",
            index,
            post.post.user_name,
            format_timestamp(post.post.created_at)
        );
        if !post.post.content.is_empty() {
            println!("    {}", post.post.content);
        }
        if let Some(url) = &post.post.image_url {
            println!("    image: {}", url);
        }
        println!(
            "    [{}] {} likes, {} comments",
            heart, interaction.likes_count, interaction.comments_count
        );
    }
}

fn render_thread(comments: &[crate::domain::engagement::Comment]) {
    if comments.is_empty() {
        println!("No comments yet.");
        return;
    }
    for comment in comments {
        println!(
            "  {} ({}): {}",
            comment.user_name,
            format_timestamp(comment.created_at),
            comment.content
        );
    }
}

/// Carry interaction state across a re-render: reconcile rows that are
/// still present, create fresh state for new ones, drop the rest.
fn sync_interactions(existing: Vec<PostInteraction>, posts: &[FeedPost]) -> Vec<PostInteraction> {
    let mut by_id: HashMap<Uuid, PostInteraction> = existing
        .into_iter()
        .map(|interaction| (interaction.post_id(), interaction))
        .collect();
    posts
        .iter()
        .map(|post| match by_id.remove(&post.post.id) {
            Some(mut interaction) => {
                interaction.reconcile(post);
                interaction
            }
            None => PostInteraction::from_feed_post(post),
        })
        .collect()
}

fn parse_index<'a>(
    raw: &str,
    interactions: &'a mut [PostInteraction],
) -> Option<&'a mut PostInteraction> {
    let index: usize = raw.trim().parse().ok()?;
    interactions.get_mut(index)
}

fn validate_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.contains(char::is_whitespace)
}

fn validate_password(password: &str) -> bool {
    password.len() >= MIN_PASSWORD_LEN
}
