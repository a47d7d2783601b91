use anyhow::{anyhow, bail, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::post::Post;
use crate::domain::user::User;
use crate::infra::query::QueryClient;
use crate::infra::storage::ObjectStorage;

/// An image the composer will attach. Input is validated and re-encoded
/// to JPEG up front, so a corrupt file fails before anything is uploaded.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    jpeg: Bytes,
}

impl ImageAttachment {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let decoded =
            image::load_from_memory(data).map_err(|err| anyhow!("unreadable image: {}", err))?;
        // JPEG carries no alpha channel.
        let decoded = image::DynamicImage::ImageRgb8(decoded.to_rgb8());

        let mut jpeg = Vec::new();
        decoded
            .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .map_err(|err| anyhow!("failed to encode image: {}", err))?;
        Ok(Self {
            jpeg: Bytes::from(jpeg),
        })
    }

    pub fn from_base64(data: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(data.trim().as_bytes())
            .map_err(|err| anyhow!("invalid base64 image: {}", err))?;
        Self::from_bytes(&raw)
    }

    pub fn as_jpeg(&self) -> Bytes {
        self.jpeg.clone()
    }
}

/// Local composer state: draft text plus an optional attachment. Survives
/// a failed submission so the user can retry without re-entering content.
#[derive(Debug, Default)]
pub struct Composer {
    content: String,
    image: Option<ImageAttachment>,
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn attach_image(&mut self, image: ImageAttachment) {
        self.image = Some(image);
    }

    pub fn remove_image(&mut self) {
        self.image = None;
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    pub fn can_submit(&self) -> bool {
        !self.content.trim().is_empty() || self.image.is_some()
    }

    fn clear(&mut self) {
        self.content.clear();
        self.image = None;
    }
}

#[derive(Serialize)]
struct NewPostRow<'a> {
    user_id: Uuid,
    user_name: &'a str,
    user_email: &'a str,
    content: &'a str,
    image_url: Option<String>,
}

#[derive(Clone)]
pub struct PostService {
    query: QueryClient,
    storage: ObjectStorage,
}

impl PostService {
    pub fn new(query: QueryClient, storage: ObjectStorage) -> Self {
        Self { query, storage }
    }

    /// Submit the composer as a new post. An empty submission (no trimmed
    /// text, no image) is rejected before any request is issued. An image
    /// upload failure aborts the whole submission; there is no
    /// post-without-image fallback. Composer state clears only on success.
    pub async fn create_post(&self, author: &User, composer: &mut Composer) -> Result<Post> {
        let content = composer.content.trim().to_string();
        if content.is_empty() && composer.image.is_none() {
            bail!("add some text or an image before posting");
        }

        let image_url = match composer.image.as_ref() {
            Some(image) => Some(self.upload_image(author.id, image).await?),
            None => None,
        };

        let row = NewPostRow {
            user_id: author.id,
            user_name: &author.display_name,
            user_email: &author.email,
            content: &content,
            image_url,
        };
        let post: Post = self.query.from("posts").insert(&row).await?;

        composer.clear();
        Ok(post)
    }

    /// Keys embed the author and submission time in milliseconds, so rapid
    /// repeated posts by one user cannot collide.
    async fn upload_image(&self, author_id: Uuid, image: &ImageAttachment) -> Result<String> {
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let key = format!("{}_{}.jpg", author_id, millis);
        self.storage
            .upload(&key, image.as_jpeg(), "image/jpeg")
            .await?;
        Ok(self.storage.public_url(&key)?.to_string())
    }
}
