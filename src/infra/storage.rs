use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use url::Url;

use crate::infra::api::{Api, BackendError};

/// Storage capability: binary object upload plus public URL resolution for
/// a single bucket.
#[derive(Clone)]
pub struct ObjectStorage {
    api: Api,
    bucket: String,
}

impl ObjectStorage {
    pub fn new(api: Api, bucket: impl Into<String>) -> Self {
        Self {
            api,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn upload(
        &self,
        key: &str,
        payload: Bytes,
        content_type: &str,
    ) -> Result<(), BackendError> {
        let url = self
            .api
            .endpoint(&format!("storage/v1/object/{}/{}", self.bucket, key))?;
        let response = self
            .api
            .request(Method::POST, url)
            .header(CONTENT_TYPE, content_type)
            .body(payload)
            .send()
            .await?;
        Api::check(response).await?;
        Ok(())
    }

    /// Publicly retrievable URL for an uploaded object. Purely local URL
    /// construction; no request is issued.
    pub fn public_url(&self, key: &str) -> Result<Url, BackendError> {
        self.api
            .endpoint(&format!("storage/v1/object/public/{}/{}", self.bucket, key))
    }
}
